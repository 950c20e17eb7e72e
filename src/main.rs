use anyhow::Context;
use nodelink::domain::features::registry::characteristic_uuid;
use nodelink::domain::features::FeatureClass;
use nodelink::domain::settings::SettingsService;
use nodelink::infrastructure::bluetooth::protocol::CONFIG_CONTROL_UUID;
use nodelink::infrastructure::bluetooth::simulated::{
    SimulatedAdapter, SimulatedBoard, ENVIRONMENT_MASK,
};
use nodelink::infrastructure::logging::init_logger;
use nodelink::{CommandRequest, ConnectionState, FeatureCommand, NodeService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const BOARD_ADDRESS: &str = "C0:FF:EE:00:00:01";
const ENVIRONMENT_FEATURES: [&str; 3] = ["Pressure", "Humidity", "Temperature"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = match SettingsService::new() {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to locate settings, using defaults: {e}");
            SettingsService::with_path(std::env::temp_dir().join("nodelink-settings.json"))
        }
    };
    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {e}"))
        .ok();

    info!("Starting NodeLink demo");

    let board = Arc::new(SimulatedBoard::sensor_node(BOARD_ADDRESS));
    let adapter = Arc::new(SimulatedAdapter::new());
    adapter.add(board.clone());

    let (scan_tx, mut scan_rx) = mpsc::unbounded_channel();
    let service = NodeService::new(adapter.clone(), settings_service.session_config(), scan_tx);

    service.scanner().start();
    for report in adapter.scan(-42) {
        service.scanner().process_report(report);
    }
    service.scanner().stop();
    while let Ok(event) = scan_rx.try_recv() {
        info!(?event, "Scan event");
    }

    let device = service
        .scanner()
        .device(BOARD_ADDRESS)
        .context("simulated board was not recognised")?;
    println!(
        "Found {} ({:?}, protocol v{}, rssi {})",
        device.identity.name, device.identity.board_model, device.identity.protocol_version, device.rssi
    );

    let session = service.connect(BOARD_ADDRESS).await?;
    session
        .wait_for(ConnectionState::Ready, Duration::from_secs(5))
        .await?;
    println!("Connected, payload size {} bytes", session.max_payload());
    if let Err(e) = settings_service.set_last_connected(BOARD_ADDRESS) {
        warn!("Failed to persist last connected address: {}", e);
    }

    for feature in session.features() {
        println!("  {feature}");
    }

    let environment: Vec<_> = ENVIRONMENT_FEATURES
        .iter()
        .filter_map(|name| session.feature(name))
        .collect();
    let mut updates = session.updates(&environment);
    if !session.subscribe(&environment).await? {
        warn!("Board refused environmental notifications");
    }

    let env_uuid = characteristic_uuid(FeatureClass::Standard, ENVIRONMENT_MASK);
    for step in 0..3i32 {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(100_000i32 + step * 25).to_le_bytes());
        payload.extend_from_slice(&(450u16 + step as u16).to_le_bytes());
        payload.extend_from_slice(&(230i16 + step as i16).to_le_bytes());
        board.notify_sample(env_uuid, &payload);
    }

    for _ in 0..environment.len() * 3 {
        match tokio::time::timeout(Duration::from_secs(1), updates.recv()).await {
            Ok(Some(update)) => {
                println!("[{:>5}] {:<12} {:?}", update.timestamp, update.name, update.sample)
            }
            _ => break,
        }
    }

    // the board answers on the configuration characteristic with the switch status
    board.on_write(CONFIG_CONTROL_UUID, |written| {
        let (prefix, command) = written.split_at(written.len().checked_sub(1)?);
        let mut reply = vec![0x00, 0x00];
        reply.extend_from_slice(prefix);
        reply.extend_from_slice(&[command[0], command[0]]);
        Some(reply)
    });

    if let Some(switch) = session.feature("Switch") {
        let command = FeatureCommand::new(switch, CommandRequest::Switch { on: true });
        match session
            .write_command(&command, Duration::from_secs(1), 2, Duration::from_millis(100))
            .await?
        {
            Some(response) => println!("Switch response: {response:?}"),
            None => println!("Switch command got no response"),
        }
    }

    session.unsubscribe(&environment).await?;
    service.disconnect_all();
    info!("Demo finished");
    Ok(())
}
