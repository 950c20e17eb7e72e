use nodelink::domain::features::registry::characteristic_uuid;
use nodelink::domain::features::{ExternalFamily, FeatureClass};
use nodelink::infrastructure::bluetooth::advertise::AdvertisementDecoder;
use nodelink::infrastructure::bluetooth::protocol::CONFIG_CONTROL_UUID;
use nodelink::infrastructure::bluetooth::simulated::{
    SimulatedAdapter, SimulatedBoard, SimulatedOperation, ENVIRONMENT_MASK, HEART_RATE_ID,
};
use nodelink::infrastructure::bluetooth::transport::{
    CharacteristicProperties as Props, GattCharacteristic, GattService,
};
use nodelink::infrastructure::bluetooth::SessionContext;
use nodelink::{
    CommandRequest, ConnectionSession, ConnectionState, FeatureCommand, FeatureResponse,
    FeatureSample, NodeService, SessionError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);
const TEMPERATURE_MASK: u32 = 0x0004_0000;
const HUMIDITY_MASK: u32 = 0x0008_0000;

fn env_uuid() -> Uuid {
    characteristic_uuid(FeatureClass::Standard, ENVIRONMENT_MASK)
}

fn env_payload(pressure: i32, humidity: u16, temperature: i16) -> Vec<u8> {
    let mut payload = pressure.to_le_bytes().to_vec();
    payload.extend_from_slice(&humidity.to_le_bytes());
    payload.extend_from_slice(&temperature.to_le_bytes());
    payload
}

fn session(board: &Arc<SimulatedBoard>) -> ConnectionSession {
    let identity = AdvertisementDecoder::default()
        .decode(&board.advertisement())
        .unwrap();
    ConnectionSession::new(board.clone(), identity, SessionContext::with_defaults())
}

async fn ready(board: &Arc<SimulatedBoard>) -> ConnectionSession {
    let session = session(board);
    session.connect().await.unwrap();
    session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();
    session
}

fn scalar(sample: &FeatureSample) -> f32 {
    match sample {
        FeatureSample::Scalar { value, .. } => *value,
        other => panic!("expected a scalar, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_cycle_through_service() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    let adapter = Arc::new(SimulatedAdapter::new());
    adapter.add(board.clone());
    let (tx, _events) = mpsc::unbounded_channel();
    let service = NodeService::new(adapter.clone(), Default::default(), tx);

    service.scanner().start();
    for report in adapter.scan(-60) {
        service.scanner().process_report(report);
    }
    let session = service.connect("AA").await.unwrap();
    session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();

    let environment: Vec<_> = ["Pressure", "Humidity", "Temperature"]
        .iter()
        .map(|name| session.feature(name).unwrap())
        .collect();
    let mut updates = session.updates(&environment);
    assert!(session.subscribe(&environment).await.unwrap());
    assert!(board.is_notifying(env_uuid()));

    assert!(board.notify_sample(env_uuid(), &env_payload(100_000, 455, 235)));
    let mut received = Vec::new();
    for _ in 0..3 {
        let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        received.push((update.name, scalar(&update.sample)));
    }
    assert_eq!(
        received,
        vec![("Pressure", 1000.0), ("Humidity", 45.5), ("Temperature", 23.5)]
    );

    assert!(session.unsubscribe(&environment).await.unwrap());
    assert!(!board.is_notifying(env_uuid()));

    service.disconnect_all();
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.features().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ready_follows_services_discovered() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    let session = session(&board);
    let mut transitions = session.transitions();
    session.connect().await.unwrap();
    session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(transition) = transitions.try_recv() {
        if let Some(last) = seen.last() {
            assert_eq!(transition.previous, *last);
        }
        seen.push(transition.current);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::ServicesDiscovered,
            ConnectionState::Ready,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_command_without_response_is_empty() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    board.set_echo(true);
    let session = ready(&board).await;
    let switch = session.feature("Switch").unwrap();

    let mut command = FeatureCommand::new(switch, CommandRequest::Switch { on: false });
    command.has_response = false;
    let response = session
        .write_command(&command, WAIT, 0, Duration::ZERO)
        .await
        .unwrap();
    assert!(matches!(response, Some(FeatureResponse::Empty { command_id: 0x00, .. })));
    assert_eq!(board.writes_to(CONFIG_CONTROL_UUID).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_board_times_out() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    let session = ready(&board).await;
    let switch = session.feature("Switch").unwrap();

    let command = FeatureCommand::new(switch, CommandRequest::Switch { on: true });
    let response = session
        .write_command(&command, Duration::from_millis(500), 0, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(response, None);
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_echo_round_trip() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    board.set_echo(true);
    let session = ready(&board).await;
    let temperature = session.feature("Temperature").unwrap();

    let command = FeatureCommand::new(
        temperature.clone(),
        CommandRequest::Raw {
            command_id: 0x42,
            params: vec![0xAB, 0xCD],
        },
    );
    let response = session
        .write_command(&command, WAIT, 0, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        FeatureResponse::Raw {
            feature: temperature.id(),
            command_id: 0x42,
            payload: vec![0xAB, 0xCD],
        }
    );

    let written = board.writes_to(CONFIG_CONTROL_UUID);
    assert_eq!(written, vec![vec![0x00, 0x04, 0x00, 0x00, 0x42, 0xAB, 0xCD]]);
}

#[tokio::test(start_paused = true)]
async fn test_answer_for_another_mask_is_ignored() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    board.on_write(CONFIG_CONTROL_UUID, |written| {
        let mut reply = vec![0x01, 0x00];
        reply.extend_from_slice(&HUMIDITY_MASK.to_be_bytes());
        reply.extend_from_slice(&written[4..]);
        Some(reply)
    });
    let session = ready(&board).await;
    let temperature = session.feature("Temperature").unwrap();
    assert_eq!(temperature.mask(), Some(TEMPERATURE_MASK));

    let command = FeatureCommand::new(
        temperature,
        CommandRequest::Raw {
            command_id: 0x42,
            params: vec![0x01],
        },
    );
    let response = session
        .write_command(&command, Duration::from_secs(1), 0, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(response, None);
}

#[tokio::test(start_paused = true)]
async fn test_payload_offsets() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    let session = ready(&board).await;
    let heart_rate = session.feature("HeartRate").unwrap();
    let temperature = session.feature("Temperature").unwrap();
    let mut updates = session.updates(&[heart_rate.clone(), temperature.clone()]);
    assert!(session
        .subscribe(&[heart_rate.clone(), temperature.clone()])
        .await
        .unwrap());

    let heart_uuid = characteristic_uuid(FeatureClass::External(ExternalFamily::StdChart), HEART_RATE_ID);
    assert!(board.notify(heart_uuid, vec![0x00, 72]));
    let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(update.feature, heart_rate.id());
    assert_eq!(update.bytes_consumed, 2);
    assert!(matches!(update.sample, FeatureSample::HeartRate { bpm: 72, .. }));

    assert!(board.notify(env_uuid(), vec![0x10, 0x00, 0, 0, 0, 0, 0, 0, 0xFB, 0x00]));
    let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(update.feature, temperature.id());
    assert_eq!(scalar(&update.sample), 25.1);
    assert_eq!(&update.raw[..2], &[0x10, 0x00]);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_are_counted() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    let session = ready(&board).await;
    let temperature = session.feature("Temperature").unwrap();

    assert!(session.subscribe(&[temperature.clone()]).await.unwrap());
    assert!(session.subscribe(&[temperature.clone()]).await.unwrap());
    assert_eq!(session.subscriber_count(&temperature), 2);

    assert!(session.unsubscribe(&[temperature.clone()]).await.unwrap());
    assert_eq!(session.subscriber_count(&temperature), 1);
    assert!(board.is_notifying(env_uuid()));

    assert!(session.unsubscribe(&[temperature.clone()]).await.unwrap());
    assert_eq!(session.subscriber_count(&temperature), 0);
    assert!(!board.is_notifying(env_uuid()));

    // nothing left to release
    assert!(session.unsubscribe(&[temperature.clone()]).await.unwrap());
    let disables = board
        .operation_log()
        .iter()
        .filter(|(op, uuid)| *op == SimulatedOperation::SetNotification && *uuid == Some(env_uuid()))
        .count();
    assert_eq!(disables, 2);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_disconnects() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    board.fail_next(SimulatedOperation::DiscoverServices, 1);
    let session = session(&board);
    session.connect().await.unwrap();

    let result = session.wait_for(ConnectionState::Ready, WAIT).await;
    assert!(matches!(result, Err(SessionError::Cancelled(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!board.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_services_changed_rebinds() {
    let board = Arc::new(SimulatedBoard::sensor_node("AA"));
    let session = ready(&board).await;
    let temperature = session.feature("Temperature").unwrap();
    let mut updates = session.updates(&[temperature.clone()]);
    assert!(session.subscribe(&[temperature.clone()]).await.unwrap());

    board.change_services(vec![GattService {
        uuid: Uuid::from_u128(0x0000_0000_0001_11e1_9ab4_0002_a5d5_c51b),
        characteristics: vec![
            GattCharacteristic::new(env_uuid(), Props::READ | Props::NOTIFY),
            GattCharacteristic::new(CONFIG_CONTROL_UUID, Props::WRITE | Props::NOTIFY),
        ],
    }]);
    for _ in 0..100 {
        if session.feature("HeartRate").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.feature("HeartRate").is_none());
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(session.subscriber_count(&temperature), 1);
    assert!(session.is_notifying(env_uuid()));

    assert!(board.notify_sample(env_uuid(), &env_payload(100_000, 455, 199)));
    let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(scalar(&update.sample), 19.9);
}
