//! In-memory board implementing [`BleTransport`].
//!
//! Used by the demo binary and the tests. Every GATT call is instrumented so
//! tests can check how many operations were outstanding at once.

use crate::domain::features::registry::characteristic_uuid;
use crate::domain::features::{ExternalFamily, FeatureClass};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::advertise;
use crate::infrastructure::bluetooth::protocol::CONFIG_CONTROL_UUID;
use crate::infrastructure::bluetooth::scanner::ScanReport;
use crate::infrastructure::bluetooth::service::TransportProvider;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicProperties as Props, GattCharacteristic, GattService,
    TransportEvent,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

pub const ENVIRONMENT_MASK: u32 = 0x001C_0000;
pub const SWITCH_MASK: u32 = 0x2000_0000;
pub const BATTERY_MASK: u32 = 0x0002_0000;
pub const ACCELERATION_MASK: u32 = 0x0080_0000;
pub const EXT_CONFIGURATION_ID: u32 = 0x14;
pub const HEART_RATE_ID: u32 = 0x2a37;
pub const GENERAL_PURPOSE_ID: u32 = 0x0001;

/// Transport operations the board can be told to fail or stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOperation {
    Connect,
    DiscoverServices,
    Read,
    Write,
    SetNotification,
    RequestMtu,
}

type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

struct BoardState {
    connected: bool,
    services: Vec<GattService>,
    values: HashMap<Uuid, Vec<u8>>,
    notifying: HashSet<Uuid>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    latency: Duration,
    mtu_limit: usize,
    failures: HashMap<SimulatedOperation, usize>,
    stalled: HashSet<SimulatedOperation>,
    echo: bool,
    responders: HashMap<Uuid, Responder>,
    writes: Vec<(Uuid, Vec<u8>)>,
    log: Vec<(SimulatedOperation, Option<Uuid>)>,
    timestamp: u16,
}

/// Decrements the in-flight counter when the operation ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimulatedBoard {
    address: String,
    advertisement: Vec<u8>,
    state: Mutex<BoardState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimulatedBoard {
    pub fn new(address: &str, advertisement: Vec<u8>, services: Vec<GattService>) -> Self {
        Self {
            address: address.to_string(),
            advertisement,
            state: Mutex::new(BoardState {
                connected: false,
                services,
                values: HashMap::new(),
                notifying: HashSet::new(),
                events: None,
                latency: Duration::ZERO,
                mtu_limit: 247,
                failures: HashMap::new(),
                stalled: HashSet::new(),
                echo: false,
                responders: HashMap::new(),
                writes: Vec::new(),
                log: Vec::new(),
                timestamp: 0,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Nucleo board with environmental, switch, battery and motion features,
    /// the configuration characteristic, extended configuration, a heart
    /// rate characteristic and one general purpose characteristic.
    pub fn sensor_node(address: &str) -> Self {
        let standard = |mask, props| {
            GattCharacteristic::new(characteristic_uuid(FeatureClass::Standard, mask), props)
        };
        let services = vec![
            GattService {
                uuid: Uuid::from_u128(0x0000_0000_0001_11e1_9ab4_0002_a5d5_c51b),
                characteristics: vec![
                    standard(ENVIRONMENT_MASK, Props::READ | Props::NOTIFY),
                    standard(SWITCH_MASK, Props::READ | Props::WRITE | Props::NOTIFY),
                    standard(BATTERY_MASK, Props::READ | Props::NOTIFY),
                    standard(ACCELERATION_MASK, Props::NOTIFY),
                    GattCharacteristic::new(
                        characteristic_uuid(FeatureClass::Extended, EXT_CONFIGURATION_ID),
                        Props::WRITE | Props::NOTIFY,
                    ),
                ],
            },
            GattService {
                uuid: Uuid::from_u128(0x0000_0000_000f_11e1_9ab4_0002_a5d5_c51b),
                characteristics: vec![GattCharacteristic::new(
                    CONFIG_CONTROL_UUID,
                    Props::WRITE | Props::NOTIFY,
                )],
            },
            GattService {
                uuid: Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb),
                characteristics: vec![GattCharacteristic::new(
                    characteristic_uuid(FeatureClass::External(ExternalFamily::StdChart), HEART_RATE_ID),
                    Props::NOTIFY,
                )],
            },
            GattService {
                uuid: Uuid::from_u128(0x0000_0000_0002_11e1_9ab4_0002_a5d5_c51b),
                characteristics: vec![GattCharacteristic::new(
                    characteristic_uuid(FeatureClass::GeneralPurpose, GENERAL_PURPOSE_ID),
                    Props::READ | Props::WRITE | Props::NOTIFY,
                )],
            },
        ];

        let board = Self::new(
            address,
            advertise::encode_classic("SIMNODE", 2, 0x80, 0),
            services,
        );
        // pressure 1000.00 mBar, humidity 45.5 %, temperature 23.5 °C
        let mut environment = vec![0x00, 0x00];
        environment.extend_from_slice(&100_000i32.to_le_bytes());
        environment.extend_from_slice(&455u16.to_le_bytes());
        environment.extend_from_slice(&235i16.to_le_bytes());
        board.set_value(characteristic_uuid(FeatureClass::Standard, ENVIRONMENT_MASK), environment);
        board
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    /// Latency, scripted stalls and failures shared by every GATT call.
    async fn operation(
        &self,
        op: SimulatedOperation,
        uuid: Option<Uuid>,
    ) -> Result<(), TransportError> {
        let latency = {
            let mut state = self.lock();
            if !state.connected && op != SimulatedOperation::Connect {
                return Err(TransportError::Disconnected);
            }
            state.log.push((op, uuid));
            state.latency
        };

        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        let stalled = self.lock().stalled.contains(&op);
        if stalled {
            trace!(address = %self.address, ?op, "Stalling operation");
            futures::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Failure(format!("scripted {op:?} failure")));
            }
        }
        if !state.connected && op != SimulatedOperation::Connect {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn send_event(state: &BoardState, event: TransportEvent) -> bool {
        state
            .events
            .as_ref()
            .map(|events| events.send(event).is_ok())
            .unwrap_or(false)
    }

    fn next_timestamp(state: &mut BoardState) -> [u8; 2] {
        state.timestamp = state.timestamp.wrapping_add(1);
        state.timestamp.to_le_bytes()
    }

    pub fn advertisement(&self) -> Vec<u8> {
        self.advertisement.clone()
    }

    pub fn scan_report(&self, rssi: i16) -> ScanReport {
        ScanReport {
            address: self.address.clone(),
            rssi,
            data: self.advertisement.clone(),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_mtu_limit(&self, mtu: usize) {
        self.lock().mtu_limit = mtu;
    }

    /// Fails the next `count` calls of `op`.
    pub fn fail_next(&self, op: SimulatedOperation, count: usize) {
        self.lock().failures.insert(op, count);
    }

    /// Calls of `op` never complete from now on.
    pub fn stall(&self, op: SimulatedOperation) {
        self.lock().stalled.insert(op);
    }

    /// Writes are answered by a notification carrying a fresh timestamp
    /// followed by the written bytes.
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    /// Answers writes to `uuid` with whatever `responder` returns.
    pub fn on_write<F>(&self, uuid: Uuid, responder: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.lock().responders.insert(uuid, Arc::new(responder));
    }

    pub fn set_value(&self, uuid: Uuid, value: Vec<u8>) {
        self.lock().values.insert(uuid, value);
    }

    /// Pushes a notification if the client enabled them on `uuid`.
    pub fn notify(&self, uuid: Uuid, value: Vec<u8>) -> bool {
        let state = self.lock();
        if !state.connected || !state.notifying.contains(&uuid) {
            return false;
        }
        Self::send_event(&state, TransportEvent::CharacteristicChanged { uuid, value })
    }

    /// Prefixes `payload` with the next device timestamp and notifies it.
    pub fn notify_sample(&self, uuid: Uuid, payload: &[u8]) -> bool {
        let value = {
            let mut state = self.lock();
            let mut value = Self::next_timestamp(&mut state).to_vec();
            value.extend_from_slice(payload);
            value
        };
        self.notify(uuid, value)
    }

    /// Replaces the GATT table and tells the client.
    pub fn change_services(&self, services: Vec<GattService>) {
        let mut state = self.lock();
        state.services = services;
        Self::send_event(&state, TransportEvent::ServicesChanged);
    }

    /// Drops the link from the board side.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.notifying.clear();
        Self::send_event(&state, TransportEvent::ConnectionChanged(false));
        state.events = None;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_notifying(&self, uuid: Uuid) -> bool {
        self.lock().notifying.contains(&uuid)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(target, _)| *target == uuid)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// GATT calls in dispatch order.
    pub fn operation_log(&self) -> Vec<(SimulatedOperation, Option<Uuid>)> {
        self.lock().log.clone()
    }
}

#[async_trait]
impl BleTransport for SimulatedBoard {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.operation(SimulatedOperation::Connect, None).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.connected = true;
        state.notifying.clear();
        let _ = sender.send(TransportEvent::ConnectionChanged(true));
        state.events = Some(sender);
        debug!(address = %self.address, "Simulated link up");
        Ok(receiver)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        let _in_flight = self.enter();
        self.operation(SimulatedOperation::DiscoverServices, None).await?;
        Ok(self.lock().services.clone())
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let _in_flight = self.enter();
        self.operation(SimulatedOperation::Read, Some(uuid)).await?;
        Ok(self.lock().values.get(&uuid).cloned().unwrap_or_default())
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let _in_flight = self.enter();
        self.operation(SimulatedOperation::Write, Some(uuid)).await?;

        let (responder, echo) = {
            let mut state = self.lock();
            state.writes.push((uuid, value.to_vec()));
            (state.responders.get(&uuid).cloned(), state.echo)
        };
        let reply = match responder {
            Some(responder) => responder(value),
            None if echo => {
                let mut reply = Self::next_timestamp(&mut self.lock()).to_vec();
                reply.extend_from_slice(value);
                Some(reply)
            }
            None => None,
        };
        if let Some(reply) = reply {
            self.notify(uuid, reply);
        }
        Ok(())
    }

    async fn set_notification(&self, uuid: Uuid, enabled: bool) -> Result<(), TransportError> {
        let _in_flight = self.enter();
        self.operation(SimulatedOperation::SetNotification, Some(uuid)).await?;

        let mut state = self.lock();
        let known = state
            .services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .any(|characteristic| characteristic.uuid == uuid);
        if !known {
            return Err(TransportError::Failure(format!("no characteristic {uuid}")));
        }
        if enabled {
            state.notifying.insert(uuid);
        } else {
            state.notifying.remove(&uuid);
        }
        Ok(())
    }

    async fn request_mtu(&self, mtu: usize) -> Result<usize, TransportError> {
        let _in_flight = self.enter();
        self.operation(SimulatedOperation::RequestMtu, None).await?;
        Ok(mtu.min(self.lock().mtu_limit))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.drop_link();
        Ok(())
    }
}

/// Set of simulated boards handed out by address.
#[derive(Default)]
pub struct SimulatedAdapter {
    boards: Mutex<HashMap<String, Arc<SimulatedBoard>>>,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, board: Arc<SimulatedBoard>) {
        if let Ok(mut boards) = self.boards.lock() {
            boards.insert(board.address.clone(), board);
        }
    }

    pub fn board(&self, address: &str) -> Option<Arc<SimulatedBoard>> {
        self.boards.lock().ok()?.get(address).cloned()
    }

    /// One advertisement report per board.
    pub fn scan(&self, rssi: i16) -> Vec<ScanReport> {
        self.boards
            .lock()
            .map(|boards| boards.values().map(|board| board.scan_report(rssi)).collect())
            .unwrap_or_default()
    }
}

impl TransportProvider for SimulatedAdapter {
    fn transport(&self, address: &str) -> Option<Arc<dyn BleTransport>> {
        self.board(address).map(|board| board as Arc<dyn BleTransport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_connection() {
        let board = SimulatedBoard::sensor_node("AA");
        assert_eq!(
            board.discover_services().await,
            Err(TransportError::Disconnected)
        );
        let mut events = board.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::ConnectionChanged(true)));
        assert_eq!(board.discover_services().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_echo_needs_notifications() {
        let board = SimulatedBoard::sensor_node("AA");
        board.set_echo(true);
        let mut events = board.connect().await.unwrap();
        events.recv().await;

        board.write_characteristic(CONFIG_CONTROL_UUID, &[1, 2]).await.unwrap();
        assert!(events.try_recv().is_err());

        board.set_notification(CONFIG_CONTROL_UUID, true).await.unwrap();
        board.write_characteristic(CONFIG_CONTROL_UUID, &[1, 2]).await.unwrap();
        match events.try_recv() {
            Ok(TransportEvent::CharacteristicChanged { uuid, value }) => {
                assert_eq!(uuid, CONFIG_CONTROL_UUID);
                assert_eq!(&value[2..], &[1, 2]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(board.writes_to(CONFIG_CONTROL_UUID).len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failure_and_mtu() {
        let board = SimulatedBoard::sensor_node("AA");
        let _events = board.connect().await.unwrap();
        board.fail_next(SimulatedOperation::RequestMtu, 1);
        assert!(board.request_mtu(251).await.is_err());
        assert_eq!(board.request_mtu(251).await, Ok(247));
        assert!(board.set_notification(Uuid::nil(), true).await.is_err());
    }
}
