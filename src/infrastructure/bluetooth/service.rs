//! Bluetooth Service Module
//!
//! Main service that coordinates scanning and the per-device sessions. It
//! guarantees one [`ConnectionSession`] (and so one operation queue and one
//! connection state) per physical device.

use crate::domain::features::registry::FeatureRegistry;
use crate::domain::models::ConnectionState;
use crate::domain::settings::SessionConfig;
use crate::error::SessionError;
use crate::infrastructure::bluetooth::connection::{ConnectionSession, SessionContext};
use crate::infrastructure::bluetooth::scanner::{DeviceScanner, ScanEvent};
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::infrastructure::bluetooth::update_log::LoggerSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Hands out the platform transport for an address.
pub trait TransportProvider: Send + Sync {
    fn transport(&self, address: &str) -> Option<Arc<dyn BleTransport>>;
}

/// Firmware and compatibility metadata for one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub device_id: u8,
    pub firmware_id: u8,
    pub board_name: String,
    pub firmware_name: String,
    pub firmware_version: String,
}

/// Board metadata lookup. Must answer from what it already has; the
/// session never waits on it.
pub trait BoardCatalog: Send + Sync {
    fn lookup(&self, device_id: u8, firmware_id: u8) -> Option<FirmwareInfo>;
}

#[derive(Debug, Default)]
pub struct StaticBoardCatalog {
    entries: HashMap<(u8, u8), FirmwareInfo>,
}

impl StaticBoardCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, info: FirmwareInfo) -> Self {
        self.insert(info);
        self
    }

    pub fn insert(&mut self, info: FirmwareInfo) {
        self.entries.insert((info.device_id, info.firmware_id), info);
    }
}

impl BoardCatalog for StaticBoardCatalog {
    fn lookup(&self, device_id: u8, firmware_id: u8) -> Option<FirmwareInfo> {
        self.entries.get(&(device_id, firmware_id)).cloned()
    }
}

/// Main service coordinating all BLE sessions
pub struct NodeService {
    scanner: DeviceScanner,
    context: SessionContext,
    provider: Arc<dyn TransportProvider>,
    sessions: Mutex<HashMap<String, Arc<ConnectionSession>>>,
}

impl NodeService {
    /// Must be called from within a Tokio runtime (it starts the update
    /// logging task).
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        config: SessionConfig,
        scan_events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Self {
        let sink = LoggerSink::with_tracing(config.log_channel_capacity);
        Self {
            scanner: DeviceScanner::new(scan_events),
            context: SessionContext {
                registry: Arc::new(FeatureRegistry::with_defaults()),
                config,
                sink,
                catalog: None,
            },
            provider,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn BoardCatalog>) -> Self {
        self.context.catalog = Some(catalog);
        self
    }

    pub fn with_registry(mut self, registry: Arc<FeatureRegistry>) -> Self {
        self.context.registry = registry;
        self
    }

    pub fn scanner(&self) -> &DeviceScanner {
        &self.scanner
    }

    pub fn logger_sink(&self) -> &LoggerSink {
        &self.context.sink
    }

    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.context.registry
    }

    pub fn session(&self, address: &str) -> Option<Arc<ConnectionSession>> {
        self.sessions.lock().ok()?.get(address).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.sessions
            .lock()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Connects to a scanned device, reusing its session.
    ///
    /// A disconnected session is replaced when the scanner holds a newer
    /// identity for the address, so the next connection binds against what
    /// the board advertises now.
    pub async fn connect(&self, address: &str) -> Result<Arc<ConnectionSession>, SessionError> {
        let device = self.scanner.device(address).ok_or_else(|| {
            SessionError::Precondition(format!("{address} has not been discovered"))
        })?;

        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| SessionError::Precondition("session table poisoned".to_string()))?;
            match sessions.get(address) {
                Some(session)
                    if session.state() != ConnectionState::Disconnected
                        || *session.identity() == device.identity =>
                {
                    session.clone()
                }
                _ => {
                    let transport = self.provider.transport(address).ok_or_else(|| {
                        SessionError::Precondition(format!("no transport for {address}"))
                    })?;
                    debug!(%address, "Creating session");
                    let session = Arc::new(ConnectionSession::new(
                        transport,
                        device.identity.clone(),
                        self.context.clone(),
                    ));
                    sessions.insert(address.to_string(), session.clone());
                    session
                }
            }
        };

        session.connect().await?;
        Ok(session)
    }

    /// Returns false when there is no session for `address`.
    pub fn disconnect(&self, address: &str) -> bool {
        match self.session(address) {
            Some(session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let sessions = self.sessions();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Disconnecting all devices");
        }
        for session in sessions {
            session.disconnect();
        }
    }
}
