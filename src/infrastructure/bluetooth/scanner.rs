//! BLE Scanner Module
//!
//! Turns raw advertisement reports into device identities and keeps the
//! freshest one per address.

use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::advertise::AdvertisementDecoder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// One advertisement as reported by the platform.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub address: String,
    pub rssi: i16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: String,
    pub identity: DeviceIdentity,
    pub rssi: i16,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// First recognised advertisement for an address
    Discovered(DiscoveredDevice),
    /// A fresher advertisement for a known address
    Updated(DiscoveredDevice),
}

/// Scanner for sensor boards
pub struct DeviceScanner {
    decoder: AdvertisementDecoder,
    devices: Mutex<HashMap<String, DiscoveredDevice>>,
    scanning: AtomicBool,
    event_sender: mpsc::UnboundedSender<ScanEvent>,
}

impl DeviceScanner {
    pub fn new(event_sender: mpsc::UnboundedSender<ScanEvent>) -> Self {
        Self::with_decoder(AdvertisementDecoder::default(), event_sender)
    }

    pub fn with_decoder(
        decoder: AdvertisementDecoder,
        event_sender: mpsc::UnboundedSender<ScanEvent>,
    ) -> Self {
        Self {
            decoder,
            devices: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
            event_sender,
        }
    }

    pub fn start(&self) {
        if !self.scanning.swap(true, Ordering::SeqCst) {
            info!("Starting device scan");
        }
    }

    pub fn stop(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            info!("Stopping device scan");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Feeds one advertisement report.
    ///
    /// Returns the decoded identity when the report was recognised. Reports
    /// arriving while the scanner is stopped are ignored.
    pub fn process_report(&self, report: ScanReport) -> Option<DeviceIdentity> {
        if !self.is_scanning() {
            trace!(address = %report.address, "Ignoring report, scanner stopped");
            return None;
        }

        let identity = self.decoder.decode(&report.data)?;
        let device = DiscoveredDevice {
            address: report.address.clone(),
            identity: identity.clone(),
            rssi: report.rssi,
            last_seen: Instant::now(),
        };

        let known = match self.devices.lock() {
            Ok(mut devices) => devices.insert(report.address.clone(), device.clone()).is_some(),
            Err(_) => return None,
        };

        let event = if known {
            trace!(address = %report.address, rssi = report.rssi, "Device updated");
            ScanEvent::Updated(device)
        } else {
            debug!(
                address = %report.address,
                name = %identity.name,
                model = ?identity.board_model,
                "Device discovered"
            );
            ScanEvent::Discovered(device)
        };
        let _ = self.event_sender.send(event);

        Some(identity)
    }

    pub fn device(&self, address: &str) -> Option<DiscoveredDevice> {
        self.devices.lock().ok()?.get(address).cloned()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices
            .lock()
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::advertise::encode_classic;

    fn report(address: &str, rssi: i16, name: &str) -> ScanReport {
        ScanReport {
            address: address.to_string(),
            rssi,
            data: encode_classic(name, 2, 0x06, 0),
        }
    }

    #[test]
    fn test_discovered_then_updated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scanner = DeviceScanner::new(tx);
        scanner.start();

        assert!(scanner.process_report(report("AA", -60, "one")).is_some());
        assert!(matches!(rx.try_recv(), Ok(ScanEvent::Discovered(_))));

        scanner.process_report(report("AA", -40, "renamed"));
        match rx.try_recv() {
            Ok(ScanEvent::Updated(device)) => {
                assert_eq!(device.rssi, -40);
                assert_eq!(device.identity.name, "renamed");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(scanner.device("AA").unwrap().identity.name, "renamed");
        assert_eq!(scanner.devices().len(), 1);
    }

    #[test]
    fn test_ignores_unknown_and_stopped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scanner = DeviceScanner::new(tx);

        assert!(scanner.process_report(report("AA", -60, "x")).is_none());

        scanner.start();
        let unknown = ScanReport {
            address: "BB".into(),
            rssi: -70,
            data: vec![3, 0x09, b'h', b'i'],
        };
        assert!(scanner.process_report(unknown).is_none());
        assert!(rx.try_recv().is_err());
        assert!(scanner.devices().is_empty());
    }
}
