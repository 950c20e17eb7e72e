//! Sensor board protocol constants
//!
//! Identifiers and framing helpers shared by the scanner, the session and
//! the command correlator.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Feature configuration characteristic.
/// When a board exposes it, commands for standard features go here instead of
/// the feature's own characteristic, and answers come back on it.
pub const CONFIG_CONTROL_UUID: Uuid = Uuid::from_u128(0x0000_0002_000f_11e1_ac36_0002_a5d5_c51b);

/// OTA bootloader service, as it appears in the incomplete 128-bit UUID list
/// of the advertisement.
pub const OTA_SERVICE_UUID_BYTES: [u8; 16] = [
    0x8a, 0x97, 0xf7, 0xc0, 0x85, 0x06, 0x11, 0xe3, 0xba, 0xa7, 0x08, 0x00, 0x20, 0x0c, 0x9a, 0x66,
];

/// Manufacturer id at the start of the vendor specific advertisement field.
pub const MANUFACTURER_ID: [u8; 2] = [0x30, 0x00];

/// ATT header bytes added on top of the usable payload when asking for an MTU.
pub const ATT_HEADER_SIZE: usize = 3;

/// Payload every link supports before MTU negotiation.
pub const DEFAULT_PAYLOAD_SIZE: usize = 20;

/// Notification prefix carrying the device timestamp.
///
/// ```text
/// [0-1]  : Timestamp (u16 little-endian, wraps)
/// [2-..] : Packed feature samples
/// ```
pub const TIMESTAMP_SIZE: usize = 2;

/// MTU to request for a desired usable payload.
pub fn requested_mtu(max_payload: usize) -> usize {
    max_payload + ATT_HEADER_SIZE
}

/// Usable payload for a granted MTU.
pub fn payload_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_HEADER_SIZE).max(DEFAULT_PAYLOAD_SIZE)
}

/// Size of each write to a feature: its own limit when it has one, capped
/// by the negotiated payload.
pub fn chunk_size(feature_limit: Option<usize>, max_payload: usize) -> usize {
    feature_limit
        .map_or(max_payload, |limit| limit.min(max_payload))
        .max(1)
}

/// Raw device timestamp at the start of a notification.
pub fn device_timestamp(data: &[u8]) -> Option<u16> {
    (data.len() >= TIMESTAMP_SIZE).then(|| u16::from_le_bytes([data[0], data[1]]))
}

/// Stand-in timestamp for characteristics whose features carry none:
/// wall clock milliseconds divided by 10.
pub fn wall_clock_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64 / 10)
        .unwrap_or(0)
}

/// Formats six bytes as `AA:BB:CC:DD:EE:FF`.
pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu_math() {
        assert_eq!(requested_mtu(248), 251);
        assert_eq!(payload_for_mtu(251), 248);
        // never below the pre-negotiation payload
        assert_eq!(payload_for_mtu(10), DEFAULT_PAYLOAD_SIZE);
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(None, 248), 248);
        assert_eq!(chunk_size(Some(20), 248), 20);
        assert_eq!(chunk_size(Some(300), 100), 100);
        assert_eq!(chunk_size(Some(0), 100), 1);
    }

    #[test]
    fn test_device_timestamp() {
        assert_eq!(device_timestamp(&[0x34, 0x12, 0xFF]), Some(0x1234));
        assert_eq!(device_timestamp(&[0x34]), None);
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xC0, 0x01, 0x02, 0x0A, 0xBB, 0xFF]),
            "C0:01:02:0A:BB:FF"
        );
    }

    #[test]
    fn test_config_control_uuid() {
        assert_eq!(
            CONFIG_CONTROL_UUID.to_string(),
            "00000002-000f-11e1-ac36-0002a5d5c51b"
        );
    }
}
