//! Advertisement decoding
//!
//! The raw advertisement is split into its type-length-value fields, then
//! handed to a chain of dialect filters. The first filter that recognises
//! the vendor field produces the [`DeviceIdentity`]; when none does, the
//! device is not one of ours and the report is ignored.

use crate::domain::boards::BoardModel;
use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::protocol;
use std::collections::HashMap;
use tracing::trace;

pub const DEVICE_NAME_TYPE: u8 = 0x09;
pub const TX_POWER_TYPE: u8 = 0x0A;
pub const INCOMPLETE_128_UUID_LIST_TYPE: u8 = 0x06;
pub const VENDOR_DATA_TYPE: u8 = 0xFF;

const SLEEPING_FLAG: u8 = 0x40;
const GENERAL_PURPOSE_FLAG: u8 = 0x20;
const STATUS_FLAGS_MASK: u8 = 0x1F;

/// Field type -> payload.
pub type AdvertisementFields = HashMap<u8, Vec<u8>>;

/// Splits an advertisement into its fields.
///
/// Parsing stops at the first zero-length record; a trailing record whose
/// declared length runs past the end of the data is dropped.
pub fn split_fields(data: &[u8]) -> AdvertisementFields {
    let mut fields = HashMap::new();
    let mut ptr = 0;

    while ptr + 1 < data.len() {
        let length = data[ptr] as usize;
        if length == 0 {
            break;
        }
        let field_type = data[ptr + 1];
        let start = ptr + 2;
        let end = ptr + 1 + length;
        if end > data.len() {
            trace!("Dropping truncated advertisement field {:#04X}", field_type);
            break;
        }
        fields.insert(field_type, data[start..end].to_vec());
        ptr = end;
    }

    fields
}

fn local_name(fields: &AdvertisementFields) -> Option<String> {
    fields
        .get(&DEVICE_NAME_TYPE)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
}

fn tx_power(fields: &AdvertisementFields) -> i8 {
    fields
        .get(&TX_POWER_TYPE)
        .and_then(|data| data.first())
        .map_or(0, |b| *b as i8)
}

/// One advertisement dialect.
pub trait AdvertiseFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, fields: &AdvertisementFields) -> Option<DeviceIdentity>;
}

/// Protocol v1/v2 vendor field:
///
/// ```text
/// [0x30 0x00]?           manufacturer id, only in the 14 byte form
/// [version]              1 or 2
/// [deviceId]             board id, bits 0x40/0x20 are status flags on some boards
/// [u32 BE]               v1 feature mask / v2 option bytes
/// [6 bytes]?             MAC address, 12 and 14 byte forms
/// ```
#[derive(Debug, Default)]
pub struct ClassicFilter;

impl ClassicFilter {
    const MIN_VERSION: u8 = 1;
    const MAX_VERSION: u8 = 2;

    /// Board model for a device id that may carry status flags.
    fn resolve_model(device_id: u8, version: u8) -> BoardModel {
        let model = BoardModel::from_identifier(device_id, version);
        if model != BoardModel::Generic || device_id & 0x80 != 0 {
            return model;
        }
        let unflagged = BoardModel::from_identifier(device_id & STATUS_FLAGS_MASK, version);
        if unflagged.has_status_flags() {
            unflagged
        } else {
            model
        }
    }
}

impl AdvertiseFilter for ClassicFilter {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn decode(&self, fields: &AdvertisementFields) -> Option<DeviceIdentity> {
        let vendor = fields.get(&VENDOR_DATA_TYPE)?;
        let offset = match vendor.len() {
            6 | 12 => 0,
            14 if vendor[..2] == protocol::MANUFACTURER_ID => 2,
            _ => return None,
        };

        let version = vendor[offset];
        if !(Self::MIN_VERSION..=Self::MAX_VERSION).contains(&version) {
            return None;
        }

        let device_id = vendor[offset + 1];
        let model = Self::resolve_model(device_id, version);
        let flags = model.has_status_flags();
        let feature_word = u32::from_be_bytes([
            vendor[offset + 2],
            vendor[offset + 3],
            vendor[offset + 4],
            vendor[offset + 5],
        ]);
        let embedded_address =
            (vendor.len() != 6).then(|| protocol::format_mac(&vendor[offset + 6..offset + 12]));

        Some(DeviceIdentity::classic(
            local_name(fields).unwrap_or_default(),
            tx_power(fields),
            embedded_address,
            version,
            device_id,
            model,
            feature_word,
            flags && device_id & SLEEPING_FLAG != 0,
            flags && device_id & GENERAL_PURPOSE_FLAG != 0,
        ))
    }
}

/// Protocol v3 vendor field:
///
/// ```text
/// [0x30 0x00]            manufacturer id
/// [version]              3
/// [deviceId]
/// [firmwareId]
/// [u16 BE protocolId]
/// [payload..]            at least one byte
/// ```
#[derive(Debug, Default)]
pub struct ExtendedFilter;

impl ExtendedFilter {
    const VERSION: u8 = 3;
    const MIN_LEN: usize = 2 + 1 + 1 + 1 + 2 + 1;
}

impl AdvertiseFilter for ExtendedFilter {
    fn name(&self) -> &'static str {
        "extended"
    }

    fn decode(&self, fields: &AdvertisementFields) -> Option<DeviceIdentity> {
        let vendor = fields.get(&VENDOR_DATA_TYPE)?;
        if vendor.len() < Self::MIN_LEN || vendor[..2] != protocol::MANUFACTURER_ID {
            return None;
        }
        if vendor[2] != Self::VERSION {
            return None;
        }

        let device_id = vendor[3];
        Some(DeviceIdentity::extended(
            local_name(fields).unwrap_or_default(),
            tx_power(fields),
            Self::VERSION,
            device_id,
            // v3 boards reuse the v2 id table
            BoardModel::from_identifier(device_id, 2),
            vendor[4],
            u16::from_be_bytes([vendor[5], vendor[6]]),
            vendor[7..].to_vec(),
        ))
    }
}

/// Board running the OTA bootloader: it only advertises the OTA service.
#[derive(Debug, Default)]
pub struct BootloaderFilter;

impl BootloaderFilter {
    const DEFAULT_NAME: &'static str = "BlueNRG OTA";
}

impl AdvertiseFilter for BootloaderFilter {
    fn name(&self) -> &'static str {
        "bootloader"
    }

    fn decode(&self, fields: &AdvertisementFields) -> Option<DeviceIdentity> {
        let services = fields.get(&INCOMPLETE_128_UUID_LIST_TYPE)?;
        if services.as_slice() != protocol::OTA_SERVICE_UUID_BYTES {
            return None;
        }
        Some(DeviceIdentity::bootloader(
            local_name(fields).unwrap_or_else(|| Self::DEFAULT_NAME.to_string()),
            tx_power(fields),
        ))
    }
}

/// Ordered chain of dialect filters.
pub struct AdvertisementDecoder {
    filters: Vec<Box<dyn AdvertiseFilter>>,
}

impl Default for AdvertisementDecoder {
    fn default() -> Self {
        Self::with_filters(vec![
            Box::new(ClassicFilter),
            Box::new(ExtendedFilter),
            Box::new(BootloaderFilter),
        ])
    }
}

impl AdvertisementDecoder {
    pub fn with_filters(filters: Vec<Box<dyn AdvertiseFilter>>) -> Self {
        Self { filters }
    }

    /// `None` when no dialect recognises the advertisement.
    pub fn decode(&self, data: &[u8]) -> Option<DeviceIdentity> {
        let fields = split_fields(data);
        self.filters.iter().find_map(|filter| {
            let identity = filter.decode(&fields)?;
            trace!(filter = filter.name(), name = %identity.name, "Advertisement recognised");
            Some(identity)
        })
    }
}

/// Builds a classic advertisement; used by the simulated board.
pub fn encode_classic(name: &str, version: u8, device_id: u8, feature_word: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(name.len() as u8 + 1);
    out.push(DEVICE_NAME_TYPE);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&[2, TX_POWER_TYPE, 0]);
    out.push(7);
    out.push(VENDOR_DATA_TYPE);
    out.push(version);
    out.push(device_id);
    out.extend_from_slice(&feature_word.to_be_bytes());
    out
}
