//! Feature identities and the decode/encode contract shared by every kind.
//!
//! A [`Feature`] is an immutable `(class, id)` pair plus the tagged
//! [`FeatureKind`] that knows the payload layout. Features hold no state and
//! are handed out as `Arc<Feature>` by the [`registry::FeatureRegistry`], so
//! every session that sees the same identity shares one instance.

pub mod decoders;
pub mod registry;
pub mod stl2;

use crate::error::DecodeError;
pub use decoders::{
    ActivityType, BatteryStatus, BodySensorLocation, CarryPosition, ExtConfigAnswer,
    ExtConfigCommand, FeatureKind, FeatureSample, FitnessActivityType, MemsGesture, Quaternion,
    SwitchState,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Vendor families of one-to-one characteristics outside the SDK ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExternalFamily {
    BlueNrgOta,
    Stm32,
    StdChart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FeatureClass {
    /// Packed with siblings in one characteristic, selected by mask bit.
    Standard,
    Extended,
    External(ExternalFamily),
    GeneralPurpose,
}

impl fmt::Display for FeatureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureClass::Standard => write!(f, "standard"),
            FeatureClass::Extended => write!(f, "extended"),
            FeatureClass::External(ExternalFamily::BlueNrgOta) => write!(f, "external BlueNRG OTA"),
            FeatureClass::External(ExternalFamily::Stm32) => write!(f, "external STM32"),
            FeatureClass::External(ExternalFamily::StdChart) => write!(f, "external standard chart"),
            FeatureClass::GeneralPurpose => write!(f, "general purpose"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FeatureId {
    pub class: FeatureClass,
    /// Mask bit for standard features, characteristic prefix otherwise.
    pub id: u32,
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:#010x}", self.class, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    id: FeatureId,
    kind: FeatureKind,
}

impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Feature {}

impl Feature {
    pub fn new(id: FeatureId, kind: FeatureKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> FeatureId {
        self.id
    }

    pub fn class(&self) -> FeatureClass {
        self.id.class
    }

    pub fn kind(&self) -> &FeatureKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Prefix written in front of commands; only standard features have one.
    pub fn mask(&self) -> Option<u32> {
        (self.id.class == FeatureClass::Standard).then_some(self.id.id)
    }

    pub fn has_timestamp(&self) -> bool {
        self.kind.has_timestamp()
    }

    /// Features that only exist to carry commands never stream samples.
    pub fn is_data_notify(&self) -> bool {
        self.kind.is_data_notify()
    }

    /// Per-write chunk size this feature's peer expects, when it is smaller
    /// than the negotiated payload.
    pub fn max_write_payload(&self) -> Option<usize> {
        self.kind.max_write_payload()
    }

    pub fn decode(&self, timestamp: u64, data: &[u8], offset: usize) -> Result<FeatureUpdate, DecodeError> {
        let (sample, bytes_consumed) = self.kind.decode(data, offset)?;
        Ok(FeatureUpdate {
            feature: self.id,
            name: self.name(),
            timestamp,
            raw: data.to_vec(),
            sample,
            bytes_consumed,
        })
    }

    /// Wire form of `request`, or `None` when this feature does not accept it.
    pub fn encode_command(&self, request: &CommandRequest) -> Option<Vec<u8>> {
        self.kind.encode_command(self.mask(), request)
    }

    pub fn parse_response(&self, data: &[u8]) -> Option<FeatureResponse> {
        self.kind.parse_response(self.id, data)
    }

    /// Whether the board answers `request` with a notification.
    pub fn expects_response(&self, request: &CommandRequest) -> bool {
        self.kind.expects_response(self.id.class, request)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id)
    }
}

/// One decoded sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureUpdate {
    pub feature: FeatureId,
    pub name: &'static str,
    /// Unwrapped device timestamp, or wall-clock derived for timestamp-less characteristics
    pub timestamp: u64,
    pub raw: Vec<u8>,
    pub sample: FeatureSample,
    pub bytes_consumed: usize,
}

/// What the caller asks a feature to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRequest {
    /// Any command id with opaque parameters
    Raw { command_id: u8, params: Vec<u8> },
    Switch { on: bool },
    BatteryCapacity,
    BatteryMaxCurrent,
    StartCalibration,
    StopCalibration,
    CalibrationStatus,
    DirectionSensitivity { high: bool },
    EnableFitnessActivity(FitnessActivityType),
    Led { device_id: u8, on: bool },
    Reboot { device_id: u8 },
    ExtConfig(ExtConfigCommand),
}

pub const COMMAND_SWITCH_OFF: u8 = 0x00;
pub const COMMAND_SWITCH_ON: u8 = 0x01;
pub const COMMAND_BATTERY_CAPACITY: u8 = 0x01;
pub const COMMAND_BATTERY_MAX_CURRENT: u8 = 0x02;
pub const COMMAND_START_CALIBRATION: u8 = 0x00;
pub const COMMAND_STOP_CALIBRATION: u8 = 0x01;
pub const COMMAND_CALIBRATION_STATUS: u8 = 0xFF;
pub const COMMAND_SET_SENSITIVITY: u8 = 0xCC;
pub const COMMAND_SEND_EXT: u8 = 0x00;

impl CommandRequest {
    pub fn command_id(&self) -> u8 {
        match self {
            CommandRequest::Raw { command_id, .. } => *command_id,
            CommandRequest::Switch { on: true } => COMMAND_SWITCH_ON,
            CommandRequest::Switch { on: false } => COMMAND_SWITCH_OFF,
            CommandRequest::BatteryCapacity => COMMAND_BATTERY_CAPACITY,
            CommandRequest::BatteryMaxCurrent => COMMAND_BATTERY_MAX_CURRENT,
            CommandRequest::StartCalibration => COMMAND_START_CALIBRATION,
            CommandRequest::StopCalibration => COMMAND_STOP_CALIBRATION,
            CommandRequest::CalibrationStatus => COMMAND_CALIBRATION_STATUS,
            CommandRequest::DirectionSensitivity { .. } => COMMAND_SET_SENSITIVITY,
            CommandRequest::EnableFitnessActivity(activity) => activity.code(),
            CommandRequest::Led { on: true, .. } => 0x01,
            CommandRequest::Led { on: false, .. } => 0x00,
            CommandRequest::Reboot { .. } => 0x02,
            CommandRequest::ExtConfig(_) => COMMAND_SEND_EXT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureCommand {
    pub feature: Arc<Feature>,
    pub request: CommandRequest,
    /// Callers can opt out of waiting even when the board would answer.
    pub has_response: bool,
}

impl FeatureCommand {
    pub fn new(feature: Arc<Feature>, request: CommandRequest) -> Self {
        Self {
            feature,
            request,
            has_response: true,
        }
    }

    pub fn without_response(mut self) -> Self {
        self.has_response = false;
        self
    }

    pub fn command_id(&self) -> u8 {
        self.request.command_id()
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureResponse {
    /// Written, nothing to wait for
    Empty { feature: FeatureId, command_id: u8 },
    /// Every write attempt failed
    WriteError { feature: FeatureId, command_id: u8 },
    Switch { feature: FeatureId, command_id: u8, status: SwitchState },
    BatteryCapacity { feature: FeatureId, capacity: u16 },
    BatteryMaxCurrent { feature: FeatureId, current: f32 },
    Calibration { feature: FeatureId, command_id: u8, calibrated: bool },
    ExtConfig { feature: FeatureId, answer: ExtConfigAnswer },
    Raw { feature: FeatureId, command_id: u8, payload: Vec<u8> },
}

impl FeatureResponse {
    /// Command id the answer refers to, when the variant carries one.
    pub fn command_id(&self) -> Option<u8> {
        match self {
            FeatureResponse::Empty { command_id, .. }
            | FeatureResponse::WriteError { command_id, .. }
            | FeatureResponse::Switch { command_id, .. }
            | FeatureResponse::Calibration { command_id, .. }
            | FeatureResponse::Raw { command_id, .. } => Some(*command_id),
            FeatureResponse::BatteryCapacity { .. } => Some(COMMAND_BATTERY_CAPACITY),
            FeatureResponse::BatteryMaxCurrent { .. } => Some(COMMAND_BATTERY_MAX_CURRENT),
            FeatureResponse::ExtConfig { .. } => None,
        }
    }

    pub fn feature(&self) -> FeatureId {
        match self {
            FeatureResponse::Empty { feature, .. }
            | FeatureResponse::WriteError { feature, .. }
            | FeatureResponse::Switch { feature, .. }
            | FeatureResponse::BatteryCapacity { feature, .. }
            | FeatureResponse::BatteryMaxCurrent { feature, .. }
            | FeatureResponse::Calibration { feature, .. }
            | FeatureResponse::ExtConfig { feature, .. }
            | FeatureResponse::Raw { feature, .. } => *feature,
        }
    }
}

/// Response header shared by every command answer:
/// `[u16 LE timestamp][u32 BE mask][u8 commandId][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommandResponse {
    pub timestamp: u16,
    pub mask: u32,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

pub const COMMAND_RESPONSE_MIN_LEN: usize = 7;

impl RawCommandResponse {
    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < COMMAND_RESPONSE_MIN_LEN {
            return None;
        }
        Some(Self {
            timestamp: u16::from_le_bytes([data[0], data[1]]),
            mask: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            command_id: data[6],
            payload: data[7..].to_vec(),
        })
    }
}

/// `[u32 BE mask]?[commandId][params]`
pub fn pack_command(mask: Option<u32>, command_id: u8, params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + params.len());
    if let Some(mask) = mask {
        out.extend_from_slice(&mask.to_be_bytes());
    }
    out.push(command_id);
    out.extend_from_slice(params);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_command_prefix() {
        assert_eq!(
            pack_command(Some(0x2000_0000), 0x01, &[]),
            vec![0x20, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(pack_command(None, 0x05, &[0xAA]), vec![0x05, 0xAA]);
    }

    #[test]
    fn test_unpack_response() {
        assert!(RawCommandResponse::unpack(&[0, 0, 0, 0, 0, 0]).is_none());

        let resp =
            RawCommandResponse::unpack(&[0x10, 0x00, 0x00, 0x02, 0x00, 0x00, 0x01, 0x64, 0x00])
                .unwrap();
        assert_eq!(resp.timestamp, 0x0010);
        assert_eq!(resp.mask, 0x0002_0000);
        assert_eq!(resp.command_id, 0x01);
        assert_eq!(resp.payload, vec![0x64, 0x00]);
    }

    #[test]
    fn test_feature_equality_is_by_identity() {
        let id = FeatureId {
            class: FeatureClass::Standard,
            id: 0x0004_0000,
        };
        let a = Feature::new(id, FeatureKind::Temperature);
        let b = Feature::new(id, FeatureKind::Temperature);
        assert_eq!(a, b);
        assert_eq!(a.mask(), Some(0x0004_0000));
        assert_eq!(a.to_string(), "Temperature (standard 0x00040000)");
    }
}
