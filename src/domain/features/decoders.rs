//! Concrete payload layouts.
//!
//! Every kind the registry can build is a variant of [`FeatureKind`]; the
//! three operations of the feature contract are plain `match`es over it.

use super::stl2;
use super::{pack_command, CommandRequest, FeatureClass, FeatureId, FeatureResponse, RawCommandResponse};
use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    AudioAdpcmSync,
    AudioAdpcm,
    Switch,
    MemsNorm,
    MicLevel,
    AudioClassification,
    Proximity,
    Luminosity,
    Acceleration,
    Gyroscope,
    Magnetometer,
    Pressure,
    Humidity,
    Temperature,
    Battery,
    CoSensor,
    EulerAngle,
    SdLogging,
    StepperMotor,
    AccelerationEvent,
    BeamForming,
    FreeFall,
    EventCounter,
    SensorFusionCompat,
    SensorFusion,
    Compass,
    MotionIntensity,
    Activity,
    CarryPosition,
    ProximityGesture,
    MemsGesture,
    Pedometer,
    DirectionOfArrival,
    AudioOpus,
    AudioOpusConf,
    FitnessActivity,
    ExtConfiguration,
    BinaryContent,
    ControlLedAndReboot,
    SwitchStatus,
    ImageInfo,
    HeartRate,
    BodySensorLocation,
    GeneralPurpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchState {
    Off,
    On,
    Error,
}

impl SwitchState {
    fn from_byte(value: u8) -> Self {
        match value {
            0 => SwitchState::Off,
            1 => SwitchState::On,
            _ => SwitchState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatteryStatus {
    LowBattery,
    Discharging,
    PluggedNotCharging,
    Charging,
    Unknown,
    Error,
}

impl BatteryStatus {
    fn from_byte(value: u8) -> Self {
        match value & 0x7F {
            0x00 => BatteryStatus::LowBattery,
            0x01 => BatteryStatus::Discharging,
            0x02 => BatteryStatus::PluggedNotCharging,
            0x03 => BatteryStatus::Charging,
            0x04 => BatteryStatus::Unknown,
            _ => BatteryStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivityType {
    NoActivity,
    Stationary,
    Walking,
    FastWalking,
    Jogging,
    Biking,
    Driving,
    Stairs,
    AdultInCar,
    Error,
}

impl ActivityType {
    fn from_byte(value: u8) -> Self {
        match value {
            0x00 => ActivityType::NoActivity,
            0x01 => ActivityType::Stationary,
            0x02 => ActivityType::Walking,
            0x03 => ActivityType::FastWalking,
            0x04 => ActivityType::Jogging,
            0x05 => ActivityType::Biking,
            0x06 => ActivityType::Driving,
            0x07 => ActivityType::Stairs,
            0x08 => ActivityType::AdultInCar,
            _ => ActivityType::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CarryPosition {
    Unknown,
    OnDesk,
    InHand,
    NearHead,
    ShirtPocket,
    TrousersPocket,
    ArmSwing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemsGesture {
    Unknown,
    PickUp,
    Glance,
    WakeUp,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitnessActivityType {
    NoActivity,
    BicepCurl,
    Squat,
    PushUp,
    Error,
}

impl FitnessActivityType {
    pub fn code(self) -> u8 {
        match self {
            FitnessActivityType::NoActivity => 0x00,
            FitnessActivityType::BicepCurl => 0x01,
            FitnessActivityType::Squat => 0x02,
            FitnessActivityType::PushUp => 0x03,
            FitnessActivityType::Error => 0xFF,
        }
    }

    fn from_byte(value: u8) -> Self {
        match value {
            0x00 => FitnessActivityType::NoActivity,
            0x01 => FitnessActivityType::BicepCurl,
            0x02 => FitnessActivityType::Squat,
            0x03 => FitnessActivityType::PushUp,
            _ => FitnessActivityType::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BodySensorLocation {
    Other,
    Chest,
    Wrist,
    Finger,
    Hand,
    EarLobe,
    Foot,
    NotKnown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quaternion {
    pub qi: f32,
    pub qj: f32,
    pub qk: f32,
    pub qs: f32,
}

impl Quaternion {
    fn from_vector(qi: f32, qj: f32, qk: f32) -> Self {
        let qs = (1.0 - (qi * qi + qj * qj + qk * qk)).max(0.0).sqrt();
        Self { qi, qj, qk, qs }
    }
}

/// Typed payload of one [`super::FeatureUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureSample {
    Axes { x: f32, y: f32, z: f32, unit: &'static str },
    Scalar { value: f32, unit: &'static str },
    Counter { value: u32 },
    Code { value: u8 },
    Switch { status: SwitchState },
    Battery {
        percentage: f32,
        voltage: f32,
        current: f32,
        status: BatteryStatus,
    },
    MicLevel { levels: Vec<u8> },
    /// `None` when the sensor reports out of range
    Proximity { distance: Option<u16> },
    Pedometer { steps: u32, frequency: u16 },
    Activity { activity: ActivityType, algorithm: Option<u8> },
    CarryPosition { position: CarryPosition },
    MemsGesture { gesture: MemsGesture },
    Angles { yaw: f32, pitch: f32, roll: f32 },
    Quaternion(Quaternion),
    Quaternions { values: Vec<Quaternion> },
    FitnessActivity { activity: FitnessActivityType, count: u16 },
    HeartRate {
        bpm: u16,
        energy_expended: Option<u16>,
        rr_intervals: Vec<f32>,
        skin_contact: Option<bool>,
    },
    BodySensorLocation { location: BodySensorLocation },
    SwitchStatus { device_id: u8, pressed: bool },
    ImageInfo {
        flash_lower_bound: u32,
        flash_upper_bound: u32,
        protocol_version: Option<(u8, u8)>,
    },
    AudioSync { index: i16, predicted_sample: i32 },
    Raw { bytes: Vec<u8> },
    Empty,
}

/// Command sent to the extended configuration characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtConfigCommand {
    pub command: String,
    #[serde(rename = "argString", skip_serializing_if = "Option::is_none", default)]
    pub arg_string: Option<String>,
    #[serde(rename = "argNumber", skip_serializing_if = "Option::is_none", default)]
    pub arg_number: Option<i64>,
}

impl ExtConfigCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arg_string: None,
            arg_number: None,
        }
    }

    pub fn with_string(mut self, arg: impl Into<String>) -> Self {
        self.arg_string = Some(arg.into());
        self
    }

    pub fn with_number(mut self, arg: i64) -> Self {
        self.arg_number = Some(arg);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtConfigAnswer {
    #[serde(rename = "Commands", default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<String>,
    #[serde(rename = "Info", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(rename = "Help", default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(rename = "Certificate", default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(rename = "VersionFw", default, skip_serializing_if = "Option::is_none")]
    pub version_fw: Option<String>,
    #[serde(rename = "UID", default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "PowerStatus", default, skip_serializing_if = "Option::is_none")]
    pub power_status: Option<String>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const PROXIMITY_OUT_OF_RANGE_FLAG: u16 = 0x8000;
const PROXIMITY_LOW_RANGE_MAX: u16 = 0x00FE;
const PROXIMITY_HIGH_RANGE_MAX: u16 = 0x7FFE;
const CALIBRATED_STATUS: u8 = 100;

fn u8_at(name: &'static str, data: &[u8], offset: usize) -> Result<u8, DecodeError> {
    DecodeError::ensure(name, data, offset, 1)?;
    Ok(data[offset])
}

fn i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_bits(u32_le(data, offset))
}

impl FeatureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::AudioAdpcmSync => "AudioADPCMSync",
            FeatureKind::AudioAdpcm => "AudioADPCM",
            FeatureKind::Switch => "Switch",
            FeatureKind::MemsNorm => "MemsNorm",
            FeatureKind::MicLevel => "MicLevel",
            FeatureKind::AudioClassification => "AudioClassification",
            FeatureKind::Proximity => "Proximity",
            FeatureKind::Luminosity => "Luminosity",
            FeatureKind::Acceleration => "Acceleration",
            FeatureKind::Gyroscope => "Gyroscope",
            FeatureKind::Magnetometer => "Magnetometer",
            FeatureKind::Pressure => "Pressure",
            FeatureKind::Humidity => "Humidity",
            FeatureKind::Temperature => "Temperature",
            FeatureKind::Battery => "Battery",
            FeatureKind::CoSensor => "COSensor",
            FeatureKind::EulerAngle => "EulerAngle",
            FeatureKind::SdLogging => "SDLogging",
            FeatureKind::StepperMotor => "StepperMotor",
            FeatureKind::AccelerationEvent => "AccelerationEvent",
            FeatureKind::BeamForming => "BeamForming",
            FeatureKind::FreeFall => "FreeFall",
            FeatureKind::EventCounter => "EventCounter",
            FeatureKind::SensorFusionCompat => "MemsSensorFusionCompat",
            FeatureKind::SensorFusion => "MemsSensorFusion",
            FeatureKind::Compass => "Compass",
            FeatureKind::MotionIntensity => "MotionIntensity",
            FeatureKind::Activity => "Activity",
            FeatureKind::CarryPosition => "CarryPosition",
            FeatureKind::ProximityGesture => "ProximityGesture",
            FeatureKind::MemsGesture => "MemsGesture",
            FeatureKind::Pedometer => "Pedometer",
            FeatureKind::DirectionOfArrival => "DirectionOfArrival",
            FeatureKind::AudioOpus => "AudioOpus",
            FeatureKind::AudioOpusConf => "AudioOpusConf",
            FeatureKind::FitnessActivity => "FitnessActivity",
            FeatureKind::ExtConfiguration => "ExtConfiguration",
            FeatureKind::BinaryContent => "BinaryContent",
            FeatureKind::ControlLedAndReboot => "ControlLedAndReboot",
            FeatureKind::SwitchStatus => "SwitchStatus",
            FeatureKind::ImageInfo => "ImageFeature",
            FeatureKind::HeartRate => "HeartRate",
            FeatureKind::BodySensorLocation => "BodySensorLocation",
            FeatureKind::GeneralPurpose => "GeneralPurpose",
        }
    }

    pub fn has_timestamp(&self) -> bool {
        !matches!(
            self,
            FeatureKind::AudioAdpcmSync
                | FeatureKind::AudioAdpcm
                | FeatureKind::AudioOpus
                | FeatureKind::AudioOpusConf
                | FeatureKind::ExtConfiguration
                | FeatureKind::BinaryContent
                | FeatureKind::ControlLedAndReboot
                | FeatureKind::SwitchStatus
                | FeatureKind::ImageInfo
                | FeatureKind::HeartRate
                | FeatureKind::BodySensorLocation
        )
    }

    pub fn is_data_notify(&self) -> bool {
        !matches!(
            self,
            FeatureKind::SdLogging
                | FeatureKind::StepperMotor
                | FeatureKind::ExtConfiguration
                | FeatureKind::BinaryContent
                | FeatureKind::ControlLedAndReboot
                | FeatureKind::ImageInfo
        )
    }

    /// Responses arrive STL2-framed and must be reassembled first.
    pub fn is_stl2_framed(&self) -> bool {
        matches!(self, FeatureKind::ExtConfiguration | FeatureKind::BinaryContent)
    }

    pub fn max_write_payload(&self) -> Option<usize> {
        self.is_stl2_framed().then_some(stl2::DEFAULT_PACKET_SIZE)
    }

    /// Decodes one sample at `offset`, returning it with the number of
    /// bytes it occupies.
    pub fn decode(&self, data: &[u8], offset: usize) -> Result<(FeatureSample, usize), DecodeError> {
        let name = self.name();
        let need = |n: usize| DecodeError::ensure(name, data, offset, n);
        let available = data.len().saturating_sub(offset);

        let decoded = match self {
            FeatureKind::Acceleration | FeatureKind::Gyroscope | FeatureKind::Magnetometer => {
                need(6)?;
                let (scale, unit) = match self {
                    FeatureKind::Gyroscope => (0.1, "dps"),
                    FeatureKind::Magnetometer => (1.0, "mGa"),
                    _ => (1.0, "mg"),
                };
                let axis = |i: usize| f32::from(i16_le(data, offset + 2 * i)) * scale;
                (
                    FeatureSample::Axes {
                        x: axis(0),
                        y: axis(1),
                        z: axis(2),
                        unit,
                    },
                    6,
                )
            }
            FeatureKind::Temperature | FeatureKind::MemsNorm => {
                need(2)?;
                let unit = if *self == FeatureKind::Temperature { "°C" } else { "mg" };
                let value = f32::from(i16_le(data, offset)) / 10.0;
                (FeatureSample::Scalar { value, unit }, 2)
            }
            FeatureKind::Humidity => {
                need(2)?;
                let value = f32::from(u16_le(data, offset)) / 10.0;
                (FeatureSample::Scalar { value, unit: "%" }, 2)
            }
            FeatureKind::Pressure | FeatureKind::CoSensor => {
                need(4)?;
                let unit = if *self == FeatureKind::Pressure { "mBar" } else { "ppm" };
                let value = i32_le(data, offset) as f32 / 100.0;
                (FeatureSample::Scalar { value, unit }, 4)
            }
            FeatureKind::Luminosity => {
                need(2)?;
                let value = f32::from(u16_le(data, offset));
                (FeatureSample::Scalar { value, unit: "Lux" }, 2)
            }
            FeatureKind::Compass => {
                need(2)?;
                let value = f32::from(u16_le(data, offset)) / 100.0;
                (FeatureSample::Scalar { value, unit: "°" }, 2)
            }
            FeatureKind::DirectionOfArrival => {
                need(2)?;
                let value = f32::from(i16_le(data, offset));
                (FeatureSample::Scalar { value, unit: "°" }, 2)
            }
            FeatureKind::Proximity => {
                need(2)?;
                let raw = u16_le(data, offset);
                let range = raw & !PROXIMITY_OUT_OF_RANGE_FLAG;
                let max = if raw & PROXIMITY_OUT_OF_RANGE_FLAG == 0 {
                    PROXIMITY_LOW_RANGE_MAX
                } else {
                    PROXIMITY_HIGH_RANGE_MAX
                };
                let distance = (range <= max).then_some(range);
                (FeatureSample::Proximity { distance }, 2)
            }
            FeatureKind::Switch => {
                let status = SwitchState::from_byte(u8_at(name, data, offset)?);
                (FeatureSample::Switch { status }, 1)
            }
            FeatureKind::Battery => {
                need(7)?;
                let percentage = (f32::from(i16_le(data, offset)) / 10.0).clamp(0.0, 100.0);
                let voltage = f32::from(i16_le(data, offset + 2)) / 1000.0;
                let raw_current = i16_le(data, offset + 4);
                let status_byte = data[offset + 6];
                let current = if raw_current == i16::MIN {
                    f32::NAN
                } else if status_byte & 0x80 != 0 {
                    f32::from(raw_current) * 0.1
                } else {
                    f32::from(raw_current)
                };
                (
                    FeatureSample::Battery {
                        percentage,
                        voltage,
                        current,
                        status: BatteryStatus::from_byte(status_byte),
                    },
                    7,
                )
            }
            FeatureKind::MicLevel => {
                need(1)?;
                let levels = data[offset..].to_vec();
                let consumed = levels.len();
                (FeatureSample::MicLevel { levels }, consumed)
            }
            FeatureKind::EventCounter => {
                need(4)?;
                (FeatureSample::Counter { value: u32_le(data, offset) }, 4)
            }
            FeatureKind::MotionIntensity => {
                let value = u8_at(name, data, offset)?;
                (FeatureSample::Counter { value: u32::from(value) }, 1)
            }
            FeatureKind::Pedometer => {
                need(6)?;
                (
                    FeatureSample::Pedometer {
                        steps: u32_le(data, offset),
                        frequency: u16_le(data, offset + 4),
                    },
                    6,
                )
            }
            FeatureKind::Activity => {
                let activity = ActivityType::from_byte(u8_at(name, data, offset)?);
                let algorithm = data.get(offset + 1).copied();
                let consumed = if algorithm.is_some() { 2 } else { 1 };
                (FeatureSample::Activity { activity, algorithm }, consumed)
            }
            FeatureKind::CarryPosition => {
                let position = match u8_at(name, data, offset)? & 0x0F {
                    0x00 => CarryPosition::Unknown,
                    0x01 => CarryPosition::OnDesk,
                    0x02 => CarryPosition::InHand,
                    0x03 => CarryPosition::NearHead,
                    0x04 => CarryPosition::ShirtPocket,
                    0x05 => CarryPosition::TrousersPocket,
                    0x06 => CarryPosition::ArmSwing,
                    _ => CarryPosition::Error,
                };
                (FeatureSample::CarryPosition { position }, 1)
            }
            FeatureKind::MemsGesture => {
                let gesture = match u8_at(name, data, offset)? & 0x0F {
                    0x00 => MemsGesture::Unknown,
                    0x01 => MemsGesture::PickUp,
                    0x02 => MemsGesture::Glance,
                    0x03 => MemsGesture::WakeUp,
                    _ => MemsGesture::Error,
                };
                (FeatureSample::MemsGesture { gesture }, 1)
            }
            FeatureKind::AudioClassification
            | FeatureKind::ProximityGesture
            | FeatureKind::BeamForming
            | FeatureKind::FreeFall
            | FeatureKind::SdLogging
            | FeatureKind::StepperMotor => {
                let value = u8_at(name, data, offset)?;
                (FeatureSample::Code { value }, 1)
            }
            FeatureKind::AccelerationEvent => {
                let value = u8_at(name, data, offset)?;
                // pedometer-enabled boards append a u16 step count
                if available >= 3 {
                    (FeatureSample::Counter { value: u32::from(u16_le(data, offset + 1)) }, 3)
                } else {
                    (FeatureSample::Code { value }, 1)
                }
            }
            FeatureKind::EulerAngle => {
                need(12)?;
                (
                    FeatureSample::Angles {
                        yaw: f32_le(data, offset),
                        pitch: f32_le(data, offset + 4),
                        roll: f32_le(data, offset + 8),
                    },
                    12,
                )
            }
            FeatureKind::SensorFusion => {
                need(12)?;
                let (qi, qj, qk) = (
                    f32_le(data, offset),
                    f32_le(data, offset + 4),
                    f32_le(data, offset + 8),
                );
                if available >= 16 {
                    let qs = f32_le(data, offset + 12);
                    (FeatureSample::Quaternion(Quaternion { qi, qj, qk, qs }), 16)
                } else {
                    (FeatureSample::Quaternion(Quaternion::from_vector(qi, qj, qk)), 12)
                }
            }
            FeatureKind::SensorFusionCompat => {
                need(6)?;
                let count = available / 6;
                let values = (0..count)
                    .map(|n| {
                        let base = offset + n * 6;
                        let component = |i: usize| f32::from(i16_le(data, base + 2 * i)) / 10_000.0;
                        Quaternion::from_vector(component(0), component(1), component(2))
                    })
                    .collect();
                (FeatureSample::Quaternions { values }, count * 6)
            }
            FeatureKind::AudioAdpcmSync => {
                need(6)?;
                (
                    FeatureSample::AudioSync {
                        index: i16_le(data, offset),
                        predicted_sample: i32_le(data, offset + 2),
                    },
                    6,
                )
            }
            FeatureKind::AudioAdpcm => {
                need(20)?;
                let bytes = data[offset..offset + 20].to_vec();
                (FeatureSample::Raw { bytes }, 20)
            }
            FeatureKind::AudioOpus
            | FeatureKind::AudioOpusConf
            | FeatureKind::BinaryContent
            | FeatureKind::GeneralPurpose => {
                let bytes = data.get(offset..).unwrap_or_default().to_vec();
                let consumed = bytes.len();
                (FeatureSample::Raw { bytes }, consumed)
            }
            FeatureKind::FitnessActivity => {
                need(3)?;
                (
                    FeatureSample::FitnessActivity {
                        activity: FitnessActivityType::from_byte(data[offset]),
                        count: u16_le(data, offset + 1),
                    },
                    3,
                )
            }
            FeatureKind::ExtConfiguration | FeatureKind::ControlLedAndReboot => (FeatureSample::Empty, 0),
            FeatureKind::SwitchStatus => {
                need(2)?;
                (
                    FeatureSample::SwitchStatus {
                        device_id: data[offset],
                        pressed: data[offset + 1] == 0x01,
                    },
                    2,
                )
            }
            FeatureKind::ImageInfo => {
                need(8)?;
                let protocol_version = data.get(offset + 8).map(|v| (v / 16, v % 16));
                let consumed = if protocol_version.is_some() { 9 } else { 8 };
                (
                    FeatureSample::ImageInfo {
                        flash_lower_bound: u32_be(data, offset),
                        flash_upper_bound: u32_be(data, offset + 4),
                        protocol_version,
                    },
                    consumed,
                )
            }
            FeatureKind::HeartRate => decode_heart_rate(data, offset)?,
            FeatureKind::BodySensorLocation => {
                let location = match u8_at(name, data, offset)? {
                    0 => BodySensorLocation::Other,
                    1 => BodySensorLocation::Chest,
                    2 => BodySensorLocation::Wrist,
                    3 => BodySensorLocation::Finger,
                    4 => BodySensorLocation::Hand,
                    5 => BodySensorLocation::EarLobe,
                    6 => BodySensorLocation::Foot,
                    _ => BodySensorLocation::NotKnown,
                };
                (FeatureSample::BodySensorLocation { location }, 1)
            }
        };
        Ok(decoded)
    }

    pub fn encode_command(&self, mask: Option<u32>, request: &CommandRequest) -> Option<Vec<u8>> {
        let command_id = request.command_id();
        match (self, request) {
            (FeatureKind::GeneralPurpose, _) => None,
            (FeatureKind::ControlLedAndReboot, CommandRequest::Led { device_id, .. })
            | (FeatureKind::ControlLedAndReboot, CommandRequest::Reboot { device_id }) => {
                Some(vec![*device_id, command_id])
            }
            (FeatureKind::ExtConfiguration, CommandRequest::ExtConfig(command)) => {
                let json = serde_json::to_vec(command).ok()?;
                Some(stl2::encapsulate(&json, stl2::DEFAULT_PACKET_SIZE))
            }
            (FeatureKind::FitnessActivity, CommandRequest::EnableFitnessActivity(_)) => {
                Some(vec![command_id])
            }
            (FeatureKind::Switch, CommandRequest::Switch { .. })
            | (
                FeatureKind::Battery,
                CommandRequest::BatteryCapacity | CommandRequest::BatteryMaxCurrent,
            )
            | (
                FeatureKind::Compass | FeatureKind::EulerAngle,
                CommandRequest::StartCalibration
                | CommandRequest::StopCalibration
                | CommandRequest::CalibrationStatus,
            ) => Some(pack_command(mask, command_id, &[])),
            (FeatureKind::DirectionOfArrival, CommandRequest::DirectionSensitivity { high }) => {
                Some(pack_command(mask, command_id, &[u8::from(*high)]))
            }
            (_, CommandRequest::Raw { params, .. }) => Some(pack_command(mask, command_id, params)),
            _ => None,
        }
    }

    pub fn expects_response(&self, class: FeatureClass, request: &CommandRequest) -> bool {
        match (self, request) {
            (FeatureKind::GeneralPurpose | FeatureKind::ControlLedAndReboot, _) => false,
            (FeatureKind::ExtConfiguration, CommandRequest::ExtConfig(_)) => true,
            (FeatureKind::Switch, CommandRequest::Switch { .. }) => true,
            (
                FeatureKind::Battery,
                CommandRequest::BatteryCapacity | CommandRequest::BatteryMaxCurrent,
            ) => true,
            (
                FeatureKind::Compass | FeatureKind::EulerAngle,
                CommandRequest::StartCalibration
                | CommandRequest::StopCalibration
                | CommandRequest::CalibrationStatus,
            ) => true,
            (_, CommandRequest::Raw { .. }) => class == FeatureClass::Standard,
            _ => false,
        }
    }

    /// Interprets a notification as a command answer. Standard features only
    /// accept answers carrying their own mask.
    pub fn parse_response(&self, id: FeatureId, data: &[u8]) -> Option<FeatureResponse> {
        match self {
            FeatureKind::GeneralPurpose | FeatureKind::ControlLedAndReboot => None,
            FeatureKind::ExtConfiguration => {
                let end = data.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                let answer = serde_json::from_slice::<ExtConfigAnswer>(&data[..end]).ok()?;
                Some(FeatureResponse::ExtConfig { feature: id, answer })
            }
            _ => {
                let raw = RawCommandResponse::unpack(data)?;
                let standard = id.class == FeatureClass::Standard;
                if standard && raw.mask != id.id {
                    return None;
                }
                match (self, raw.command_id) {
                    (FeatureKind::Switch, command_id) => Some(FeatureResponse::Switch {
                        feature: id,
                        command_id,
                        status: SwitchState::from_byte(*raw.payload.first()?),
                    }),
                    (FeatureKind::Battery, super::COMMAND_BATTERY_CAPACITY) if raw.payload.len() >= 2 => {
                        Some(FeatureResponse::BatteryCapacity {
                            feature: id,
                            capacity: u16_le(&raw.payload, 0),
                        })
                    }
                    (FeatureKind::Battery, super::COMMAND_BATTERY_MAX_CURRENT) if raw.payload.len() >= 2 => {
                        Some(FeatureResponse::BatteryMaxCurrent {
                            feature: id,
                            current: f32::from(i16_le(&raw.payload, 0)) / 10.0,
                        })
                    }
                    (
                        FeatureKind::Compass | FeatureKind::EulerAngle,
                        command_id @ (super::COMMAND_START_CALIBRATION
                        | super::COMMAND_STOP_CALIBRATION
                        | super::COMMAND_CALIBRATION_STATUS),
                    ) => Some(FeatureResponse::Calibration {
                        feature: id,
                        command_id,
                        calibrated: raw.payload.first() == Some(&CALIBRATED_STATUS),
                    }),
                    (_, command_id) if standard => Some(FeatureResponse::Raw {
                        feature: id,
                        command_id,
                        payload: raw.payload,
                    }),
                    _ => None,
                }
            }
        }
    }
}

fn decode_heart_rate(data: &[u8], offset: usize) -> Result<(FeatureSample, usize), DecodeError> {
    const NAME: &str = "HeartRate";
    let flags = u8_at(NAME, data, offset)?;
    let mut cursor = offset + 1;

    let bpm = if flags & 0x01 != 0 {
        DecodeError::ensure(NAME, data, cursor, 2)?;
        cursor += 2;
        u16_le(data, cursor - 2)
    } else {
        let value = u8_at(NAME, data, cursor)?;
        cursor += 1;
        u16::from(value)
    };

    let skin_contact = (flags & 0x04 != 0).then_some(flags & 0x02 != 0);

    let energy_expended = if flags & 0x08 != 0 {
        DecodeError::ensure(NAME, data, cursor, 2)?;
        cursor += 2;
        Some(u16_le(data, cursor - 2))
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags & 0x10 != 0 {
        while cursor + 1 < data.len() {
            rr_intervals.push(f32::from(u16_le(data, cursor)) / 1024.0);
            cursor += 2;
        }
    }

    Ok((
        FeatureSample::HeartRate {
            bpm,
            energy_expended,
            rr_intervals,
            skin_contact,
        },
        cursor - offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard(id: u32) -> FeatureId {
        FeatureId {
            class: FeatureClass::Standard,
            id,
        }
    }

    #[test]
    fn test_acceleration() {
        let data = [0, 0, 0x10, 0x00, 0xF0, 0xFF, 0xE8, 0x03];
        let (sample, consumed) = FeatureKind::Acceleration.decode(&data, 2).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(
            sample,
            FeatureSample::Axes {
                x: 16.0,
                y: -16.0,
                z: 1000.0,
                unit: "mg"
            }
        );
    }

    #[test]
    fn test_truncated_payload() {
        let err = FeatureKind::Pressure.decode(&[0, 0, 1, 2], 2).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                needed: 4,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_battery() {
        // 85.5 %, 3.9 V, -120 raw current scaled by 0.1, charging
        let mut data = vec![0, 0];
        data.extend_from_slice(&855i16.to_le_bytes());
        data.extend_from_slice(&3900i16.to_le_bytes());
        data.extend_from_slice(&(-120i16).to_le_bytes());
        data.push(0x83);
        let (sample, consumed) = FeatureKind::Battery.decode(&data, 2).unwrap();
        assert_eq!(consumed, 7);
        match sample {
            FeatureSample::Battery {
                percentage,
                voltage,
                current,
                status,
            } => {
                assert!((percentage - 85.5).abs() < 1e-4);
                assert!((voltage - 3.9).abs() < 1e-4);
                assert!((current + 12.0).abs() < 1e-4);
                assert_eq!(status, BatteryStatus::Charging);
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[test]
    fn test_battery_unknown_current() {
        let mut data = vec![0, 0, 0xE8, 0x03, 0, 0];
        data.extend_from_slice(&i16::MIN.to_le_bytes());
        data.push(0x01);
        let (sample, _) = FeatureKind::Battery.decode(&data, 0).unwrap();
        match sample {
            FeatureSample::Battery {
                percentage, current, ..
            } => {
                assert_eq!(percentage, 100.0);
                assert!(current.is_nan());
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[test]
    fn test_heart_rate_flags() {
        // 16-bit bpm, energy, two RR intervals, contact detected
        let data = [0x1F, 0x48, 0x00, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02];
        let (sample, consumed) = FeatureKind::HeartRate.decode(&data, 0).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(
            sample,
            FeatureSample::HeartRate {
                bpm: 72,
                energy_expended: Some(16),
                rr_intervals: vec![1.0, 0.5],
                skin_contact: Some(true),
            }
        );

        let (sample, consumed) = FeatureKind::HeartRate.decode(&[0x00, 60], 0).unwrap();
        assert_eq!(consumed, 2);
        assert!(matches!(
            sample,
            FeatureSample::HeartRate {
                bpm: 60,
                skin_contact: None,
                ..
            }
        ));
    }

    #[test]
    fn test_proximity_out_of_range() {
        let (sample, _) = FeatureKind::Proximity.decode(&[0xFF, 0x00], 0).unwrap();
        assert_eq!(sample, FeatureSample::Proximity { distance: None });
        let (sample, _) = FeatureKind::Proximity.decode(&[0x10, 0x80], 0).unwrap();
        assert_eq!(sample, FeatureSample::Proximity { distance: Some(0x10) });
    }

    #[test]
    fn test_switch_command_and_response() {
        let id = standard(0x2000_0000);
        let encoded = FeatureKind::Switch
            .encode_command(Some(id.id), &CommandRequest::Switch { on: true })
            .unwrap();
        assert_eq!(encoded, vec![0x20, 0, 0, 0, 0x01]);

        let answer = [0x01, 0x00, 0x20, 0, 0, 0, 0x01, 0x01];
        assert_eq!(
            FeatureKind::Switch.parse_response(id, &answer),
            Some(FeatureResponse::Switch {
                feature: id,
                command_id: 0x01,
                status: SwitchState::On
            })
        );
        // another feature's mask is not ours
        let other = [0x01, 0x00, 0x00, 0x80, 0, 0, 0x01, 0x01];
        assert_eq!(FeatureKind::Switch.parse_response(id, &other), None);
    }

    #[test]
    fn test_led_control_encoding() {
        let kind = FeatureKind::ControlLedAndReboot;
        let led = CommandRequest::Led {
            device_id: 0x01,
            on: true,
        };
        assert_eq!(kind.encode_command(None, &led), Some(vec![0x01, 0x01]));
        assert_eq!(
            kind.encode_command(None, &CommandRequest::Reboot { device_id: 0x03 }),
            Some(vec![0x03, 0x02])
        );
        assert!(!kind.expects_response(
            FeatureClass::External(super::super::ExternalFamily::Stm32),
            &led
        ));
    }

    #[test]
    fn test_general_purpose_rejects_commands() {
        let raw = CommandRequest::Raw {
            command_id: 1,
            params: vec![],
        };
        assert_eq!(FeatureKind::GeneralPurpose.encode_command(None, &raw), None);
    }

    #[test]
    fn test_ext_config_answer() {
        let id = FeatureId {
            class: FeatureClass::Extended,
            id: 0x14,
        };
        let text = b"{\"VersionFw\":\"FP-SNS-1.0\"}\0";
        let response = FeatureKind::ExtConfiguration.parse_response(id, text).unwrap();
        match response {
            FeatureResponse::ExtConfig { answer, .. } => {
                assert_eq!(answer.version_fw.as_deref(), Some("FP-SNS-1.0"));
                assert_eq!(answer.error, None);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_ext_config_command_json() {
        let command = ExtConfigCommand::new("SetName").with_string("node");
        let json = serde_json::to_string(&command).unwrap();
        assert_eq!(json, r#"{"command":"SetName","argString":"node"}"#);
    }

    #[test]
    fn test_timestamp_flags() {
        assert!(FeatureKind::Acceleration.has_timestamp());
        assert!(!FeatureKind::HeartRate.has_timestamp());
        assert!(!FeatureKind::ControlLedAndReboot.is_data_notify());
    }
}
