//! Characteristic to feature resolution.
//!
//! Characteristic UUIDs are split into a numeric prefix and a well-known
//! suffix. The suffix picks the feature class, the prefix picks the kind:
//!
//! ```text
//! xxxxxxxx-0001-11e1-ac36-0002a5d5c51b   standard, prefix is a mask of packed features
//! xxxxxxxx-0002-11e1-ac36-0002a5d5c51b   extended, prefix is one id
//! xxxxxxxx-8508-11e3-baa7-0800200c9a66   external BlueNRG OTA
//! xxxxxxxx-8e22-4541-9d4c-21edae82ed19   external STM32
//! xxxxxxxx-0000-1000-8000-00805f9b34fb   external standard chart (SIG)
//! xxxx0000-0003-11e1-ac36-0002a5d5c51b   general purpose passthrough
//! ```
//!
//! The registry is built once and only read afterwards, apart from the
//! general-purpose cache filled on first sight of each id. Tables hold
//! shared `Arc<Feature>` instances so every session hands out the same objects.

use super::{ExternalFamily, Feature, FeatureClass, FeatureId, FeatureKind};
use crate::domain::boards::BoardModel;
use crate::error::RegistryError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SUFFIX_BITS: u32 = 96;
const SUFFIX_MASK: u128 = (1 << SUFFIX_BITS) - 1;
const GP_SUFFIX_BITS: u32 = 112;
const GP_SUFFIX_MASK: u128 = (1 << GP_SUFFIX_BITS) - 1;

const STANDARD_SUFFIX: u128 = 0x0001_11e1_ac36_0002_a5d5_c51b;
const EXTENDED_SUFFIX: u128 = 0x0002_11e1_ac36_0002_a5d5_c51b;
const BLUE_NRG_OTA_SUFFIX: u128 = 0x8508_11e3_baa7_0800_200c_9a66;
const STM32_SUFFIX: u128 = 0x8e22_4541_9d4c_21ed_ae82_ed19;
const STD_CHART_SUFFIX: u128 = 0x0000_1000_8000_0080_5f9b_34fb;
const GENERAL_PURPOSE_SUFFIX: u128 = 0x0000_0003_11e1_ac36_0002_a5d5_c51b;

/// Splits a characteristic UUID into its feature class and numeric prefix.
pub fn classify(uuid: &Uuid) -> Option<(FeatureClass, u32)> {
    let value = uuid.as_u128();
    let prefix = (value >> SUFFIX_BITS) as u32;
    let class = match value & SUFFIX_MASK {
        STANDARD_SUFFIX => Some(FeatureClass::Standard),
        EXTENDED_SUFFIX => Some(FeatureClass::Extended),
        BLUE_NRG_OTA_SUFFIX => Some(FeatureClass::External(ExternalFamily::BlueNrgOta)),
        STM32_SUFFIX => Some(FeatureClass::External(ExternalFamily::Stm32)),
        STD_CHART_SUFFIX => Some(FeatureClass::External(ExternalFamily::StdChart)),
        _ => None,
    };
    if let Some(class) = class {
        return Some((class, prefix));
    }
    if value & GP_SUFFIX_MASK == GENERAL_PURPOSE_SUFFIX {
        return Some((FeatureClass::GeneralPurpose, (value >> GP_SUFFIX_BITS) as u32));
    }
    None
}

/// Builds the characteristic UUID a feature class/prefix pair lives on.
pub fn characteristic_uuid(class: FeatureClass, prefix: u32) -> Uuid {
    let value = match class {
        FeatureClass::GeneralPurpose => {
            (u128::from(prefix & 0xFFFF) << GP_SUFFIX_BITS) | GENERAL_PURPOSE_SUFFIX
        }
        _ => {
            let suffix = match class {
                FeatureClass::Standard => STANDARD_SUFFIX,
                FeatureClass::Extended => EXTENDED_SUFFIX,
                FeatureClass::External(ExternalFamily::BlueNrgOta) => BLUE_NRG_OTA_SUFFIX,
                FeatureClass::External(ExternalFamily::Stm32) => STM32_SUFFIX,
                FeatureClass::External(ExternalFamily::StdChart) => STD_CHART_SUFFIX,
                FeatureClass::GeneralPurpose => GENERAL_PURPOSE_SUFFIX,
            };
            (u128::from(prefix) << SUFFIX_BITS) | suffix
        }
    };
    Uuid::from_u128(value)
}

/// Features resolved for one characteristic. Unknown mask bits are
/// reported per bit and do not drop the bits that did resolve.
#[derive(Debug, Default)]
pub struct ResolvedFeatures {
    pub features: Vec<Arc<Feature>>,
    pub errors: Vec<RegistryError>,
}

type Table = HashMap<u32, Arc<Feature>>;

#[derive(Debug, Default)]
pub struct FeatureRegistry {
    standard_default: Table,
    standard_by_board: HashMap<BoardModel, Table>,
    extended: Table,
    external: HashMap<ExternalFamily, Table>,
    general_purpose: Mutex<Table>,
}

#[derive(Debug, Default)]
pub struct FeatureRegistryBuilder {
    registry: FeatureRegistry,
}

fn shared(class: FeatureClass, id: u32, kind: FeatureKind) -> Arc<Feature> {
    Arc::new(Feature::new(FeatureId { class, id }, kind))
}

impl FeatureRegistryBuilder {
    /// Registers a standard mask bit, for one board model or (with `None`)
    /// for every board without its own table.
    pub fn standard(mut self, board: Option<BoardModel>, mask: u32, kind: FeatureKind) -> Self {
        let feature = shared(FeatureClass::Standard, mask, kind);
        let table = match board {
            Some(board) => self.registry.standard_by_board.entry(board).or_default(),
            None => &mut self.registry.standard_default,
        };
        table.insert(mask, feature);
        self
    }

    pub fn extended(mut self, id: u32, kind: FeatureKind) -> Self {
        let feature = shared(FeatureClass::Extended, id, kind);
        self.registry.extended.insert(id, feature);
        self
    }

    pub fn external(mut self, family: ExternalFamily, id: u32, kind: FeatureKind) -> Self {
        let feature = shared(FeatureClass::External(family), id, kind);
        self.registry.external.entry(family).or_default().insert(id, feature);
        self
    }

    pub fn build(self) -> FeatureRegistry {
        self.registry
    }
}

const SENSOR_TILE_BOX_STANDARD: &[(u32, FeatureKind)] = &[
    (0x4000_0000, FeatureKind::AudioAdpcmSync),
    (0x2000_0000, FeatureKind::Switch),
    (0x1000_0000, FeatureKind::MemsNorm),
    (0x0800_0000, FeatureKind::AudioAdpcm),
    (0x0400_0000, FeatureKind::MicLevel),
    (0x0200_0000, FeatureKind::AudioClassification),
    (0x0080_0000, FeatureKind::Acceleration),
    (0x0040_0000, FeatureKind::Gyroscope),
    (0x0020_0000, FeatureKind::Magnetometer),
    (0x0010_0000, FeatureKind::Pressure),
    (0x0008_0000, FeatureKind::Humidity),
    (0x0004_0000, FeatureKind::Temperature),
    (0x0002_0000, FeatureKind::Battery),
    (0x0001_0000, FeatureKind::Temperature),
    (0x0000_4000, FeatureKind::EulerAngle),
    (0x0000_1000, FeatureKind::SdLogging),
    (0x0000_0400, FeatureKind::AccelerationEvent),
    (0x0000_0200, FeatureKind::EventCounter),
    (0x0000_0100, FeatureKind::SensorFusionCompat),
    (0x0000_0080, FeatureKind::SensorFusion),
    (0x0000_0040, FeatureKind::Compass),
    (0x0000_0020, FeatureKind::MotionIntensity),
    (0x0000_0010, FeatureKind::Activity),
    (0x0000_0008, FeatureKind::CarryPosition),
    (0x0000_0002, FeatureKind::MemsGesture),
    (0x0000_0001, FeatureKind::Pedometer),
];

const DEFAULT_STANDARD: &[(u32, FeatureKind)] = &[
    (0x4000_0000, FeatureKind::AudioAdpcmSync),
    (0x2000_0000, FeatureKind::Switch),
    (0x1000_0000, FeatureKind::DirectionOfArrival),
    (0x0800_0000, FeatureKind::AudioAdpcm),
    (0x0400_0000, FeatureKind::MicLevel),
    (0x0200_0000, FeatureKind::Proximity),
    (0x0100_0000, FeatureKind::Luminosity),
    (0x0080_0000, FeatureKind::Acceleration),
    (0x0040_0000, FeatureKind::Gyroscope),
    (0x0020_0000, FeatureKind::Magnetometer),
    (0x0010_0000, FeatureKind::Pressure),
    (0x0008_0000, FeatureKind::Humidity),
    (0x0004_0000, FeatureKind::Temperature),
    (0x0002_0000, FeatureKind::Battery),
    (0x0001_0000, FeatureKind::Temperature),
    (0x0000_8000, FeatureKind::CoSensor),
    (0x0000_2000, FeatureKind::StepperMotor),
    (0x0000_1000, FeatureKind::SdLogging),
    (0x0000_0800, FeatureKind::BeamForming),
    (0x0000_0400, FeatureKind::AccelerationEvent),
    (0x0000_0200, FeatureKind::FreeFall),
    (0x0000_0100, FeatureKind::SensorFusionCompat),
    (0x0000_0080, FeatureKind::SensorFusion),
    (0x0000_0040, FeatureKind::Compass),
    (0x0000_0020, FeatureKind::MotionIntensity),
    (0x0000_0010, FeatureKind::Activity),
    (0x0000_0008, FeatureKind::CarryPosition),
    (0x0000_0004, FeatureKind::ProximityGesture),
    (0x0000_0002, FeatureKind::MemsGesture),
    (0x0000_0001, FeatureKind::Pedometer),
];

const EXTENDED: &[(u32, FeatureKind)] = &[
    (0x01, FeatureKind::AudioOpus),
    (0x02, FeatureKind::AudioOpusConf),
    (0x03, FeatureKind::AudioClassification),
    (0x0D, FeatureKind::EulerAngle),
    (0x0E, FeatureKind::FitnessActivity),
    (0x14, FeatureKind::ExtConfiguration),
    (0x1D, FeatureKind::EventCounter),
    (0x21, FeatureKind::MemsNorm),
    (0x22, FeatureKind::BinaryContent),
];

const EXTERNAL: &[(ExternalFamily, u32, FeatureKind)] = &[
    (ExternalFamily::Stm32, 0x0000_fe41, FeatureKind::ControlLedAndReboot),
    (ExternalFamily::Stm32, 0x0000_fe42, FeatureKind::SwitchStatus),
    (ExternalFamily::BlueNrgOta, 0x122e_8cc0, FeatureKind::ImageInfo),
    (ExternalFamily::StdChart, 0x0000_2a37, FeatureKind::HeartRate),
    (ExternalFamily::StdChart, 0x0000_2a38, FeatureKind::BodySensorLocation),
];

impl FeatureRegistry {
    pub fn builder() -> FeatureRegistryBuilder {
        FeatureRegistryBuilder::default()
    }

    /// Registry with every feature kind this crate knows.
    pub fn with_defaults() -> Self {
        let mut builder = Self::builder();
        for &(mask, kind) in SENSOR_TILE_BOX_STANDARD {
            builder = builder.standard(Some(BoardModel::SensorTileBox), mask, kind);
        }
        for &(mask, kind) in DEFAULT_STANDARD {
            builder = builder.standard(None, mask, kind);
        }
        for &(id, kind) in EXTENDED {
            builder = builder.extended(id, kind);
        }
        for &(family, id, kind) in EXTERNAL {
            builder = builder.external(family, id, kind);
        }
        builder.build()
    }

    fn standard_table(&self, board: BoardModel) -> &Table {
        self.standard_by_board
            .get(&board)
            .unwrap_or(&self.standard_default)
    }

    /// Looks up a single standard feature by its mask bit.
    pub fn standard_feature(&self, board: BoardModel, mask: u32) -> Result<Arc<Feature>, RegistryError> {
        self.standard_table(board)
            .get(&mask)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIdentifier {
                class: FeatureClass::Standard.to_string(),
                id: mask,
            })
    }

    /// One feature per set bit, walking from bit 31 down to bit 0.
    pub fn standard_features(&self, board: BoardModel, mask: u32) -> ResolvedFeatures {
        let mut resolved = ResolvedFeatures::default();
        for bit in (0..32).rev() {
            let bit_mask = 1u32 << bit;
            if mask & bit_mask == 0 {
                continue;
            }
            match self.standard_feature(board, bit_mask) {
                Ok(feature) => resolved.features.push(feature),
                Err(e) => resolved.errors.push(e),
            }
        }
        resolved
    }

    fn one_to_one(&self, class: FeatureClass, id: u32) -> Result<Arc<Feature>, RegistryError> {
        let table = match class {
            FeatureClass::Extended => Some(&self.extended),
            FeatureClass::External(family) => self.external.get(&family),
            _ => None,
        };
        table
            .and_then(|table| table.get(&id))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownIdentifier {
                class: class.to_string(),
                id,
            })
    }

    fn general_purpose(&self, id: u32) -> Arc<Feature> {
        let mut cache = self
            .general_purpose
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .entry(id)
            .or_insert_with(|| shared(FeatureClass::GeneralPurpose, id, FeatureKind::GeneralPurpose))
            .clone()
    }

    /// Resolves the features carried by one discovered characteristic.
    pub fn resolve(&self, uuid: &Uuid, board: BoardModel) -> Result<ResolvedFeatures, RegistryError> {
        let (class, prefix) = classify(uuid).ok_or(RegistryError::UnknownFamily(*uuid))?;
        match class {
            FeatureClass::Standard => Ok(self.standard_features(board, prefix)),
            FeatureClass::GeneralPurpose => Ok(ResolvedFeatures {
                features: vec![self.general_purpose(prefix)],
                errors: Vec::new(),
            }),
            _ => Ok(ResolvedFeatures {
                features: vec![self.one_to_one(class, prefix)?],
                errors: Vec::new(),
            }),
        }
    }
}
