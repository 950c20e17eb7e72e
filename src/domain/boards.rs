//! Board models and the static identifier tables used to resolve them.

use serde::{Deserialize, Serialize};

/// Known board models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardModel {
    /// Unknown or user defined board
    Generic,
    StevalWesu1,
    SensorTile,
    BlueCoin,
    /// BlueNRG1 & BlueNRG2 eval board
    StevalIdb008vx,
    /// BlueNRG-Tile eval board
    StevalBcn002v1,
    SensorTileBox,
    DiscoveryIot01a,
    StevalStwinkit1,
    StevalStwinkt1b,
    BL475eIot01a,
    BU585iIot02a,
    Astra1,
    SensorTileBoxPro,
    SensorTileBoxProB,
    StwinBox,
    StwinBoxB,
    Proteus,
    StdesCbmLoraBle,
    WbBoard,
    WbaBoard,
    NucleoWb09ke,
    Nucleo,
    NucleoF401re,
    NucleoL476rg,
    NucleoL053r8,
    NucleoF446re,
}

/// Coarse grouping used by consumers that only care about the radio/MCU family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardFamily {
    BlueNrg,
    Stm32,
    Nucleo,
    Wb,
    Wba,
    Other,
}

impl BoardModel {
    /// Resolves a board model from the advertised device id.
    ///
    /// Protocol v1 boards use the legacy table; v2 and later share the
    /// extended one. Unknown ids map to [`BoardModel::Generic`].
    pub fn from_identifier(device_id: u8, protocol_version: u8) -> BoardModel {
        if protocol_version <= 1 {
            Self::from_v1_identifier(device_id)
        } else {
            Self::from_v2_identifier(device_id)
        }
    }

    fn from_v1_identifier(device_id: u8) -> BoardModel {
        match device_id {
            0x01 => BoardModel::StevalWesu1,
            0x02 => BoardModel::SensorTile,
            0x03 => BoardModel::BlueCoin,
            0x04 => BoardModel::StevalIdb008vx,
            0x05 => BoardModel::StevalBcn002v1,
            0x06 => BoardModel::SensorTileBox,
            0x07 => BoardModel::DiscoveryIot01a,
            0x80..=0xFF => BoardModel::Nucleo,
            _ => BoardModel::Generic,
        }
    }

    fn from_v2_identifier(device_id: u8) -> BoardModel {
        match device_id {
            0x01 => BoardModel::StevalWesu1,
            0x02 => BoardModel::SensorTile,
            0x03 => BoardModel::BlueCoin,
            0x04 => BoardModel::StevalIdb008vx,
            0x05 => BoardModel::StevalBcn002v1,
            0x06 => BoardModel::SensorTileBox,
            0x07 => BoardModel::DiscoveryIot01a,
            0x08 => BoardModel::StevalStwinkit1,
            0x09 => BoardModel::StevalStwinkt1b,
            0x0A => BoardModel::BL475eIot01a,
            0x0B => BoardModel::BU585iIot02a,
            0x0C => BoardModel::Astra1,
            0x0D => BoardModel::SensorTileBoxPro,
            0x0E => BoardModel::StwinBox,
            0x0F => BoardModel::Proteus,
            0x10 => BoardModel::StdesCbmLoraBle,
            0x11 => BoardModel::SensorTileBoxProB,
            0x12 => BoardModel::StwinBoxB,
            0x80 => BoardModel::Nucleo,
            0x7F => BoardModel::NucleoF401re,
            0x7E => BoardModel::NucleoL476rg,
            0x7D => BoardModel::NucleoL053r8,
            0x7C => BoardModel::NucleoF446re,
            0x8D => BoardModel::NucleoWb09ke,
            0x81..=0x8A => BoardModel::WbBoard,
            0x8B..=0x8C => BoardModel::WbaBoard,
            _ => BoardModel::Generic,
        }
    }

    pub fn family(&self) -> BoardFamily {
        match self {
            BoardModel::StevalWesu1 | BoardModel::StevalIdb008vx | BoardModel::StevalBcn002v1 => {
                BoardFamily::BlueNrg
            }
            BoardModel::SensorTile
            | BoardModel::BlueCoin
            | BoardModel::SensorTileBox
            | BoardModel::DiscoveryIot01a
            | BoardModel::StevalStwinkit1
            | BoardModel::StevalStwinkt1b
            | BoardModel::BL475eIot01a
            | BoardModel::BU585iIot02a
            | BoardModel::Astra1
            | BoardModel::SensorTileBoxPro
            | BoardModel::SensorTileBoxProB
            | BoardModel::StwinBox
            | BoardModel::StwinBoxB
            | BoardModel::Proteus
            | BoardModel::StdesCbmLoraBle => BoardFamily::Stm32,
            BoardModel::Nucleo
            | BoardModel::NucleoF401re
            | BoardModel::NucleoL476rg
            | BoardModel::NucleoL053r8
            | BoardModel::NucleoF446re => BoardFamily::Nucleo,
            BoardModel::WbBoard | BoardModel::NucleoWb09ke => BoardFamily::Wb,
            BoardModel::WbaBoard => BoardFamily::Wba,
            BoardModel::Generic => BoardFamily::Other,
        }
    }

    /// Boards whose device id byte carries the sleeping and general-purpose flags.
    pub fn has_status_flags(&self) -> bool {
        matches!(
            self,
            BoardModel::StevalWesu1 | BoardModel::StevalIdb008vx | BoardModel::StevalBcn002v1
        )
    }
}
