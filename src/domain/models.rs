use crate::domain::boards::{BoardFamily, BoardModel};
use serde::{Deserialize, Serialize};

/// Advertisement format a device identity was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisementDialect {
    /// Protocol v1/v2: `[version][deviceId][u32 mask or option bytes][mac?]`
    Classic,
    /// Protocol v3: `[version][deviceId][firmwareId][u16 protocolId][payload]`
    Extended,
    /// Board running the OTA bootloader
    Bootloader,
}

/// What a board says about itself in its advertisement.
///
/// Never mutated: a fresher advertisement for the same address produces a
/// new identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub tx_power: i8,
    /// MAC address embedded in the vendor field, when the board includes it
    pub embedded_address: Option<String>,
    pub dialect: AdvertisementDialect,
    pub protocol_version: u8,
    pub device_id: u8,
    pub board_model: BoardModel,
    pub sleeping: bool,
    pub general_purpose: bool,
    /// v1 feature mask or v2 option bytes, depending on `protocol_version`
    feature_word: u32,
    firmware_id: Option<u8>,
    pub protocol_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl DeviceIdentity {
    #[allow(clippy::too_many_arguments)]
    pub fn classic(
        name: String,
        tx_power: i8,
        embedded_address: Option<String>,
        protocol_version: u8,
        device_id: u8,
        board_model: BoardModel,
        feature_word: u32,
        sleeping: bool,
        general_purpose: bool,
    ) -> Self {
        Self {
            name,
            tx_power,
            embedded_address,
            dialect: AdvertisementDialect::Classic,
            protocol_version,
            device_id,
            board_model,
            sleeping,
            general_purpose,
            feature_word,
            firmware_id: None,
            protocol_id: None,
            payload: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn extended(
        name: String,
        tx_power: i8,
        protocol_version: u8,
        device_id: u8,
        board_model: BoardModel,
        firmware_id: u8,
        protocol_id: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            name,
            tx_power,
            embedded_address: None,
            dialect: AdvertisementDialect::Extended,
            protocol_version,
            device_id,
            board_model,
            sleeping: false,
            general_purpose: false,
            feature_word: 0,
            firmware_id: Some(firmware_id),
            protocol_id: Some(protocol_id),
            payload,
        }
    }

    pub fn bootloader(name: String, tx_power: i8) -> Self {
        Self {
            name,
            tx_power,
            embedded_address: None,
            dialect: AdvertisementDialect::Bootloader,
            protocol_version: 0,
            device_id: 0,
            board_model: BoardModel::Generic,
            sleeping: false,
            general_purpose: false,
            feature_word: 0,
            firmware_id: None,
            protocol_id: None,
            payload: Vec::new(),
        }
    }

    pub fn board_family(&self) -> BoardFamily {
        self.board_model.family()
    }

    /// Feature-availability mask; only protocol v1 advertises one.
    pub fn feature_mask(&self) -> Option<u32> {
        (self.dialect == AdvertisementDialect::Classic && self.protocol_version == 1)
            .then_some(self.feature_word)
    }

    /// Option-byte block; advertised by protocol v2 boards.
    pub fn option_bytes(&self) -> Option<[u8; 4]> {
        (self.dialect == AdvertisementDialect::Classic && self.protocol_version >= 2)
            .then(|| self.feature_word.to_be_bytes())
    }

    /// Firmware id used for board catalog lookups.
    ///
    /// v3 boards advertise it directly; v2 boards carry it in option byte 0.
    pub fn firmware_id(&self) -> Option<u8> {
        self.firmware_id
            .or_else(|| self.option_bytes().map(|bytes| bytes[0]))
    }
}

/// Connection lifecycle of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    /// Transition graph: forward one step at a time, and any state may drop
    /// to Disconnecting or Disconnected.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (current, Disconnected) => current != Disconnected,
            (Disconnected, Disconnecting) => false,
            (current, Disconnecting) => current != Disconnecting,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, ServicesDiscovered) => true,
            (ServicesDiscovered, Ready) => true,
            _ => false,
        }
    }

    /// Link is up: GATT operations may be issued.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::ServicesDiscovered | ConnectionState::Ready
        )
    }

    /// A connection attempt is running or established.
    pub fn is_active(self) -> bool {
        self == ConnectionState::Connecting || self.is_connected()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Progress of a chunked characteristic write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    pub total: usize,
    pub current: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_forward_only_graph() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(ServicesDiscovered));
        assert!(ServicesDiscovered.can_transition_to(Ready));

        assert!(!Connected.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(ServicesDiscovered));
        assert!(!Disconnected.can_transition_to(Ready));
    }

    #[test]
    fn test_any_state_can_drop() {
        for state in [Connecting, Connected, ServicesDiscovered, Ready, Disconnecting] {
            assert!(state.can_transition_to(Disconnected), "{state:?}");
        }
        for state in [Connecting, Connected, ServicesDiscovered, Ready] {
            assert!(state.can_transition_to(Disconnecting), "{state:?}");
        }
        assert!(!Disconnected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_mask_and_option_accessors_are_exclusive() {
        let v1 = DeviceIdentity::classic(
            "v1".into(),
            0,
            None,
            1,
            0x02,
            BoardModel::SensorTile,
            0x00E0_0000,
            false,
            false,
        );
        assert_eq!(v1.feature_mask(), Some(0x00E0_0000));
        assert_eq!(v1.option_bytes(), None);

        let v2 = DeviceIdentity::classic(
            "v2".into(),
            0,
            None,
            2,
            0x06,
            BoardModel::SensorTileBox,
            0x0A01_0203,
            false,
            false,
        );
        assert_eq!(v2.feature_mask(), None);
        assert_eq!(v2.option_bytes(), Some([0x0A, 0x01, 0x02, 0x03]));
        assert_eq!(v2.firmware_id(), Some(0x0A));
    }
}
