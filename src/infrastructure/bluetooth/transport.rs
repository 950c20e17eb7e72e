//! Platform BLE primitive consumed by the session layer.
//!
//! Every method completes asynchronously and the platform tolerates only one
//! outstanding GATT operation per device; the [`super::queue::OperationQueue`]
//! is the only caller of the GATT methods.

use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// GATT characteristic property flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_NO_RESPONSE)
    }

    pub fn can_notify(self) -> bool {
        self.contains(Self::NOTIFY) || self.contains(Self::INDICATE)
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::WRITE_NO_RESPONSE, "WRITE_NO_RESPONSE"),
            (Self::NOTIFY, "NOTIFY"),
            (Self::INDICATE, "INDICATE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join(" | "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Events pushed by the platform for one connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link went up (`true`) or down (`false`)
    ConnectionChanged(bool),
    /// The peer reported that its GATT table changed
    ServicesChanged,
    /// Notification or indication
    CharacteristicChanged { uuid: Uuid, value: Vec<u8> },
}

#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Platform address of the peer, used as the session key.
    fn address(&self) -> &str;

    /// Opens the link. Events for this connection arrive on the returned
    /// receiver until the link drops.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError>;

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError>;

    /// Writes the client characteristic configuration descriptor.
    async fn set_notification(&self, uuid: Uuid, enabled: bool) -> Result<(), TransportError>;

    /// Requests `mtu` and returns what the peer granted.
    async fn request_mtu(&self, mtu: usize) -> Result<usize, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_flags() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.can_read());
        assert!(props.can_notify());
        assert!(!props.can_write());
        assert_eq!(format!("{props:?}"), "READ | NOTIFY");

        let props = CharacteristicProperties::WRITE_NO_RESPONSE;
        assert!(props.can_write());
        assert_eq!(props.bits(), 0x04);
        assert_eq!(CharacteristicProperties::from_bits(0x04), props);
    }
}
