//! GATT link abstraction consumed by the transfer engines.
//!
//! A BLE backend implements [`Link`] for a connected peripheral and
//! [`Connector`] to open new connections after a bootloader jump. All
//! completions arrive out of band on the link's event channel.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Errors reported by a link implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Device not connected")]
    NotConnected,

    #[error("GATT {operation} failed with status {status}")]
    Gatt { operation: String, status: u8 },

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{0}")]
    Other(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// 48-bit Bluetooth device address, most significant octet first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Address a bootloader advertises under after a jump without bond
    /// sharing: last octet plus one, wrapping 0xFF to 0x00.
    pub fn incremented(&self) -> Self {
        let mut octets = self.0;
        octets[5] = octets[5].wrapping_add(1);
        Self(octets)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LinkError::Other(format!("Invalid device address: {}", s));
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// A discovered primary service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Asynchronous link events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// A write issued with [`Link::write`] finished; status 0 is success.
    WriteComplete { characteristic: Uuid, status: u8 },
    /// Notification or indication received.
    ValueChanged { characteristic: Uuid, value: Vec<u8> },
    MtuChanged { mtu: u16, status: u8 },
    BondStateChanged(BondState),
}

/// Receiving end of a link's event stream.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// A connected GATT peripheral.
#[async_trait]
pub trait Link: Send {
    fn address(&self) -> DeviceAddress;

    /// Services discovered on connection.
    fn services(&self) -> Vec<GattService>;

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.services()
            .iter()
            .any(|s| s.uuid == service && s.characteristics.contains(&characteristic))
    }

    fn bond_state(&self) -> BondState;

    /// Event stream; completions for every call below arrive here.
    fn events(&mut self) -> &mut LinkEvents;

    /// Start a write. `expect_disconnect` marks commands after which the
    /// peripheral resets, so the backend must not report the drop as a failure.
    async fn write(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
        expect_disconnect: bool,
    ) -> LinkResult<()>;

    async fn subscribe(&mut self, characteristic: Uuid, mode: SubscribeMode) -> LinkResult<()>;

    async fn read(&mut self, characteristic: Uuid) -> LinkResult<Vec<u8>>;

    /// Start an MTU exchange; the result arrives as [`LinkEvent::MtuChanged`].
    async fn request_mtu(&mut self, mtu: u16) -> LinkResult<()>;

    async fn disconnect(&mut self) -> LinkResult<()>;
}

/// Opens connections to peripherals by address.
#[cfg_attr(test, automock(type Link = crate::test_helpers::peripheral::SimulatedPeripheral;))]
#[async_trait]
pub trait Connector: Send + Sync {
    type Link: Link;

    async fn connect(&self, address: DeviceAddress) -> LinkResult<Self::Link>;

    /// Forget the local bond with `address`.
    async fn remove_bond(&self, address: DeviceAddress) -> LinkResult<()>;

    /// Start bonding with `address` once it runs the new application.
    async fn create_bond(&self, address: DeviceAddress) -> LinkResult<()>;
}
