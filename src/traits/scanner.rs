use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::link::{DeviceAddress, LinkResult};

/// One received advertising packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
}

/// Abstraction over BLE scanning, used to find a bootloader after a jump.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scanner: Send {
    async fn start(&mut self) -> LinkResult<()>;

    /// Next advertisement, or `None` when the scan ended.
    async fn next_advertisement(&mut self) -> Option<Advertisement>;

    async fn stop(&mut self) -> LinkResult<()>;
}
