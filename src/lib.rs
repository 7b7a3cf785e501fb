//! Nordic Semiconductor DFU over Bluetooth LE.
//!
//! Reads firmware distribution packages and drives Legacy or Secure DFU
//! bootloaders through an abstract GATT [`Link`](traits::Link).

pub mod dfu;
pub mod settings;
pub mod traits;

#[cfg(test)]
mod test_helpers;
