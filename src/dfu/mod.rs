//! Nordic DFU (Device Firmware Update) over BLE.
//!
//! This module implements both bootloader dialects found on nRF5 devices:
//! Legacy DFU (SDK 11 and older) and Secure DFU (SDK 12 and newer),
//! together with the buttonless jump that moves a running application into
//! its bootloader.
//!
//! # Protocol Overview
//!
//! An update consists of:
//! 1. **Package Parsing** - Read the distribution ZIP into typed images
//! 2. **Engine Selection** - Pick buttonless, Secure or Legacy from the GATT services
//! 3. **Bootloader Entry** - Buttonless jump, then rediscovery if the address changes
//! 4. **Init Transfer** - Send the init packet
//! 5. **Firmware Transfer** - Stream the images with receipt-notification checkpoints
//! 6. **Validation** - CRC checks per checkpoint or object
//! 7. **Activation** - Device applies and boots the new firmware
//!
//! The BLE stack itself stays outside: callers provide a [`Link`](crate::traits::Link)
//! for the first connection and a [`Connector`](crate::traits::Connector) for the
//! following ones.
//!
//! # Example
//!
//! ```ignore
//! use nrf_ble_dfu::dfu::{read_firmware_zip, ContentType, DfuConfig, DfuSession};
//!
//! let config = DfuConfig::default().with_prn_interval(12);
//! let package = read_firmware_zip("firmware.zip", config.mbr_size, ContentType::AUTO)?;
//! let mut session = DfuSession::new(config, connector, scanner);
//! let report = session.run(link, package).await?;
//! println!("{} bytes in {} part(s)", report.bytes_transferred, report.parts);
//! ```

mod buttonless;
pub mod config;
mod control;
mod digest;
mod engine;
mod error;
mod events;
mod gatt;
mod hex;
mod legacy;
pub mod opcodes;
mod package;
mod rediscovery;
mod secure;
mod session;
mod state;
mod transfer;

// Configuration
pub use config::{DfuConfig, UuidConfig};

// Errors
pub use error::{DfuError, DfuFailure, DfuResult, ErrorKind};

// Progress and control
pub use control::DfuController;
pub use events::{DfuObserver, DfuStage, NullObserver, TracingObserver};

// Packages
pub use digest::{crc16, crc32, ImageDigest};
pub use self::hex::{hex_to_bin, HexDecoder};
pub use package::{read_firmware_zip, FirmwareImage, FirmwarePackage, ImageKind, InitMetadata, Manifest};

// Transfer
pub use buttonless::ButtonlessJump;
pub use engine::{DfuEngine, EngineOutcome, TransferContext, TransferEngine};
pub use legacy::LegacyEngine;
pub use rediscovery::{default_matcher, rediscover, AddressMatcher};
pub use secure::SecureEngine;
pub use session::{DfuReport, DfuSession};
pub use state::{ContentType, Dialect, TransferSession, TransferState};
