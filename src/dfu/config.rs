//! Configuration constants and the per-session DFU configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::ContentType;

// ============================================================================
// Legacy DFU Service
// ============================================================================

/// Legacy DFU service.
pub const LEGACY_DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);

/// Legacy DFU control point (write + notify).
pub const LEGACY_DFU_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);

/// Legacy DFU packet characteristic (write without response).
pub const LEGACY_DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);

/// Legacy DFU version characteristic (read, u16 little endian).
pub const LEGACY_DFU_VERSION_UUID: Uuid = Uuid::from_u128(0x00001534_1212_EFDE_1523_785FEABCD123);

// ============================================================================
// Secure DFU Service
// ============================================================================

/// Secure DFU service (16-bit 0xFE59).
pub const SECURE_DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);

/// Secure DFU control point (write + notify).
pub const SECURE_DFU_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);

/// Secure DFU packet characteristic.
pub const SECURE_DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);

/// Buttonless DFU without bond sharing (indicate).
pub const BUTTONLESS_WITHOUT_BONDS_UUID: Uuid =
    Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);

/// Buttonless DFU with bond sharing (indicate).
pub const BUTTONLESS_WITH_BONDS_UUID: Uuid =
    Uuid::from_u128(0x8EC90004_F315_4F60_9FB8_838830DAEA50);

// ============================================================================
// Transfer Defaults
// ============================================================================

/// Payload of a single packet write without MTU negotiation.
pub const DEFAULT_MTU_PAYLOAD: usize = 20;

/// MTU requested on Secure DFU connections.
pub const DEFAULT_REQUESTED_MTU: u16 = 517;

/// ATT header bytes subtracted from the negotiated MTU.
pub const ATT_HEADER_SIZE: usize = 3;

/// Packet receipt notification interval (0 disables PRNs).
pub const DEFAULT_PRN_INTERVAL: u16 = 0;

/// Size of the MBR region removed from HEX images.
pub const DEFAULT_MBR_SIZE: u32 = 0x1000;

/// Largest firmware package accepted by the parser.
pub const MAX_ARCHIVE_SIZE: u64 = 10 * 1024 * 1024;

/// Transfer attempts per checkpoint (one automatic retry).
pub const MAX_CHECKPOINT_ATTEMPTS: u8 = 2;

/// Reconnection attempts after a connection failure.
pub const DEFAULT_RECONNECT_ATTEMPTS: u8 = 2;

/// Pause between two connection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Timeouts
// ============================================================================

pub const DEFAULT_MTU_TIMEOUT: Duration = Duration::from_secs(5);

/// Scan duration when looking for a bootloader after a jump.
pub const DEFAULT_REDISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_BUTTONLESS_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Legacy Capability Check
// ============================================================================

/// Services exposed by a bootloader (GAP, GATT, DFU). More means an application is running.
pub const BOOTLOADER_SERVICE_COUNT: usize = 3;

/// Legacy DFU version reported by an application supporting the buttonless jump.
pub const LEGACY_VERSION_APP_WITH_BUTTONLESS: u16 = 1;

/// Lowest Legacy DFU version that requires an init packet.
pub const LEGACY_VERSION_INIT_PACKET_REQUIRED: u16 = 5;

// ============================================================================
// Session Configuration
// ============================================================================

/// Service and characteristic UUIDs used to find the DFU endpoints.
///
/// Defaults to the Nordic values. Custom bootloaders can override any of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UuidConfig {
    pub legacy_service: Uuid,
    pub legacy_control_point: Uuid,
    pub legacy_packet: Uuid,
    pub legacy_version: Uuid,
    pub secure_service: Uuid,
    pub secure_control_point: Uuid,
    pub secure_packet: Uuid,
    pub buttonless_without_bonds: Uuid,
    pub buttonless_with_bonds: Uuid,
}

impl Default for UuidConfig {
    fn default() -> Self {
        Self {
            legacy_service: LEGACY_DFU_SERVICE_UUID,
            legacy_control_point: LEGACY_DFU_CONTROL_POINT_UUID,
            legacy_packet: LEGACY_DFU_PACKET_UUID,
            legacy_version: LEGACY_DFU_VERSION_UUID,
            secure_service: SECURE_DFU_SERVICE_UUID,
            secure_control_point: SECURE_DFU_CONTROL_POINT_UUID,
            secure_packet: SECURE_DFU_PACKET_UUID,
            buttonless_without_bonds: BUTTONLESS_WITHOUT_BONDS_UUID,
            buttonless_with_bonds: BUTTONLESS_WITH_BONDS_UUID,
        }
    }
}

/// Options for one DFU session.
///
/// Passed by value into [`DfuSession`](super::DfuSession); nothing here is
/// mutated once a transfer starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    /// Packets between receipt notifications. 0 waits only for the final response.
    pub prn_interval: u16,
    /// Addresses below this value are dropped from HEX images.
    pub mbr_size: u32,
    /// MTU requested on Secure DFU connections.
    pub mtu: u16,
    #[serde(with = "duration_ms")]
    pub mtu_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub rediscovery_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub buttonless_timeout: Duration,
    /// Connection attempts after a link failure.
    pub reconnect_attempts: u8,
    /// Skip the service-count heuristic and treat a version 0 device as a bootloader.
    pub assume_dfu_mode: bool,
    /// Always scan for the bootloader after a Legacy jump or between parts.
    pub force_scanning_for_new_address: bool,
    /// Never resume a Secure transfer from the offset reported by the device.
    pub disable_resume: bool,
    /// Keep the bond after a successful update.
    pub keep_bond: bool,
    /// Re-bond after a successful update (bond-sharing buttonless only).
    pub restore_bond: bool,
    /// Requested content type; AUTO sends everything in the package.
    pub content_type: ContentType,
    pub uuids: UuidConfig,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            prn_interval: DEFAULT_PRN_INTERVAL,
            mbr_size: DEFAULT_MBR_SIZE,
            mtu: DEFAULT_REQUESTED_MTU,
            mtu_timeout: DEFAULT_MTU_TIMEOUT,
            rediscovery_timeout: DEFAULT_REDISCOVERY_TIMEOUT,
            buttonless_timeout: DEFAULT_BUTTONLESS_TIMEOUT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            assume_dfu_mode: false,
            force_scanning_for_new_address: false,
            disable_resume: false,
            keep_bond: false,
            restore_bond: false,
            content_type: ContentType::AUTO,
            uuids: UuidConfig::default(),
        }
    }
}

impl DfuConfig {
    pub fn with_prn_interval(mut self, prn_interval: u16) -> Self {
        self.prn_interval = prn_interval;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_assume_dfu_mode(mut self, assume_dfu_mode: bool) -> Self {
        self.assume_dfu_mode = assume_dfu_mode;
        self
    }

    pub fn with_rediscovery_timeout(mut self, timeout: Duration) -> Self {
        self.rediscovery_timeout = timeout;
        self
    }

    /// Payload bytes per packet for a negotiated MTU.
    pub fn payload_for_mtu(mtu: u16) -> usize {
        (mtu as usize)
            .saturating_sub(ATT_HEADER_SIZE)
            .max(DEFAULT_MTU_PAYLOAD)
    }
}

/// Legacy capability heuristic: does a device reporting `version` need a jump?
///
/// Version 1 is an application with buttonless support. Version 0 (no version
/// characteristic) means either an old bootloader or an application; a device
/// exposing more than the three bootloader services is assumed to be running
/// an application unless the caller asserts DFU mode.
pub fn legacy_jump_required(version: u16, service_count: usize, assume_dfu_mode: bool) -> bool {
    version == LEGACY_VERSION_APP_WITH_BUTTONLESS
        || (!assume_dfu_mode && version == 0 && service_count > BOOTLOADER_SERVICE_COUNT)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
