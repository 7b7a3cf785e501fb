//! DFU error types for the BLE transfer engine.

use serde::Serialize;
use thiserror::Error;

use super::opcodes::{
    ButtonlessStatus, ExtendedError, LegacyStatus, SecureStatus, ERROR_CRC_ERROR,
    ERROR_DEVICE_NOT_BONDED, ERROR_FILE_SIZE_INVALID, ERROR_INIT_PACKET_REQUIRED,
    ERROR_INVALID_RESPONSE, ERROR_REMOTE_MASK, ERROR_REMOTE_TYPE_LEGACY, ERROR_REMOTE_TYPE_SECURE,
    ERROR_REMOTE_TYPE_SECURE_BUTTONLESS, ERROR_REMOTE_TYPE_SECURE_EXTENDED,
};
use super::package::ImageKind;
use super::state::TransferState;
use crate::traits::LinkError;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Coarse classification used by callers to decide how to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Malformed archive, manifest or HEX data. Never retried.
    Format,
    /// A requirement of the peripheral or package is not met (e.g. not bonded).
    Precondition,
    /// Unexpected or out-of-range response from the peripheral.
    Protocol,
    /// CRC or digest mismatch after the retry budget was spent.
    Validation,
    /// The link dropped or reported a GATT failure.
    Link,
    /// Cooperative cancellation.
    Aborted,
    /// A bounded wait elapsed.
    Timeout,
    /// API misuse, such as narrowing the content type after reading.
    State,
}

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for manifest.json.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reported by the BLE link.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Malformed Intel HEX record.
    #[error("Not a HEX file (line {line}): {reason}")]
    InvalidHex { line: usize, reason: String },

    /// Invalid or conflicting manifest.json content.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// File referenced by the manifest is missing from the archive.
    #[error("Missing file in firmware package: {filename}")]
    MissingFile { filename: String },

    /// Archive entry resolves outside the archive root.
    #[error("Entry '{path}' is outside of the archive root")]
    PathTraversal { path: String },

    /// Archive exceeds the accepted size.
    #[error("Firmware package too large: {size} bytes (max {max} bytes)")]
    ArchiveTooLarge { size: u64, max: u64 },

    /// Nothing left to send after applying the content type.
    #[error("The package must contain an application, a SoftDevice and/or a bootloader")]
    NoFirmware,

    /// Image length is not word aligned.
    #[error("Size of {image} is invalid: {size} bytes is not a multiple of 4")]
    InvalidImageSize { image: ImageKind, size: usize },

    /// Settings file could not be parsed or written.
    #[error("Invalid settings: {reason}")]
    InvalidSettings { reason: String },

    /// The API was used in the wrong order.
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    /// Bond sharing requires an existing bond.
    #[error("Device is not bonded")]
    NotBonded,

    /// Bootloader version 5 and newer needs the init packet.
    #[error("Init packet required by the bootloader but not found in the package")]
    InitPacketRequired,

    /// Package uses combined roles only Secure DFU understands.
    #[error("Secure DFU required for this package but the device supports Legacy DFU only")]
    SecureDfuRequired,

    /// No DFU service found on the peripheral.
    #[error("Device does not expose a supported DFU service")]
    DeviceNotSupported,

    /// Response shape did not match the request.
    #[error("Invalid response for op code 0x{request:02X}: {}", hex::encode(.response))]
    InvalidResponse { request: u8, response: Vec<u8> },

    /// Receipt notification reported a byte count different from what was sent.
    #[error("PRN offset mismatch: sent {expected} bytes, device reported {actual}")]
    PrnOffsetMismatch { expected: u32, actual: u32 },

    /// Legacy control point reported an error status.
    #[error("Remote DFU error for op code 0x{request:02X}: {description}")]
    RemoteLegacy {
        request: u8,
        status: u8,
        description: &'static str,
    },

    /// Secure control point reported an error status.
    #[error("Remote DFU error for op code 0x{request:02X}: {description}")]
    RemoteSecure {
        request: u8,
        status: u8,
        description: &'static str,
    },

    /// Secure control point reported an extended error.
    #[error("Remote DFU extended error for op code 0x{request:02X}: {description}")]
    RemoteSecureExtended {
        request: u8,
        code: u8,
        description: &'static str,
    },

    /// Buttonless service reported an error status.
    #[error("Remote buttonless error: {description}")]
    RemoteButtonless {
        status: u8,
        description: &'static str,
    },

    /// CRC32 mismatch that survived the retry budget.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// A checkpoint kept failing after its retry.
    #[error("Checkpoint at byte {offset} failed {attempts} times")]
    CheckpointFailed { offset: u32, attempts: u8 },

    /// Digest declared in the init metadata does not match the transferred bytes.
    #[error("{algorithm} of the transferred image does not match the init packet")]
    DigestMismatch { algorithm: &'static str },

    /// Device was disconnected during operation.
    #[error("Device disconnected during {operation}")]
    Disconnected { operation: String },

    /// Maximum retry attempts exceeded.
    #[error("Max retries exceeded for {operation}")]
    MaxRetriesExceeded { operation: String },

    /// Bounded wait elapsed.
    #[error("Timeout after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation was aborted by the caller.
    #[error("DFU aborted")]
    Aborted,
}

impl DfuError {
    pub fn remote_legacy(request: u8, status: u8) -> Self {
        DfuError::RemoteLegacy {
            request,
            status,
            description: LegacyStatus::from_byte(status)
                .map(|s| s.description())
                .unwrap_or("UNKNOWN"),
        }
    }

    pub fn remote_secure(request: u8, status: u8) -> Self {
        DfuError::RemoteSecure {
            request,
            status,
            description: SecureStatus::from_byte(status)
                .map(|s| s.description())
                .unwrap_or("UNKNOWN"),
        }
    }

    pub fn remote_secure_extended(request: u8, code: u8) -> Self {
        DfuError::RemoteSecureExtended {
            request,
            code,
            description: ExtendedError::from_byte(code)
                .map(|e| e.description())
                .unwrap_or("Reserved for future use"),
        }
    }

    pub fn remote_buttonless(status: u8) -> Self {
        DfuError::RemoteButtonless {
            status,
            description: ButtonlessStatus::from_byte(status)
                .map(|s| s.description())
                .unwrap_or("UNKNOWN"),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::Io(_)
            | DfuError::Zip(_)
            | DfuError::Json(_)
            | DfuError::InvalidHex { .. }
            | DfuError::InvalidManifest { .. }
            | DfuError::MissingFile { .. }
            | DfuError::PathTraversal { .. }
            | DfuError::ArchiveTooLarge { .. }
            | DfuError::NoFirmware
            | DfuError::InvalidImageSize { .. }
            | DfuError::InvalidSettings { .. } => ErrorKind::Format,
            DfuError::InvalidState { .. } => ErrorKind::State,
            DfuError::NotBonded
            | DfuError::InitPacketRequired
            | DfuError::SecureDfuRequired
            | DfuError::DeviceNotSupported => ErrorKind::Precondition,
            DfuError::InvalidResponse { .. }
            | DfuError::PrnOffsetMismatch { .. }
            | DfuError::RemoteLegacy { .. }
            | DfuError::RemoteSecure { .. }
            | DfuError::RemoteSecureExtended { .. }
            | DfuError::RemoteButtonless { .. } => ErrorKind::Protocol,
            DfuError::CrcMismatch { .. }
            | DfuError::CheckpointFailed { .. }
            | DfuError::DigestMismatch { .. } => ErrorKind::Validation,
            DfuError::Link(_)
            | DfuError::Disconnected { .. }
            | DfuError::MaxRetriesExceeded { .. } => ErrorKind::Link,
            DfuError::Timeout { .. } => ErrorKind::Timeout,
            DfuError::Aborted => ErrorKind::Aborted,
        }
    }

    /// Check if this error is retriable (transient errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::CrcMismatch { .. }
                | DfuError::PrnOffsetMismatch { .. }
                | DfuError::Link(LinkError::ConnectionFailed(_))
        )
    }

    /// Numeric code in the Nordic error-code space, when one exists.
    pub fn numeric_code(&self) -> Option<u16> {
        match self {
            DfuError::RemoteLegacy { status, .. } => {
                Some(ERROR_REMOTE_MASK | ERROR_REMOTE_TYPE_LEGACY | *status as u16)
            }
            DfuError::RemoteSecure { status, .. } => {
                Some(ERROR_REMOTE_MASK | ERROR_REMOTE_TYPE_SECURE | *status as u16)
            }
            DfuError::RemoteSecureExtended { code, .. } => {
                Some(ERROR_REMOTE_MASK | ERROR_REMOTE_TYPE_SECURE_EXTENDED | *code as u16)
            }
            DfuError::RemoteButtonless { status, .. } => {
                Some(ERROR_REMOTE_MASK | ERROR_REMOTE_TYPE_SECURE_BUTTONLESS | *status as u16)
            }
            DfuError::InvalidResponse { .. } => Some(ERROR_INVALID_RESPONSE),
            DfuError::InitPacketRequired => Some(ERROR_INIT_PACKET_REQUIRED),
            DfuError::InvalidImageSize { .. } => Some(ERROR_FILE_SIZE_INVALID),
            DfuError::CrcMismatch { .. }
            | DfuError::CheckpointFailed { .. }
            | DfuError::DigestMismatch { .. } => Some(ERROR_CRC_ERROR),
            DfuError::NotBonded => Some(ERROR_DEVICE_NOT_BONDED),
            _ => None,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Io(_) => "DFU-002",
            DfuError::Zip(_) => "DFU-003",
            DfuError::Json(_) => "DFU-004",
            DfuError::InvalidHex { .. } => "DFU-005",
            DfuError::CrcMismatch { .. } => "DFU-020",
            DfuError::Timeout { .. } => "DFU-021",
            DfuError::DigestMismatch { .. } => "DFU-022",
            DfuError::MaxRetriesExceeded { .. } => "DFU-023",
            DfuError::CheckpointFailed { .. } => "DFU-024",
            DfuError::RemoteLegacy { .. } => "DFU-030",
            DfuError::RemoteSecure { .. } => "DFU-031",
            DfuError::RemoteSecureExtended { .. } => "DFU-032",
            DfuError::RemoteButtonless { .. } => "DFU-033",
            DfuError::InvalidResponse { .. } => "DFU-034",
            DfuError::PrnOffsetMismatch { .. } => "DFU-035",
            DfuError::MissingFile { .. } => "DFU-040",
            DfuError::InvalidManifest { .. } => "DFU-041",
            DfuError::PathTraversal { .. } => "DFU-042",
            DfuError::ArchiveTooLarge { .. } => "DFU-043",
            DfuError::NoFirmware => "DFU-044",
            DfuError::InvalidImageSize { .. } => "DFU-045",
            DfuError::DeviceNotSupported => "DFU-050",
            DfuError::Disconnected { .. } => "DFU-051",
            DfuError::Link(_) => "DFU-052",
            DfuError::NotBonded => "DFU-053",
            DfuError::InitPacketRequired => "DFU-054",
            DfuError::SecureDfuRequired => "DFU-055",
            DfuError::InvalidSettings { .. } => "DFU-060",
            DfuError::InvalidState { .. } => "DFU-061",
            DfuError::Aborted => "DFU-099",
        }
    }
}

/// Fatal error escaping a session, with the context it happened in.
#[derive(Debug, Error)]
#[error("{error} (stage: {stage}, image: {}, part {part}/{total_parts}, {bytes_transferred} bytes transferred)",
    .image.map(|i| i.to_string()).unwrap_or_else(|| "none".into()))]
pub struct DfuFailure {
    #[source]
    pub error: DfuError,
    pub stage: TransferState,
    pub image: Option<ImageKind>,
    pub bytes_transferred: u32,
    pub part: u8,
    pub total_parts: u8,
}

impl DfuFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
