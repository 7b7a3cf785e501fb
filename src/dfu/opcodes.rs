//! Control-point opcodes, status codes and the remote error-code table.
//!
//! Numeric error codes follow the Nordic tooling layout: the low byte is the
//! status reported by the peripheral, the `0x0F00` nibble tags the protocol
//! family and the `0x2000` bit marks a remote (device-reported) error.

// ============================================================================
// Error Code Masks
// ============================================================================

/// Set on every locally detected error code.
pub const ERROR_MASK: u16 = 0x1000;

/// Set on every error reported by the peripheral.
pub const ERROR_REMOTE_MASK: u16 = 0x2000;

/// Remote error family: Legacy DFU control point.
pub const ERROR_REMOTE_TYPE_LEGACY: u16 = 0x0100;

/// Remote error family: Secure DFU control point.
pub const ERROR_REMOTE_TYPE_SECURE: u16 = 0x0200;

/// Remote error family: Secure DFU extended error sub-codes.
pub const ERROR_REMOTE_TYPE_SECURE_EXTENDED: u16 = 0x0400;

/// Remote error family: buttonless service.
pub const ERROR_REMOTE_TYPE_SECURE_BUTTONLESS: u16 = 0x0800;

/// Local error: response did not have the expected shape.
pub const ERROR_INVALID_RESPONSE: u16 = ERROR_MASK | 0x08;

/// Local error: the bootloader requires an init packet but none was supplied.
pub const ERROR_INIT_PACKET_REQUIRED: u16 = ERROR_MASK | 0x0B;

/// Local error: image size is not a multiple of 4.
pub const ERROR_FILE_SIZE_INVALID: u16 = ERROR_MASK | 0x0C;

/// Local error: CRC or digest mismatch after the retry budget.
pub const ERROR_CRC_ERROR: u16 = ERROR_MASK | 0x0D;

/// Local error: bond required but the device is not bonded.
pub const ERROR_DEVICE_NOT_BONDED: u16 = ERROR_MASK | 0x0E;

// ============================================================================
// Legacy DFU
// ============================================================================

/// Legacy DFU control-point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegacyOpcode {
    /// Start DFU, followed by the image type byte
    StartDfu = 0x01,
    /// Init packet start (`0x00`) / complete (`0x01`)
    InitDfuParams = 0x02,
    /// Begin streaming the image on the packet characteristic
    ReceiveFirmwareImage = 0x03,
    /// Validate the received image
    Validate = 0x04,
    /// Activate the new image and reset
    ActivateAndReset = 0x05,
    /// Reset without activating
    Reset = 0x06,
    /// Set the packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response prefix from the bootloader
    Response = 0x10,
    /// Packet receipt notification prefix
    PacketReceiptNotification = 0x11,
}

/// Second byte of `InitDfuParams`.
pub const LEGACY_INIT_PACKET_RECEIVE: u8 = 0x00;
pub const LEGACY_INIT_PACKET_COMPLETE: u8 = 0x01;

/// Image type byte of `StartDfu` requesting a jump to the bootloader.
pub const LEGACY_START_DFU_APPLICATION_JUMP: u8 = 0x04;

/// Legacy DFU response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegacyStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl LegacyStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(LegacyStatus::Success),
            0x02 => Some(LegacyStatus::InvalidState),
            0x03 => Some(LegacyStatus::NotSupported),
            0x04 => Some(LegacyStatus::DataSizeExceedsLimit),
            0x05 => Some(LegacyStatus::CrcError),
            0x06 => Some(LegacyStatus::OperationFailed),
            _ => None,
        }
    }

    /// Name used in error reports.
    pub fn description(&self) -> &'static str {
        match self {
            LegacyStatus::Success => "SUCCESS",
            LegacyStatus::InvalidState => "INVALID STATE",
            LegacyStatus::NotSupported => "NOT SUPPORTED",
            LegacyStatus::DataSizeExceedsLimit => "DATA SIZE EXCEEDS LIMIT",
            LegacyStatus::CrcError => "INVALID CRC ERROR",
            LegacyStatus::OperationFailed => "OPERATION FAILED",
        }
    }
}

// ============================================================================
// Secure DFU
// ============================================================================

/// Secure DFU control-point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecureOpcode {
    CreateObject = 0x01,
    SetPrn = 0x02,
    CalculateChecksum = 0x03,
    Execute = 0x04,
    SelectObject = 0x06,
    Response = 0x60,
}

/// Secure DFU object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet
    Command = 0x01,
    /// Firmware image
    Data = 0x02,
}

/// Secure DFU response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecureStatus {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParam = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtendedError = 0x0B,
}

impl SecureStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SecureStatus::Success),
            0x02 => Some(SecureStatus::OpCodeNotSupported),
            0x03 => Some(SecureStatus::InvalidParam),
            0x04 => Some(SecureStatus::InsufficientResources),
            0x05 => Some(SecureStatus::InvalidObject),
            0x07 => Some(SecureStatus::UnsupportedType),
            0x08 => Some(SecureStatus::OperationNotPermitted),
            0x0A => Some(SecureStatus::OperationFailed),
            0x0B => Some(SecureStatus::ExtendedError),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SecureStatus::Success => "SUCCESS",
            SecureStatus::OpCodeNotSupported => "OP CODE NOT SUPPORTED",
            SecureStatus::InvalidParam => "INVALID PARAM",
            SecureStatus::InsufficientResources => "INSUFFICIENT RESOURCES",
            SecureStatus::InvalidObject => "INVALID OBJECT",
            SecureStatus::UnsupportedType => "UNSUPPORTED TYPE",
            SecureStatus::OperationNotPermitted => "OPERATION NOT PERMITTED",
            SecureStatus::OperationFailed => "OPERATION FAILED",
            SecureStatus::ExtendedError => "EXTENDED ERROR",
        }
    }
}

/// Sub-codes carried in byte 3 of a Secure `ExtendedError` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtendedError {
    NoError = 0x00,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

impl ExtendedError {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ExtendedError::NoError),
            0x02 => Some(ExtendedError::WrongCommandFormat),
            0x03 => Some(ExtendedError::UnknownCommand),
            0x04 => Some(ExtendedError::InitCommandInvalid),
            0x05 => Some(ExtendedError::FwVersionFailure),
            0x06 => Some(ExtendedError::HwVersionFailure),
            0x07 => Some(ExtendedError::SdVersionFailure),
            0x08 => Some(ExtendedError::SignatureMissing),
            0x09 => Some(ExtendedError::WrongHashType),
            0x0A => Some(ExtendedError::HashFailed),
            0x0B => Some(ExtendedError::WrongSignatureType),
            0x0C => Some(ExtendedError::VerificationFailed),
            0x0D => Some(ExtendedError::InsufficientSpace),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExtendedError::NoError => "No error",
            ExtendedError::WrongCommandFormat => "Wrong command format",
            ExtendedError::UnknownCommand => "Unknown command",
            ExtendedError::InitCommandInvalid => "Init command invalid",
            ExtendedError::FwVersionFailure => "FW version failure",
            ExtendedError::HwVersionFailure => "HW version failure",
            ExtendedError::SdVersionFailure => "SD version failure",
            ExtendedError::SignatureMissing => "Signature missing",
            ExtendedError::WrongHashType => "Wrong hash type",
            ExtendedError::HashFailed => "Hash failed",
            ExtendedError::WrongSignatureType => "Wrong signature type",
            ExtendedError::VerificationFailed => "Verification failed",
            ExtendedError::InsufficientSpace => "Insufficient space",
        }
    }
}

// ============================================================================
// Buttonless DFU
// ============================================================================

/// Response prefix of the buttonless services.
pub const BUTTONLESS_RESPONSE: u8 = 0x20;

/// Request the application to reboot into the bootloader.
pub const BUTTONLESS_ENTER_BOOTLOADER: u8 = 0x01;

/// Buttonless response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ButtonlessStatus {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    OperationFailed = 0x04,
}

impl ButtonlessStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ButtonlessStatus::Success),
            0x02 => Some(ButtonlessStatus::OpCodeNotSupported),
            0x04 => Some(ButtonlessStatus::OperationFailed),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ButtonlessStatus::Success => "SUCCESS",
            ButtonlessStatus::OpCodeNotSupported => "OP CODE NOT SUPPORTED",
            ButtonlessStatus::OperationFailed => "OPERATION FAILED",
        }
    }
}

/// Describe a numeric DFU error code, dispatching on its family bits.
pub fn describe_error_code(code: u16) -> String {
    let low = (code & 0xFF) as u8;
    if code & ERROR_REMOTE_MASK != 0 {
        let family = code & 0x0F00;
        let name = match family {
            ERROR_REMOTE_TYPE_LEGACY => LegacyStatus::from_byte(low).map(|s| s.description()),
            ERROR_REMOTE_TYPE_SECURE => SecureStatus::from_byte(low).map(|s| s.description()),
            ERROR_REMOTE_TYPE_SECURE_EXTENDED => {
                ExtendedError::from_byte(low).map(|e| e.description())
            }
            ERROR_REMOTE_TYPE_SECURE_BUTTONLESS => {
                ButtonlessStatus::from_byte(low).map(|s| s.description())
            }
            _ => None,
        };
        return match name {
            Some(name) => format!("REMOTE DFU ERROR: {}", name),
            None => format!("UNKNOWN REMOTE ERROR (0x{:04X})", code),
        };
    }

    match code {
        ERROR_INVALID_RESPONSE => "DFU INVALID RESPONSE".into(),
        ERROR_INIT_PACKET_REQUIRED => "INIT PACKET REQUIRED".into(),
        ERROR_FILE_SIZE_INVALID => "FILE SIZE INVALID".into(),
        ERROR_CRC_ERROR => "CRC ERROR".into(),
        ERROR_DEVICE_NOT_BONDED => "DEVICE NOT BONDED".into(),
        _ => format!("UNKNOWN DFU ERROR (0x{:04X})", code),
    }
}
