//! Transfer state model: phase, dialect, content-type mask and byte counters.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{DfuError, DfuResult};
use super::package::ImageKind;

/// Bitset over the image kinds a transfer should include.
///
/// `AUTO` (no bits) means "everything present in the package".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentType(u8);

impl ContentType {
    pub const AUTO: ContentType = ContentType(0x00);
    pub const SOFT_DEVICE: ContentType = ContentType(0x01);
    pub const BOOTLOADER: ContentType = ContentType(0x02);
    pub const APPLICATION: ContentType = ContentType(0x04);
    pub const SYSTEM: ContentType = ContentType(0x03);
    pub const ALL: ContentType = ContentType(0x07);

    pub const fn from_bits(bits: u8) -> Self {
        ContentType(bits & 0x07)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_auto(self) -> bool {
        self.0 == 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: ContentType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set in `self`.
    pub const fn intersects(self, other: ContentType) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: ContentType) -> ContentType {
        ContentType(self.0 | other.0)
    }

    pub const fn intersection(self, other: ContentType) -> ContentType {
        ContentType(self.0 & other.0)
    }

    pub const fn without(self, other: ContentType) -> ContentType {
        ContentType(self.0 & !other.0)
    }

    /// Image type byte sent in the Legacy Start DFU command.
    pub const fn legacy_image_type(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for ContentType {
    type Output = ContentType;

    fn bitor(self, rhs: ContentType) -> ContentType {
        self.union(rhs)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_auto() {
            return write!(f, "auto");
        }
        let mut parts = Vec::new();
        if self.contains(ContentType::SOFT_DEVICE) {
            parts.push("softdevice");
        }
        if self.contains(ContentType::BOOTLOADER) {
            parts.push("bootloader");
        }
        if self.contains(ContentType::APPLICATION) {
            parts.push("application");
        }
        write!(f, "{}", parts.join("+"))
    }
}

/// Protocol dialect spoken by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    Legacy,
    Secure,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Legacy => write!(f, "Legacy DFU"),
            Dialect::Secure => write!(f, "Secure DFU"),
        }
    }
}

/// Phase of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    Connecting,
    CapabilityCheck,
    InitExchange,
    Transferring,
    Validating,
    Activating,
    Disconnecting,
    Completed,
    Aborted,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Aborted | TransferState::Failed
        )
    }

    /// Forward edges of the transfer state machine.
    ///
    /// Any non-terminal state may fail, abort or disconnect. A new connection
    /// (next part, restart after reset) re-enters `Connecting` from
    /// `Disconnecting`.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Aborted | Disconnecting) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, CapabilityCheck)
                | (CapabilityCheck, InitExchange)
                | (CapabilityCheck, Transferring)
                | (InitExchange, Transferring)
                | (Transferring, Validating)
                | (Validating, Transferring)
                | (Validating, Activating)
                | (Activating, Disconnecting)
                | (Disconnecting, Connecting)
                | (Disconnecting, Completed)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Idle => "Idle",
            TransferState::Connecting => "Connecting",
            TransferState::CapabilityCheck => "CapabilityCheck",
            TransferState::InitExchange => "InitExchange",
            TransferState::Transferring => "Transferring",
            TransferState::Validating => "Validating",
            TransferState::Activating => "Activating",
            TransferState::Disconnecting => "Disconnecting",
            TransferState::Completed => "Completed",
            TransferState::Aborted => "Aborted",
            TransferState::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Mutable bookkeeping of one transfer across its connections.
#[derive(Debug, Clone)]
pub struct TransferSession {
    state: TransferState,
    pub dialect: Option<Dialect>,
    mask: ContentType,
    /// Set once the first image byte is written; the mask is frozen from then on.
    transfer_started: bool,
    pub current_image: Option<ImageKind>,
    /// Bytes written for the current part.
    pub bytes_sent: u32,
    /// Bytes confirmed by the device for the current part.
    pub bytes_acked: u32,
    /// Total bytes of the current part.
    pub image_size: u32,
    pub prn_interval: u16,
    pub mtu_payload: usize,
    pub part_index: u8,
    pub total_parts: u8,
}

impl TransferSession {
    pub fn new(mask: ContentType, prn_interval: u16, mtu_payload: usize) -> Self {
        Self {
            state: TransferState::Idle,
            dialect: None,
            mask,
            transfer_started: false,
            current_image: None,
            bytes_sent: 0,
            bytes_acked: 0,
            image_size: 0,
            prn_interval,
            mtu_payload,
            part_index: 1,
            total_parts: 1,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn mask(&self) -> ContentType {
        self.mask
    }

    /// Move to `next`, logging the transition.
    pub fn goto(&mut self, next: TransferState) -> DfuResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(DfuError::InvalidState {
                reason: format!("cannot move from {} to {}", self.state, next),
            });
        }
        info!(from = %self.state, to = %next, "Transfer state changed");
        self.state = next;
        Ok(())
    }

    /// Narrow the content-type mask. Widening, or narrowing after bytes were sent, is rejected.
    pub fn narrow_mask(&mut self, mask: ContentType) -> DfuResult<()> {
        if self.transfer_started {
            return Err(DfuError::InvalidState {
                reason: "content type cannot change after the transfer has started".into(),
            });
        }
        if !self.mask.is_auto() && mask.without(self.mask).bits() != 0 {
            return Err(DfuError::InvalidState {
                reason: format!("content type {} is wider than {}", mask, self.mask),
            });
        }
        debug!(from = %self.mask, to = %mask, "Content type narrowed");
        self.mask = mask;
        Ok(())
    }

    /// Start a new part of `size` bytes.
    pub fn begin_part(&mut self, image: ImageKind, size: u32) {
        self.current_image = Some(image);
        self.image_size = size;
        self.bytes_sent = 0;
        self.bytes_acked = 0;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.transfer_started = true;
        self.bytes_sent += bytes as u32;
    }

    pub fn record_acked(&mut self, offset: u32) {
        self.bytes_acked = offset;
    }

    /// Rewind to a checkpoint after a failed verification.
    pub fn rewind_to(&mut self, offset: u32) {
        self.bytes_sent = offset;
        self.bytes_acked = self.bytes_acked.min(offset);
    }

    pub fn set_parts(&mut self, part_index: u8, total_parts: u8) {
        self.part_index = part_index;
        self.total_parts = total_parts;
    }

    /// Forget per-connection progress before reconnecting for the next part.
    pub fn next_part(&mut self, mask: ContentType) {
        self.mask = mask;
        self.transfer_started = false;
        self.part_index += 1;
        self.current_image = None;
        self.bytes_sent = 0;
        self.bytes_acked = 0;
        self.image_size = 0;
    }
}
