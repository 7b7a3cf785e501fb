//! Progress stages reported while a DFU session runs.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::state::Dialect;

/// DFU progress stages for UI feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum DfuStage {
    /// Parsing the firmware package.
    ReadingPackage,
    /// Connecting to the peripheral.
    Connecting { address: String },
    /// Asking the application to reboot into the bootloader.
    EnablingBootloader,
    /// Scanning for the bootloader after a jump.
    Rediscovering { address: String },
    /// Starting a transfer part.
    Starting {
        dialect: Dialect,
        part: u8,
        total_parts: u8,
    },
    /// Sending the init packet.
    SendingInit,
    /// Uploading image data.
    Uploading {
        sent: usize,
        total: usize,
        part: u8,
        total_parts: u8,
    },
    /// Transfer paused at a chunk boundary.
    Paused,
    /// Device is validating the image.
    Validating,
    /// Device is activating the image and resetting.
    Activating,
    /// Waiting for the link to drop.
    Disconnecting,
    /// DFU process complete.
    Complete,
    /// Session aborted by the caller.
    Aborted,
    /// Debug log message.
    Log { message: String },
}

impl DfuStage {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            DfuStage::ReadingPackage => 0.0,
            DfuStage::Connecting { .. } => 2.0,
            DfuStage::EnablingBootloader => 4.0,
            DfuStage::Rediscovering { .. } => 6.0,
            DfuStage::Starting { .. } => 8.0,
            DfuStage::SendingInit => 10.0,
            DfuStage::Uploading {
                sent,
                total,
                part,
                total_parts,
            } => {
                let parts = (*total_parts).max(1) as f32;
                let done_parts = part.saturating_sub(1) as f32;
                let fraction = if *total == 0 {
                    0.0
                } else {
                    *sent as f32 / *total as f32
                };
                10.0 + ((done_parts + fraction) / parts) * 80.0
            }
            DfuStage::Validating => 92.0,
            DfuStage::Activating => 95.0,
            DfuStage::Disconnecting => 97.0,
            DfuStage::Complete => 100.0,
            // Informational stages don't affect progress percentage
            DfuStage::Paused | DfuStage::Aborted | DfuStage::Log { .. } => -1.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            DfuStage::ReadingPackage => "Reading firmware package...".into(),
            DfuStage::Connecting { address } => format!("Connecting to {}...", address),
            DfuStage::EnablingBootloader => "Switching device to bootloader mode...".into(),
            DfuStage::Rediscovering { address } => {
                format!("Looking for bootloader near {}...", address)
            }
            DfuStage::Starting {
                dialect,
                part,
                total_parts,
            } => format!("Starting {} (part {}/{})...", dialect, part, total_parts),
            DfuStage::SendingInit => "Sending initialization data...".into(),
            DfuStage::Uploading {
                sent,
                total,
                part,
                total_parts,
            } => {
                let percent = if *total == 0 {
                    0
                } else {
                    (sent * 100) / total
                };
                if *total_parts > 1 {
                    format!(
                        "Uploading firmware part {}/{}... {}%",
                        part, total_parts, percent
                    )
                } else {
                    format!("Uploading firmware... {}%", percent)
                }
            }
            DfuStage::Paused => "Upload paused".into(),
            DfuStage::Validating => "Validating firmware...".into(),
            DfuStage::Activating => "Activating firmware...".into(),
            DfuStage::Disconnecting => "Waiting for device to restart...".into(),
            DfuStage::Complete => "Update complete!".into(),
            DfuStage::Aborted => "Update aborted".into(),
            DfuStage::Log { message } => message.clone(),
        }
    }
}

/// Receives progress stages from a running session.
pub trait DfuObserver: Send + Sync {
    fn on_stage(&self, stage: &DfuStage);
}

impl<F> DfuObserver for F
where
    F: Fn(&DfuStage) + Send + Sync,
{
    fn on_stage(&self, stage: &DfuStage) {
        self(stage)
    }
}

/// Discards every stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_stage(&self, _stage: &DfuStage) {}
}

/// Forwards stages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_stage(&self, stage: &DfuStage) {
        match stage {
            DfuStage::Uploading { .. } | DfuStage::Log { .. } => {
                debug!(percent = stage.percent(), "{}", stage.message())
            }
            _ => info!(percent = stage.percent(), "{}", stage.message()),
        }
    }
}
