//! Persisted DFU settings.
//!
//! A [`DfuConfig`] stored as TOML in a settings directory. Every field is
//! optional in the file; missing ones take their defaults, so a file that
//! only sets `prn_interval = 12` is valid.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dfu::{DfuConfig, DfuError, DfuResult};

/// Settings file name stored in the settings directory.
const SETTINGS_FILENAME: &str = "dfu.toml";

/// Manages persistence of the DFU configuration to a TOML file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given directory.
    pub fn new(settings_dir: &Path) -> Self {
        let settings_file_path = settings_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Use an explicit file instead of `<dir>/dfu.toml`.
    pub fn with_file(path: &Path) -> Self {
        Self {
            settings_file_path: path.to_path_buf(),
        }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> DfuResult<DfuConfig> {
        if !self.settings_file_path.exists() {
            debug!(path = %self.settings_file_path.display(), "No settings file, using defaults");
            return Ok(DfuConfig::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(DfuConfig::default());
        }

        toml::from_str(&contents).map_err(|e| DfuError::InvalidSettings {
            reason: e.to_string(),
        })
    }

    /// Save settings to disk.
    pub fn save(&self, config: &DfuConfig) -> DfuResult<()> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(config).map_err(|e| DfuError::InvalidSettings {
            reason: e.to_string(),
        })?;
        fs::write(&self.settings_file_path, contents)?;

        debug!(path = %self.settings_file_path.display(), "Settings saved");
        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
