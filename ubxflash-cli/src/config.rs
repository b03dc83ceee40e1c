//! Configuration file support for ubxflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UBXFLASH_*)
//! 3. Local config file (./ubxflash.toml)
//! 4. Global config file (~/.config/ubxflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred port (e.g., "/dev/ttyACM0", "COM3" or "host:port").
    pub port: Option<String>,
    /// Baud rate the receiver currently runs at.
    pub baud: Option<u32>,
    /// Baud rate of the safeboot loader.
    pub safe_baud: Option<u32>,
    /// Baud rate used for the transfer.
    pub update_baud: Option<u32>,
}

/// Update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Flash organization table for receivers before u-blox 7.
    pub flash_definition: Option<PathBuf>,
    /// FIS file.
    pub fis: Option<PathBuf>,
    /// Send the training sequence.
    pub training: Option<bool>,
    /// Detect the receiver's baud rate.
    pub autobaud: Option<bool>,
    /// Restart into safeboot before updating.
    pub safeboot: Option<bool>,
    /// Reboot after the update.
    pub reset: Option<bool>,
    /// Erase the whole chip with one command.
    pub chip_erase: Option<bool>,
    /// Erase the whole flash.
    pub erase_all: Option<bool>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Update settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("ubxflash.toml")) {
            debug!("Loaded local config from ubxflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ubxflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self { connection, update } = other;

        // Connection
        if connection.port.is_some() {
            self.connection.port = connection.port;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.safe_baud.is_some() {
            self.connection.safe_baud = connection.safe_baud;
        }
        if connection.update_baud.is_some() {
            self.connection.update_baud = connection.update_baud;
        }

        // Update
        if update.flash_definition.is_some() {
            self.update.flash_definition = update.flash_definition;
        }
        if update.fis.is_some() {
            self.update.fis = update.fis;
        }
        let switches = [
            (&mut self.update.training, update.training),
            (&mut self.update.autobaud, update.autobaud),
            (&mut self.update.safeboot, update.safeboot),
            (&mut self.update.reset, update.reset),
            (&mut self.update.chip_erase, update.chip_erase),
            (&mut self.update.erase_all, update.erase_all),
        ];
        for (target, value) in switches {
            if value.is_some() {
                *target = value;
            }
        }
    }
}
