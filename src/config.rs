use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::desk::{MAX_HEIGHT_M, MIN_HEIGHT_M};

/// Configuration for the desk controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bluetooth address of the desk, filled in by discovery
    pub desk_address: Option<String>,

    /// Remembered positions in meters
    pub positions: Positions,

    /// Retry budget for the best-effort connect at startup
    pub connect_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Positions {
    /// Sitting height
    pub sit: f64,

    /// Standing height
    pub stand: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetSlot {
    Sit,
    Stand,
}

impl PresetSlot {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sit => "sit",
            Self::Stand => "stand",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desk_address: None,
            positions: Positions {
                sit: 0.70,
                stand: 1.10,
            },
            connect_retries: 3,
        }
    }
}

impl Config {
    /// Get the configuration directory path (~/.idasen-control)
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".idasen-control"))
    }

    /// Get the configuration file path (~/.idasen-control/config)
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config"))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let content =
                fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            Ok(config)
        } else {
            log::info!("Config file not found, creating default");
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::config_dir()?;

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        }

        let config_file = Self::config_file()?;
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_file, content).context("Failed to write config file")?;

        log::info!("Configuration saved to {:?}", config_file);
        Ok(())
    }

    pub fn position(&self, slot: PresetSlot) -> f64 {
        match slot {
            PresetSlot::Sit => self.positions.sit,
            PresetSlot::Stand => self.positions.stand,
        }
    }

    pub fn set_position(&mut self, slot: PresetSlot, meters: f64) {
        // the engine revalidates targets; clamp here only to keep the file sane
        let meters = meters.clamp(MIN_HEIGHT_M, MAX_HEIGHT_M);
        match slot {
            PresetSlot::Sit => self.positions.sit = meters,
            PresetSlot::Stand => self.positions.stand = meters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_positions_are_within_device_limits() {
        let config = Config::default();
        for slot in [PresetSlot::Sit, PresetSlot::Stand] {
            let h = config.position(slot);
            assert!((MIN_HEIGHT_M..=MAX_HEIGHT_M).contains(&h));
        }
    }

    #[test]
    fn set_position_clamps_to_device_limits() {
        let mut config = Config::default();
        config.set_position(PresetSlot::Stand, 5.0);
        assert_eq!(config.position(PresetSlot::Stand), MAX_HEIGHT_M);
        config.set_position(PresetSlot::Sit, 0.1);
        assert_eq!(config.position(PresetSlot::Sit), MIN_HEIGHT_M);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config {
            desk_address: Some("E8:5B:0F:12:34:56".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.desk_address.as_deref(), Some("E8:5B:0F:12:34:56"));
        assert_eq!(back.positions.sit, config.positions.sit);
        assert_eq!(back.connect_retries, 3);
    }
}
