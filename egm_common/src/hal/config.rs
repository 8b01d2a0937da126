//! I/O board configuration types.
//!
//! This module contains the configuration loaded once at service start:
//! - `IoBoardConfig` - Main configuration loaded from io.toml
//! - `BoardSettings` - Poll period, bit width, persistence and probe timing
//! - `DeviceDescriptor` - One logical device bound to a physical bit

use crate::config::{ConfigError, SharedConfig};
use crate::consts::{
    DEFAULT_HEALTH_PROBE_INTERVAL_MS, DEFAULT_POLL_PERIOD_MS, IO_SERVICE_NAME, MAX_PHYSICAL_BITS,
};
use crate::device::DeviceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

fn default_poll_period_ms() -> u64 {
    DEFAULT_POLL_PERIOD_MS
}

fn default_physical_width() -> u8 {
    MAX_PHYSICAL_BITS as u8
}

fn default_health_probe_interval_ms() -> u64 {
    DEFAULT_HEALTH_PROBE_INTERVAL_MS
}

fn default_tick_value() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_shared() -> SharedConfig {
    SharedConfig {
        log_level: Default::default(),
        service_name: IO_SERVICE_NAME.to_string(),
    }
}

/// Main configuration loaded from `io.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoBoardConfig {
    /// Common service settings.
    #[serde(default = "default_shared")]
    pub shared: SharedConfig,

    /// Board-level timing and persistence settings.
    #[serde(default)]
    pub board: BoardSettings,

    /// Ordered input device descriptors (doors, buttons, key switches).
    #[serde(default)]
    pub inputs: Vec<DeviceDescriptor>,

    /// Ordered mechanical meter descriptors. Order defines slot index.
    #[serde(default)]
    pub meters: Vec<DeviceDescriptor>,
}

/// `[board]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSettings {
    /// Poll loop period in milliseconds.
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,

    /// Number of meaningful bits in the physical input image.
    #[serde(default = "default_physical_width")]
    pub physical_width: u8,

    /// Interval between meter health probes in milliseconds.
    #[serde(default = "default_health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,

    /// Path to the persisted slot store. In-memory store when absent.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            poll_period_ms: default_poll_period_ms(),
            physical_width: default_physical_width(),
            health_probe_interval_ms: default_health_probe_interval_ms(),
            state_file: None,
        }
    }
}

impl BoardSettings {
    /// Poll period as Duration.
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Health probe interval as Duration.
    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms)
    }
}

/// A logical device bound to one physical bit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDescriptor {
    /// Platform-wide logical identifier.
    pub logical_id: u32,
    /// Bit position on the I/O board.
    pub physical_id: u8,
    /// Human readable name.
    pub name: String,
    /// Device class.
    #[serde(default)]
    pub kind: DeviceKind,
    /// Value units represented by one physical pulse (meters only).
    #[serde(default = "default_tick_value")]
    pub default_tick_value: i64,
    /// Whether the device is active right after initialization.
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,
}

impl IoBoardConfig {
    /// Validate the board configuration.
    ///
    /// # Validation Rules
    /// 1. `poll_period_ms` > 0 and `health_probe_interval_ms` > 0
    /// 2. `physical_width` in 1..=MAX_PHYSICAL_BITS
    /// 3. Input physical ids below `physical_width`, meter ids below MAX_PHYSICAL_BITS
    /// 4. Logical ids unique within each list, meter physical ids unique
    /// 5. Meter tick values > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.board.poll_period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.board.health_probe_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_probe_interval_ms must be greater than 0".to_string(),
            ));
        }
        let width = self.board.physical_width as usize;
        if width == 0 || width > MAX_PHYSICAL_BITS {
            return Err(ConfigError::ValidationError(format!(
                "physical_width must be in 1..={} (got {})",
                MAX_PHYSICAL_BITS, width
            )));
        }

        let mut logical = HashSet::new();
        for input in &self.inputs {
            if input.physical_id as usize >= width {
                return Err(ConfigError::ValidationError(format!(
                    "Input '{}' physical_id {} outside board width {}",
                    input.name, input.physical_id, width
                )));
            }
            if !logical.insert(input.logical_id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate input logical_id: {}",
                    input.logical_id
                )));
            }
        }

        self.validate_meters()
    }

    /// Validate the meter section on its own.
    ///
    /// Meter bits must address the 64-bit output image, tick values must be
    /// positive and ids must be unique.
    pub fn validate_meters(&self) -> Result<(), ConfigError> {
        let mut logical = HashSet::new();
        let mut physical = HashSet::new();
        for meter in &self.meters {
            if meter.physical_id as usize >= MAX_PHYSICAL_BITS {
                return Err(ConfigError::ValidationError(format!(
                    "Meter '{}' physical_id {} out of range",
                    meter.name, meter.physical_id
                )));
            }
            if meter.default_tick_value <= 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Meter '{}' default_tick_value must be greater than 0",
                    meter.name
                )));
            }
            if !logical.insert(meter.logical_id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate meter logical_id: {}",
                    meter.logical_id
                )));
            }
            if !physical.insert(meter.physical_id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate meter physical_id: {}",
                    meter.physical_id
                )));
            }
        }

        Ok(())
    }

    /// Mask of all configured meter bits.
    pub fn meter_mask(&self) -> u64 {
        self.meters
            .iter()
            .fold(0u64, |mask, m| mask | (1u64 << m.physical_id))
    }
}

impl Default for IoBoardConfig {
    fn default() -> Self {
        Self {
            shared: default_shared(),
            board: BoardSettings::default(),
            inputs: Vec::new(),
            meters: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    const SAMPLE: &str = r#"
[shared]
service_name = "egm-io-01"

[board]
poll_period_ms = 20
physical_width = 16

[[inputs]]
logical_id = 1
physical_id = 3
name = "Main Door"
kind = "door"

[[inputs]]
logical_id = 2
physical_id = 4
name = "Cash Out"

[[meters]]
logical_id = 100
physical_id = 0
name = "Coin In"
default_tick_value = 10

[[meters]]
logical_id = 101
physical_id = 1
name = "Coin Out"
enabled_by_default = false
"#;

    #[test]
    fn parses_sample_config() {
        let config = IoBoardConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.board.poll_period(), Duration::from_millis(20));
        assert_eq!(config.board.physical_width, 16);
        assert_eq!(
            config.board.health_probe_interval_ms,
            DEFAULT_HEALTH_PROBE_INTERVAL_MS
        );
        assert!(config.board.state_file.is_none());

        assert_eq!(config.inputs.len(), 2);
        assert_eq!(config.inputs[0].kind, DeviceKind::Door);
        assert_eq!(config.inputs[1].kind, DeviceKind::Button);

        assert_eq!(config.meters[0].default_tick_value, 10);
        assert_eq!(config.meters[1].default_tick_value, 1);
        assert!(!config.meters[1].enabled_by_default);
        assert_eq!(config.meter_mask(), 0b11);
    }

    #[test]
    fn rejects_zero_poll_period() {
        let mut config = IoBoardConfig::default();
        config.board.poll_period_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_input_outside_width() {
        let mut config = IoBoardConfig::parse(SAMPLE).unwrap();
        config.inputs[0].physical_id = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_meter_bits() {
        let mut config = IoBoardConfig::parse(SAMPLE).unwrap();
        config.meters[1].physical_id = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("physical_id"));
    }

    #[test]
    fn rejects_non_positive_tick_value() {
        let mut config = IoBoardConfig::parse(SAMPLE).unwrap();
        config.meters[0].default_tick_value = 0;
        assert!(config.validate().is_err());
    }
}
