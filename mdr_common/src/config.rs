//! Controller configuration.
//!
//! Loaded from TOML at startup; every field has a default so an empty file
//! (or no file) yields the stock instrument timing. Numeric parameters are
//! bounds-checked by `validate()` before any task is spawned.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration load/validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    /// TOML syntax or type error.
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    /// Parameter out of bounds.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Mode-controller tick period [ms] (default: 10).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Serial poll period of the command processor [ms] (default: 10).
    #[serde(default = "default_tick_ms")]
    pub command_poll_ms: u64,

    /// Load-cell sampling period [ms] (default: 16).
    #[serde(default = "default_loadcell_ms")]
    pub loadcell_ms: u64,

    /// Thermal loop period [ms] (default: 100).
    #[serde(default = "default_thermal_ms")]
    pub thermal_ms: u64,

    /// Actuator supervisory loop period [ms] (default: 500).
    #[serde(default = "default_supervisor_ms")]
    pub supervisor_ms: u64,

    /// Oscillation frequency of the torque channel [Hz] (default: 1.66,
    /// giving a cycle window of ~602 ms).
    #[serde(default = "default_cycle_hz")]
    pub cycle_frequency_hz: f64,

    /// Relay warm-up stagger between consecutive relays [ms]
    /// (default: 1000).
    #[serde(default = "default_stagger_ms")]
    pub warmup_stagger_ms: u64,

    /// Thermostat setpoint applied to both zones until configured [°C]
    /// (default: 180).
    #[serde(default = "default_setpoint")]
    pub default_setpoint: f32,

    /// Run duration until `set_run_time` is issued [s] (default: 60).
    #[serde(default = "default_run_duration")]
    pub default_run_duration_s: u32,

    /// Calibration sampling interval [ms] (default: 5).
    #[serde(default = "default_calib_interval")]
    pub calib_sample_interval_ms: u64,

    /// Window length of each MDR calibration phase [s] (default: 60).
    #[serde(default = "default_calib_window")]
    pub calib_window_s: u64,
}

fn default_tick_ms() -> u64 {
    10
}
fn default_loadcell_ms() -> u64 {
    16
}
fn default_thermal_ms() -> u64 {
    100
}
fn default_supervisor_ms() -> u64 {
    500
}
fn default_cycle_hz() -> f64 {
    1.66
}
fn default_stagger_ms() -> u64 {
    1000
}
fn default_setpoint() -> f32 {
    180.0
}
fn default_run_duration() -> u32 {
    60
}
fn default_calib_interval() -> u64 {
    5
}
fn default_calib_window() -> u64 {
    60
}

impl Default for ControllerConfig {
    fn default() -> Self {
        // Deserializing an empty table applies every serde default.
        toml::from_str("").expect("defaults are total")
    }
}

impl ControllerConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Bounds check. Rejects zero periods and non-positive frequencies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("tick_ms", self.tick_ms),
            ("command_poll_ms", self.command_poll_ms),
            ("loadcell_ms", self.loadcell_ms),
            ("thermal_ms", self.thermal_ms),
            ("supervisor_ms", self.supervisor_ms),
            ("calib_sample_interval_ms", self.calib_sample_interval_ms),
        ] {
            if value == 0 || value > 10_000 {
                return Err(ConfigError::Invalid(format!(
                    "{name} {value} out of range [1, 10000]"
                )));
            }
        }
        if !(self.cycle_frequency_hz > 0.0 && self.cycle_frequency_hz <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "cycle_frequency_hz {} out of range (0, 100]",
                self.cycle_frequency_hz
            )));
        }
        if self.calib_window_s == 0 || self.calib_window_s > 600 {
            return Err(ConfigError::Invalid(format!(
                "calib_window_s {} out of range [1, 600]",
                self.calib_window_s
            )));
        }
        Ok(())
    }

    /// Cycle window period derived from the oscillation frequency.
    pub fn cycle_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.cycle_frequency_hz)
    }
}
