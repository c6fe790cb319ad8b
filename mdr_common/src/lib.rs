//! # MDR Common Library
//!
//! Shared definitions for the MDR instrument controller workspace:
//! operating mode, the persisted calibration record codec, the hardware
//! collaborator traits and the controller configuration.

pub mod config;
pub mod hal;
pub mod mode;
pub mod record;

pub use config::ControllerConfig;
pub use mode::OperatingMode;
pub use record::CalibrationRecord;
