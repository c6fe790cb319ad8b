//! Hardware collaborator traits.
//!
//! The coordination layer depends only on these signatures; the bit-level
//! driver protocols beneath them (load-cell ADC front-end, RTD digitizer,
//! GPIO bus, non-volatile memory transactions) live outside this workspace.
//! Implementations must be `Send` so the periodic tasks can own them.

use crate::record::RECORD_LEN;
use thiserror::Error;

/// Error for hardware collaborator operations.
///
/// Callers generally log these and carry on; no retry logic exists
/// anywhere in the coordination layer.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Bus-level read failure.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// Bus-level write failure.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Result alias for collaborator operations.
pub type HalResult<T> = Result<T, HalError>;

/// Output channel identifier: 4 relays and 2 SSR heater drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    /// Power relay, 1-based index 1..=4.
    Relay(u8),
    /// Solid-state relay (heater driver), 1-based index 1..=2.
    Ssr(u8),
}

/// Raw torque-channel ADC.
pub trait TorqueAdc: Send {
    /// One raw conversion, signed counts.
    fn read_raw(&mut self) -> HalResult<i32>;
}

/// Calibrated-resistance temperature reader, two channels.
pub trait RtdReader: Send {
    /// Temperature of device 1 or 2, degrees Celsius, before offset
    /// calibration.
    fn read_temperature(&mut self, device: u8) -> HalResult<f32>;
}

/// Discrete output bus driving relays and SSRs.
pub trait OutputBus: Send {
    /// Drive one channel.
    fn set_output(&mut self, channel: OutputChannel, on: bool) -> HalResult<()>;
}

/// Non-volatile storage for the calibration blob.
///
/// The blob is always transferred whole; any page-split an EEPROM needs is
/// a transport detail below this trait (see the paged adapter in the
/// control unit's store module).
pub trait CalibrationMemory: Send {
    /// Read the full 64-byte blob.
    fn read_blob(&mut self) -> HalResult<[u8; RECORD_LEN]>;
    /// Write the full 64-byte blob.
    fn write_blob(&mut self, blob: &[u8; RECORD_LEN]) -> HalResult<()>;
}

// Boxed collaborators pass through, so the periodic tasks can own either a
// concrete driver or a `Box<dyn …>` handed in by the runtime wiring.

impl<T: TorqueAdc + ?Sized> TorqueAdc for Box<T> {
    fn read_raw(&mut self) -> HalResult<i32> {
        (**self).read_raw()
    }
}

impl<T: RtdReader + ?Sized> RtdReader for Box<T> {
    fn read_temperature(&mut self, device: u8) -> HalResult<f32> {
        (**self).read_temperature(device)
    }
}

impl<T: OutputBus + ?Sized> OutputBus for Box<T> {
    fn set_output(&mut self, channel: OutputChannel, on: bool) -> HalResult<()> {
        (**self).set_output(channel, on)
    }
}

impl<T: CalibrationMemory + ?Sized> CalibrationMemory for Box<T> {
    fn read_blob(&mut self) -> HalResult<[u8; RECORD_LEN]> {
        (**self).read_blob()
    }

    fn write_blob(&mut self, blob: &[u8; RECORD_LEN]) -> HalResult<()> {
        (**self).write_blob(blob)
    }
}
