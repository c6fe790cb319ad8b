//! Simulation backends for the collaborator traits.
//!
//! `SimTorqueAdc`/`SimRtd` let the binary run against a synthetic
//! instrument (sinusoidal torque at the cycle frequency, first-order
//! thermal response); the scripted/recording doubles drive the unit and
//! integration tests.

use mdr_common::hal::{HalError, HalResult, OutputBus, OutputChannel, RtdReader, TorqueAdc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Sinusoidal torque channel: `zero + amplitude·sin(2πft)` counts.
pub struct SimTorqueAdc {
    t0: Instant,
    zero: f64,
    amplitude: f64,
    frequency_hz: f64,
}

impl SimTorqueAdc {
    pub fn new(zero: f64, amplitude: f64, frequency_hz: f64) -> Self {
        Self {
            t0: Instant::now(),
            zero,
            amplitude,
            frequency_hz,
        }
    }
}

impl TorqueAdc for SimTorqueAdc {
    fn read_raw(&mut self) -> HalResult<i32> {
        let t = self.t0.elapsed().as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * self.frequency_hz * t;
        Ok((self.zero + self.amplitude * phase.sin()) as i32)
    }
}

/// First-order thermal response toward a final temperature.
pub struct SimRtd {
    t0: Instant,
    ambient: f32,
    settled: f32,
    time_constant_s: f32,
}

impl SimRtd {
    pub fn new(ambient: f32, settled: f32, time_constant_s: f32) -> Self {
        Self {
            t0: Instant::now(),
            ambient,
            settled,
            time_constant_s,
        }
    }
}

impl RtdReader for SimRtd {
    fn read_temperature(&mut self, device: u8) -> HalResult<f32> {
        if !(1..=2).contains(&device) {
            return Err(HalError::ReadFailed(format!("no RTD device {device}")));
        }
        let t = self.t0.elapsed().as_secs_f32();
        // Zone 2 lags slightly behind zone 1.
        let tau = self.time_constant_s * if device == 2 { 1.1 } else { 1.0 };
        Ok(self.settled + (self.ambient - self.settled) * (-t / tau).exp())
    }
}

/// Output bus that records every drive event. Clones are handles onto the
/// same log, so tests can hand one to the bank and keep another.
#[derive(Clone, Default)]
pub struct RecordingBus {
    events: Arc<Mutex<Vec<(OutputChannel, bool)>>>,
}

impl RecordingBus {
    pub fn events(&self) -> Vec<(OutputChannel, bool)> {
        self.events.lock().clone()
    }
}

impl OutputBus for RecordingBus {
    fn set_output(&mut self, channel: OutputChannel, on: bool) -> HalResult<()> {
        debug!("output {channel:?} -> {on}");
        self.events.lock().push((channel, on));
        Ok(())
    }
}

/// Scripted ADC for tests: plays a sequence, then either repeats the last
/// value or starts failing.
pub struct ScriptedAdc {
    script: Vec<i32>,
    index: usize,
    fail_when_exhausted: bool,
}

impl ScriptedAdc {
    pub fn new(script: Vec<i32>) -> Self {
        Self {
            script,
            index: 0,
            fail_when_exhausted: false,
        }
    }

    pub fn failing_after(script: Vec<i32>) -> Self {
        Self {
            script,
            index: 0,
            fail_when_exhausted: true,
        }
    }
}

impl TorqueAdc for ScriptedAdc {
    fn read_raw(&mut self) -> HalResult<i32> {
        if let Some(&v) = self.script.get(self.index) {
            self.index += 1;
            return Ok(v);
        }
        if self.fail_when_exhausted {
            return Err(HalError::ReadFailed("script exhausted".into()));
        }
        self.script
            .last()
            .copied()
            .ok_or_else(|| HalError::ReadFailed("empty script".into()))
    }
}

/// Scripted RTD pair for tests; repeats the last value per device, or
/// starts failing once a script runs out.
pub struct ScriptedRtd {
    scripts: [Vec<f32>; 2],
    index: [usize; 2],
    fail_when_exhausted: bool,
}

impl ScriptedRtd {
    pub fn new(scripts: [Vec<f32>; 2]) -> Self {
        Self {
            scripts,
            index: [0; 2],
            fail_when_exhausted: false,
        }
    }

    pub fn failing_after(scripts: [Vec<f32>; 2]) -> Self {
        Self {
            scripts,
            index: [0; 2],
            fail_when_exhausted: true,
        }
    }
}

impl RtdReader for ScriptedRtd {
    fn read_temperature(&mut self, device: u8) -> HalResult<f32> {
        let Some(i) = (device as usize).checked_sub(1).filter(|&i| i < 2) else {
            return Err(HalError::ReadFailed(format!("no RTD device {device}")));
        };
        let script = &self.scripts[i];
        let at = self.index[i];
        self.index[i] += 1;
        if self.fail_when_exhausted && at >= script.len() {
            return Err(HalError::ReadFailed("script exhausted".into()));
        }
        script
            .get(at.min(script.len().saturating_sub(1)))
            .copied()
            .ok_or_else(|| HalError::ReadFailed("empty script".into()))
    }
}

/// In-memory calibration blob for tests and bench runs without an EEPROM
/// image file. Clones share the blob; unwritten memory reads as erased.
#[derive(Clone, Default)]
pub struct MemBlob {
    blob: Arc<Mutex<Option<[u8; mdr_common::record::RECORD_LEN]>>>,
}

impl mdr_common::hal::CalibrationMemory for MemBlob {
    fn read_blob(&mut self) -> HalResult<[u8; mdr_common::record::RECORD_LEN]> {
        Ok(self.blob.lock().unwrap_or([0xFF; mdr_common::record::RECORD_LEN]))
    }

    fn write_blob(&mut self, blob: &[u8; mdr_common::record::RECORD_LEN]) -> HalResult<()> {
        *self.blob.lock() = Some(*blob);
        Ok(())
    }
}
