//! Thermal loop: RTD sampling, linear offset calibration and the
//! per-zone thermostat rule driving the SSR heater outputs.
//!
//! The calibration block (offsets + setpoints) sits behind an `RwLock`;
//! measured temperatures are published as f32 bit patterns in atomics so
//! the command processor can answer `get_temp` without locking against the
//! sampling cadence.

use crate::actuator::ActuatorBank;
use mdr_common::hal::RtdReader;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Offsets and setpoints for the two heater zones.
#[derive(Debug, Clone, Copy)]
pub struct ThermalCalibration {
    /// Subtracted from the measured temperature, per zone.
    pub offset: [f32; 2],
    /// Thermostat setpoint, per zone.
    pub setpoint: [f32; 2],
}

/// Shared thermal state.
pub struct ThermalShared {
    calib: RwLock<ThermalCalibration>,
    measured: [AtomicU32; 2],
}

impl ThermalShared {
    pub fn new(default_setpoint: f32) -> Self {
        Self {
            calib: RwLock::new(ThermalCalibration {
                offset: [0.0; 2],
                setpoint: [default_setpoint; 2],
            }),
            measured: std::array::from_fn(|_| AtomicU32::new(0.0f32.to_bits())),
        }
    }

    fn zone(device: u8) -> Option<usize> {
        match device {
            1 => Some(0),
            2 => Some(1),
            _ => None,
        }
    }

    /// Publish a measured (pre-offset) temperature.
    pub fn publish_measured(&self, device: u8, temp: f32) {
        if let Some(i) = Self::zone(device) {
            self.measured[i].store(temp.to_bits(), Ordering::Relaxed);
        }
    }

    /// Measured temperature before offset calibration; 0 for a bad device.
    pub fn measured(&self, device: u8) -> f32 {
        Self::zone(device)
            .map(|i| f32::from_bits(self.measured[i].load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    /// Calibrated temperature (`measured − offset`); 0 for a bad device.
    pub fn calibrated(&self, device: u8) -> f32 {
        match Self::zone(device) {
            Some(i) => self.measured(device) - self.calib.read().offset[i],
            None => 0.0,
        }
    }

    /// Current offsets, as persisted.
    pub fn offsets(&self) -> [f32; 2] {
        self.calib.read().offset
    }

    /// Current setpoints, as persisted.
    pub fn setpoints(&self) -> [f32; 2] {
        self.calib.read().setpoint
    }

    /// Replace one zone's offset.
    pub fn set_offset(&self, device: u8, offset: f32) {
        if let Some(i) = Self::zone(device) {
            self.calib.write().offset[i] = offset;
        }
    }

    /// Replace both offsets (startup restore).
    pub fn set_offsets(&self, offsets: [f32; 2]) {
        self.calib.write().offset = offsets;
    }

    /// Replace one zone's setpoint.
    pub fn set_setpoint(&self, device: u8, setpoint: f32) {
        if let Some(i) = Self::zone(device) {
            self.calib.write().setpoint[i] = setpoint;
        }
    }

    /// Replace both setpoints.
    pub fn set_setpoints(&self, setpoints: [f32; 2]) {
        self.calib.write().setpoint = setpoints;
    }
}

/// Thermostat rule: heater off at/above setpoint, and off on a
/// non-positive reading (open/shorted probe reads as 0 or below).
pub fn heater_demand(calibrated: f32, setpoint: f32) -> bool {
    !(calibrated >= setpoint || calibrated <= 0.0)
}

/// Periodic RTD sampling task owning the digitizer.
pub struct ThermalLoop<R: RtdReader> {
    rtd: R,
    shared: Arc<ThermalShared>,
    bank: Arc<ActuatorBank>,
}

impl<R: RtdReader> ThermalLoop<R> {
    pub fn new(rtd: R, shared: Arc<ThermalShared>, bank: Arc<ActuatorBank>) -> Self {
        Self { rtd, shared, bank }
    }

    /// One sampling step: read both zones, apply the thermostat rule. A
    /// failed read forces the zone's heater off rather than freezing it in
    /// its last state.
    pub fn step(&mut self) {
        for device in 1..=2u8 {
            match self.rtd.read_temperature(device) {
                Ok(temp) => self.shared.publish_measured(device, temp),
                Err(e) => {
                    warn!("RTD {device} read failed, heater {device} off: {e}");
                    self.bank.set_ssr(device, false);
                    continue;
                }
            }
            let setpoint = self.shared.setpoints()[device as usize - 1];
            let demand = heater_demand(self.shared.calibrated(device), setpoint);
            self.bank.set_ssr(device, demand);
        }
    }

    /// Sampling loop (≤100 ms cadence).
    pub fn run(mut self, period: Duration, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            self.step();
            std::thread::sleep(period);
        }
    }
}
