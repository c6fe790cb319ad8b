//! Torque-channel and RTD calibration procedures, and the dedicated task
//! that runs the long ones.
//!
//! The timed-window procedures block for their full duration (up to 60 s
//! per phase) with no cancellation, so they run on their own task: the
//! command processor claims the status flag, hands over a request and
//! stays responsive; completion goes out asynchronously as a reply line.

use crate::actuator::ActuatorBank;
use crate::loadcell::LoadCellShared;
use crate::signal::{TorqueScale, AMPLITUDE_EPSILON};
use crate::store::CalibrationStore;
use crate::thermal::ThermalShared;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Standard gravity, for known-weight × lever-arm reference torque.
pub const STANDARD_GRAVITY: f64 = 9.81;

/// Phase of the calibration task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CalibPhase {
    /// No procedure in flight.
    Idle = 0,
    /// Request accepted, task not yet sampling.
    Pending = 1,
    /// Zero-offset window running.
    Zeroing = 2,
    /// Coefficient window running.
    Spanning = 3,
}

impl CalibPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            CalibPhase::Idle => "idle",
            CalibPhase::Pending => "pending",
            CalibPhase::Zeroing => "zero",
            CalibPhase::Spanning => "span",
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => CalibPhase::Pending,
            2 => CalibPhase::Zeroing,
            3 => CalibPhase::Spanning,
            _ => CalibPhase::Idle,
        }
    }
}

/// Shared, pollable calibration status.
#[derive(Debug, Default)]
pub struct CalibStatus(AtomicU8);

impl CalibStatus {
    pub fn phase(&self) -> CalibPhase {
        CalibPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn busy(&self) -> bool {
        self.phase() != CalibPhase::Idle
    }

    /// Claim the task for a new procedure. Fails while one is in flight;
    /// the claim happens in the command context so two frames can never
    /// both start one.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(
                CalibPhase::Idle as u8,
                CalibPhase::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set(&self, phase: CalibPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// Request accepted by the calibration task.
#[derive(Debug, Clone, Copy)]
pub enum CalibRequest {
    /// Full torque-channel calibration: zero window, warm-up, span window.
    TorqueChannel { weight: f64, lever_arm: f64 },
    /// Zero-offset only, over the given window.
    ZeroOffset { duration: Duration },
}

/// Mean of samples taken at `interval` for `duration`; `None` if the
/// window produced no samples.
pub fn window_mean(
    mut sample: impl FnMut() -> f64,
    interval: Duration,
    duration: Duration,
) -> Option<f64> {
    let deadline = Instant::now() + duration;
    let mut sum = 0.0;
    let mut count = 0u64;
    while Instant::now() < deadline {
        sum += sample();
        count += 1;
        std::thread::sleep(interval);
    }
    (count > 0).then(|| sum / count as f64)
}

/// Half peak-to-peak of samples taken at `interval` for `duration`.
pub fn window_amplitude(
    mut sample: impl FnMut() -> f64,
    interval: Duration,
    duration: Duration,
) -> Option<f64> {
    let deadline = Instant::now() + duration;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    while Instant::now() < deadline {
        let s = sample();
        min = min.min(s);
        max = max.max(s);
        std::thread::sleep(interval);
    }
    (min <= max).then(|| (max - min) / 2.0)
}

/// Calibration procedures over the shared instrument state.
///
/// Cheap to clone: the command processor keeps one for the quick RTD
/// procedure, the calibration task owns one for the long ones.
#[derive(Clone)]
pub struct CalibrationEngine {
    loadcell: Arc<LoadCellShared>,
    bank: Arc<ActuatorBank>,
    scale: Arc<TorqueScale>,
    thermal: Arc<ThermalShared>,
    sample_interval: Duration,
    window: Duration,
    stagger: Duration,
}

impl CalibrationEngine {
    pub fn new(
        loadcell: Arc<LoadCellShared>,
        bank: Arc<ActuatorBank>,
        scale: Arc<TorqueScale>,
        thermal: Arc<ThermalShared>,
        sample_interval: Duration,
        window: Duration,
        stagger: Duration,
    ) -> Self {
        Self {
            loadcell,
            bank,
            scale,
            thermal,
            sample_interval,
            window,
            stagger,
        }
    }

    /// Sample raw counts for `duration` and take the mean as the new ADC
    /// zero. An empty window leaves the previous offset untouched.
    /// Returns the offset in effect afterwards.
    pub fn zero_offset(&self, duration: Duration) -> f64 {
        let loadcell = &self.loadcell;
        match window_mean(|| loadcell.raw() as f64, self.sample_interval, duration) {
            Some(mean) => self.scale.set_adc_zero(mean),
            None => warn!("zero-offset window produced no samples, offset unchanged"),
        }
        self.scale.adc_zero()
    }

    /// Sample offset-corrected counts for `duration`; amplitude above the
    /// numeric guard sets `k_t = reference_torque / amplitude`, otherwise
    /// the coefficient is left untouched. Returns the coefficient in
    /// effect afterwards.
    pub fn torque_coefficient(&self, duration: Duration, reference_torque: f64) -> f64 {
        let loadcell = &self.loadcell;
        let zero = self.scale.adc_zero();
        let amplitude = window_amplitude(
            || loadcell.raw() as f64 - zero,
            self.sample_interval,
            duration,
        );
        match amplitude {
            Some(a) if a > AMPLITUDE_EPSILON => self.scale.set_k_t(reference_torque / a),
            _ => warn!("span amplitude below guard, coefficient unchanged"),
        }
        self.scale.k_t()
    }

    /// Full torque-channel sequence: actuators off → zero window →
    /// relay warm-up → span window → actuators off. Persistence is the
    /// caller's last step so the store is not held across the windows.
    pub fn calibrate_torque_channel(
        &self,
        status: &CalibStatus,
        weight: f64,
        lever_arm: f64,
    ) -> (f64, f64) {
        let reference = weight * STANDARD_GRAVITY * lever_arm;
        info!(
            "torque calibration: weight={weight} kg, lever={lever_arm} m, reference={reference} N·m"
        );
        self.bank.all_off();
        status.set(CalibPhase::Zeroing);
        let zero = self.zero_offset(self.window);
        self.bank.warmup_sequence(self.stagger);
        status.set(CalibPhase::Spanning);
        let k_t = self.torque_coefficient(self.window, reference);
        self.bank.all_off();
        (zero, k_t)
    }

    /// RTD offset calibration: `offset = measured − known`, both offsets
    /// persisted together even though only one changed.
    pub fn calibrate_temperature_channel(
        &self,
        store: &mut CalibrationStore,
        device: u8,
        known_temp: f32,
    ) {
        let offset = self.thermal.measured(device) - known_temp;
        self.thermal.set_offset(device, offset);
        if let Err(e) = store.save_rtd_calibration(self.thermal.offsets()) {
            warn!("RTD calibration persist failed: {e}");
        }
    }

    fn all_off(&self) {
        self.bank.all_off();
    }
}

/// Calibration task body. Owns the long procedures; reports completion as
/// a reply line through the single writer.
pub fn run_calibration_task(
    engine: CalibrationEngine,
    store: Arc<Mutex<CalibrationStore>>,
    status: Arc<CalibStatus>,
    rx: Receiver<CalibRequest>,
    out: Sender<String>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let request = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let line = match request {
            CalibRequest::TorqueChannel { weight, lever_arm } => {
                let (zero, k_t) = engine.calibrate_torque_channel(&status, weight, lever_arm);
                if let Err(e) = store.lock().save_mdr_calibration(zero as f32, k_t as f32) {
                    warn!("MDR calibration persist failed: {e}");
                }
                serde_json::json!({"cmd": "calibrate_mdr", "ADC_zero": zero, "K_T": k_t})
                    .to_string()
            }
            CalibRequest::ZeroOffset { duration } => {
                engine.all_off();
                status.set(CalibPhase::Zeroing);
                let zero = engine.zero_offset(duration);
                if let Err(e) = store
                    .lock()
                    .save_mdr_calibration(zero as f32, engine.scale.k_t() as f32)
                {
                    warn!("zero-offset persist failed: {e}");
                }
                serde_json::json!({"cmd": "offset_mdr", "ADC_zero": zero}).to_string()
            }
        };
        status.set(CalibPhase::Idle);
        if out.send(line).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingBus;

    fn engine(
        window: Duration,
    ) -> (CalibrationEngine, Arc<LoadCellShared>, Arc<TorqueScale>) {
        let loadcell = Arc::new(LoadCellShared::default());
        let bank = Arc::new(ActuatorBank::new(Box::new(RecordingBus::default())));
        let scale = Arc::new(TorqueScale::new());
        let thermal = Arc::new(ThermalShared::new(180.0));
        let engine = CalibrationEngine::new(
            loadcell.clone(),
            bank,
            scale.clone(),
            thermal,
            Duration::from_millis(1),
            window,
            Duration::ZERO,
        );
        (engine, loadcell, scale)
    }

    #[test]
    fn window_mean_is_arithmetic_mean() {
        let samples = [10.0, 20.0, 30.0, 40.0];
        let mut i = 0;
        let mean = window_mean(
            || {
                let s = samples[i % samples.len()];
                i += 1;
                s
            },
            Duration::ZERO,
            Duration::from_millis(5),
        )
        .unwrap();
        // Whatever the count, every full pass over a symmetric sequence
        // keeps the mean inside the sample range.
        assert!((10.0..=40.0).contains(&mean));

        // A constant sequence pins it exactly.
        let mean = window_mean(|| 12.5, Duration::ZERO, Duration::from_millis(5)).unwrap();
        assert!((mean - 12.5).abs() < 1e-12);
    }

    #[test]
    fn empty_window_yields_none() {
        assert_eq!(
            window_mean(|| 1.0, Duration::ZERO, Duration::ZERO),
            None
        );
        assert_eq!(
            window_amplitude(|| 1.0, Duration::ZERO, Duration::ZERO),
            None
        );
    }

    #[test]
    fn zero_offset_sets_mean_and_guards_empty_window() {
        let (engine, loadcell, scale) = engine(Duration::from_millis(60));
        scale.set_adc_zero(555.0);
        loadcell.publish(1000, 1000);
        let zero = engine.zero_offset(Duration::from_millis(20));
        assert!((zero - 1000.0).abs() < 1e-9);
        // Empty window leaves the previous value in place.
        let zero = engine.zero_offset(Duration::ZERO);
        assert!((zero - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn coefficient_from_known_amplitude() {
        let (engine, loadcell, scale) = engine(Duration::from_millis(60));
        scale.set_adc_zero(0.0);
        // Oscillate between ±200 counts: amplitude 200.
        std::thread::scope(|s| {
            let feeder = loadcell.clone();
            s.spawn(move || {
                for i in 0..40 {
                    let v = if i % 2 == 0 { 200 } else { -200 };
                    feeder.publish(v, v);
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
            let k = engine.torque_coefficient(Duration::from_millis(30), 100.0);
            // amplitude 200 -> k_t = 100/200 = 0.5
            assert!((k - 0.5).abs() < 1e-9, "k_t {k}");
        });
    }

    #[test]
    fn flat_signal_leaves_coefficient() {
        let (engine, loadcell, scale) = engine(Duration::from_millis(60));
        scale.set_k_t(0.125);
        loadcell.publish(500, 500);
        scale.set_adc_zero(500.0);
        let k = engine.torque_coefficient(Duration::from_millis(15), 100.0);
        assert!((k - 0.125).abs() < 1e-12);
    }

    #[test]
    fn status_claim_is_exclusive() {
        let status = CalibStatus::default();
        assert!(status.try_claim());
        assert!(!status.try_claim());
        assert!(status.busy());
        status.set(CalibPhase::Idle);
        assert!(status.try_claim());
    }
}
