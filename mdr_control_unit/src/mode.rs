//! Operating-mode state machine: Idle / Run / Calib.
//!
//! Single owner of the mode, the run timer, the cycle windows, the
//! amplitude filters and the tare offset. Requests arrive on an mpsc
//! channel and are observed on the next 10 ms tick; the same mode twice is
//! a no-op, so a repeated `run` neither re-triggers the warm-up nor resets
//! the run timer. A read-only atomic snapshot is exported for queries.
//!
//! Run entry only requests the relay warm-up; the run timer arms (and run
//! telemetry starts) once the supervisory loop signals that the staggered
//! sequence completed, so elapsed time never includes relays coming up.
//!
//! Calib mode deliberately emits no periodic telemetry: the quiet channel
//! is for the calibration procedures the operator is about to run, not a
//! missing feature.

use crate::actuator::ActuatorBank;
use crate::loadcell::LoadCellShared;
use crate::signal::{AmplitudeFilter, CycleWindow, TorqueScale};
use mdr_common::mode::{ModeRequest, OperatingMode};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Amplitude emitted when the filtered value is non-positive: the
/// instrument's "no-signal" marker, preserved literally.
const NO_SIGNAL_AMPLITUDE: f64 = 1.0;

/// Filter depths per mode.
const RUN_FILTER_LEN: usize = 5;
const IDLE_FILTER_LEN: usize = 2;

/// Read-only snapshot exported by the controller.
#[derive(Debug)]
pub struct ModeSnapshot {
    mode: AtomicU8,
    elapsed_s: AtomicU32,
    remaining_s: AtomicU32,
    run_duration_s: AtomicU32,
}

impl ModeSnapshot {
    pub fn new(run_duration_s: u32) -> Self {
        Self {
            mode: AtomicU8::new(OperatingMode::Idle.as_u8()),
            elapsed_s: AtomicU32::new(0),
            remaining_s: AtomicU32::new(0),
            run_duration_s: AtomicU32::new(run_duration_s),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        OperatingMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn elapsed_s(&self) -> u32 {
        self.elapsed_s.load(Ordering::Relaxed)
    }

    pub fn remaining_s(&self) -> u32 {
        self.remaining_s.load(Ordering::Relaxed)
    }

    pub fn run_duration_s(&self) -> u32 {
        self.run_duration_s.load(Ordering::Relaxed)
    }
}

/// Request consumed by the controller on its next tick.
#[derive(Debug, Clone, Copy)]
pub enum ModeCommand {
    /// `set_mode` value from the wire.
    Request(ModeRequest),
    /// Configured run duration in seconds.
    SetRunTime(u32),
    /// Capture the idle filter mean as the new tare offset.
    Tare,
}

/// Active run-timer state.
#[derive(Debug, Clone, Copy)]
struct RunSession {
    started_at: Instant,
}

/// The state machine itself. Owns everything mode-scoped; driven by
/// [`tick`](Self::tick), either from the periodic loop or directly from
/// tests with synthetic instants.
pub struct ModeController {
    rx: Receiver<ModeCommand>,
    snapshot: Arc<ModeSnapshot>,
    bank: Arc<ActuatorBank>,
    loadcell: Arc<LoadCellShared>,
    scale: Arc<TorqueScale>,
    out: Sender<String>,
    cycle_period: Duration,

    mode: OperatingMode,
    window: CycleWindow,
    idle_filter: AmplitudeFilter<IDLE_FILTER_LEN>,
    run_filter: AmplitudeFilter<RUN_FILTER_LEN>,
    run: Option<RunSession>,
    tare_offset: f64,
    tare_pending: bool,
}

impl ModeController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: Receiver<ModeCommand>,
        snapshot: Arc<ModeSnapshot>,
        bank: Arc<ActuatorBank>,
        loadcell: Arc<LoadCellShared>,
        scale: Arc<TorqueScale>,
        out: Sender<String>,
        cycle_period: Duration,
        now: Instant,
    ) -> Self {
        // Power-up lands in Idle with everything off.
        bank.all_off();
        Self {
            rx,
            snapshot,
            bank,
            loadcell,
            scale,
            out,
            cycle_period,
            mode: OperatingMode::Idle,
            window: CycleWindow::new(now),
            idle_filter: AmplitudeFilter::new(),
            run_filter: AmplitudeFilter::new(),
            run: None,
            tare_offset: 0.0,
            tare_pending: false,
        }
    }

    /// Current mode (test hook; tasks read the snapshot instead).
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    fn emit(&self, line: String) {
        // A closed writer means shutdown; nothing useful to do.
        let _ = self.out.send(line);
    }

    fn drain_requests(&mut self, now: Instant) {
        loop {
            match self.rx.try_recv() {
                Ok(ModeCommand::Request(ModeRequest::Enter(mode))) => self.enter(mode, now),
                Ok(ModeCommand::Request(ModeRequest::Stop)) => self.stop(now),
                Ok(ModeCommand::SetRunTime(seconds)) => {
                    self.snapshot.run_duration_s.store(seconds, Ordering::Relaxed);
                }
                Ok(ModeCommand::Tare) => self.tare_pending = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Transition into `mode`. Re-entering the current mode is a no-op.
    fn enter(&mut self, mode: OperatingMode, now: Instant) {
        if mode == self.mode {
            debug!("mode {mode} re-requested, ignoring");
            return;
        }
        info!("mode {} -> {}", self.mode, mode);
        // Leaving Run drops the session and clears the timer readouts.
        self.run = None;
        self.snapshot.elapsed_s.store(0, Ordering::Relaxed);
        self.snapshot.remaining_s.store(0, Ordering::Relaxed);
        self.window.reset(now);
        match mode {
            OperatingMode::Idle => {
                self.bank.all_off();
                self.idle_filter.clear();
            }
            OperatingMode::Run => {
                // Warm-up runs in the supervisory loop; the timer arms on
                // its completion signal, observed in tick_run.
                self.bank.request_warmup();
                self.run_filter.clear();
                let duration = self.snapshot.run_duration_s();
                self.snapshot.remaining_s.store(duration, Ordering::Relaxed);
            }
            OperatingMode::Calib => {
                self.bank.all_off();
            }
        }
        self.mode = mode;
        self.snapshot.mode.store(mode.as_u8(), Ordering::Relaxed);
    }

    /// Transient stop: force Idle and make sure nothing stays energized,
    /// whatever mode we were in.
    fn stop(&mut self, now: Instant) {
        self.enter(OperatingMode::Idle, now);
        self.bank.all_off();
    }

    /// One 10 ms tick: observe requests, then run the current mode.
    pub fn tick(&mut self, now: Instant) {
        self.drain_requests(now);
        match self.mode {
            OperatingMode::Idle => self.tick_idle(now),
            OperatingMode::Run => self.tick_run(now),
            OperatingMode::Calib => {} // intentionally quiet
        }
    }

    fn tick_idle(&mut self, now: Instant) {
        self.window.observe(self.scale.torque(self.loadcell.filtered()));

        if self.tare_pending {
            self.tare_offset = self.idle_filter.mean().unwrap_or(0.0);
            self.tare_pending = false;
            info!("idle amplitude tared at {}", self.tare_offset);
        }

        if !self.window.elapsed(now, self.cycle_period) {
            return;
        }
        if let Some(amplitude) = self.window.amplitude() {
            self.idle_filter.push(amplitude);
            let filtered = self.idle_filter.mean().unwrap_or(amplitude);
            let amp = if filtered <= 0.0 {
                NO_SIGNAL_AMPLITUDE
            } else {
                filtered
            };
            self.emit(
                serde_json::json!({
                    "mode": "idle",
                    "raw": self.loadcell.raw(),
                    "amp": amp,
                    "offset_amp": amp - self.tare_offset,
                })
                .to_string(),
            );
        }
        self.window.reset(now);
    }

    fn tick_run(&mut self, now: Instant) {
        let Some(session) = self.run else {
            // Warming up: the timer arms once the staggered relay
            // sequence has finished.
            if self.bank.warmup_complete() {
                info!("warm-up complete, run timer armed");
                self.run = Some(RunSession { started_at: now });
                self.window.reset(now);
            }
            return;
        };
        let duration = self.snapshot.run_duration_s();
        let elapsed = now.duration_since(session.started_at).as_secs() as u32;
        let remaining = duration.saturating_sub(elapsed);
        self.snapshot.elapsed_s.store(elapsed, Ordering::Relaxed);
        self.snapshot.remaining_s.store(remaining, Ordering::Relaxed);

        let filtered_counts = self.loadcell.filtered();
        let torque = self.scale.torque(filtered_counts);
        self.window.observe(torque);

        if self.window.elapsed(now, self.cycle_period) {
            if let Some(amplitude) = self.window.amplitude() {
                self.run_filter.push(amplitude);
                let filtered = self.run_filter.mean().unwrap_or(amplitude);
                let amp = if filtered <= 0.0 {
                    NO_SIGNAL_AMPLITUDE
                } else {
                    filtered
                };
                self.emit(
                    serde_json::json!({
                        "mode": "run",
                        "elapsed_s": elapsed,
                        "remaining_s": remaining,
                        "raw": self.loadcell.raw(),
                        "torque": torque,
                        "amp": amp,
                    })
                    .to_string(),
                );
            }
            self.window.reset(now);
        }

        if elapsed >= duration {
            info!("run finished after {elapsed} s");
            self.emit(serde_json::json!({"mode": "run", "status": "finished"}).to_string());
            self.bank.all_off();
            self.enter(OperatingMode::Idle, now);
        }
    }

    /// Periodic loop for the real instrument.
    pub fn run_loop(mut self, tick: Duration, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            self.tick(Instant::now());
            std::thread::sleep(tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingBus;
    use std::sync::mpsc;

    struct Fixture {
        controller: ModeController,
        tx: Sender<ModeCommand>,
        out_rx: Receiver<String>,
        snapshot: Arc<ModeSnapshot>,
        bank: Arc<ActuatorBank>,
        loadcell: Arc<LoadCellShared>,
        scale: Arc<TorqueScale>,
        t0: Instant,
    }

    fn fixture(run_duration_s: u32) -> Fixture {
        let (tx, rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let snapshot = Arc::new(ModeSnapshot::new(run_duration_s));
        let bank = Arc::new(ActuatorBank::new(Box::new(RecordingBus::default())));
        let loadcell = Arc::new(LoadCellShared::default());
        let scale = Arc::new(TorqueScale::new());
        let t0 = Instant::now();
        let controller = ModeController::new(
            rx,
            snapshot.clone(),
            bank.clone(),
            loadcell.clone(),
            scale.clone(),
            out_tx,
            Duration::from_millis(602),
            t0,
        );
        Fixture {
            controller,
            tx,
            out_rx,
            snapshot,
            bank,
            loadcell,
            scale,
            t0,
        }
    }

    fn lines(rx: &Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    #[test]
    fn starts_idle() {
        let f = fixture(60);
        assert_eq!(f.controller.mode(), OperatingMode::Idle);
        assert_eq!(f.snapshot.mode(), OperatingMode::Idle);
    }

    /// Enter Run and complete the warm-up so the timer arms at `now`.
    fn enter_run_warmed(f: &mut Fixture, now: Instant) {
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Run)))
            .unwrap();
        f.controller.tick(now);
        assert!(f.bank.take_warmup_request());
        f.bank.warmup_sequence(Duration::ZERO);
        f.controller.tick(now);
    }

    #[test]
    fn run_entry_requests_warmup_and_arms_timer() {
        let mut f = fixture(120);
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Run)))
            .unwrap();
        f.controller.tick(f.t0);
        assert_eq!(f.controller.mode(), OperatingMode::Run);
        assert!(f.bank.take_warmup_request());
        assert_eq!(f.snapshot.remaining_s(), 120);
        // Timer armed only once the sequence reports complete.
        f.controller.tick(f.t0 + Duration::from_secs(2));
        assert_eq!(f.snapshot.elapsed_s(), 0);
        f.bank.warmup_sequence(Duration::ZERO);
        f.controller.tick(f.t0 + Duration::from_secs(3));
        f.controller.tick(f.t0 + Duration::from_secs(4));
        assert_eq!(f.snapshot.elapsed_s(), 1);
        assert_eq!(f.snapshot.remaining_s(), 119);
    }

    #[test]
    fn run_timer_excludes_warmup_time() {
        let mut f = fixture(5);
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Run)))
            .unwrap();
        f.controller.tick(f.t0);
        // 3 s into the staggered sequence: no elapsed time, no telemetry,
        // no finish even though 3 of 5 configured seconds have passed.
        f.controller.tick(f.t0 + Duration::from_secs(3));
        assert_eq!(f.snapshot.elapsed_s(), 0);
        assert_eq!(f.snapshot.remaining_s(), 5);
        assert!(lines(&f.out_rx).is_empty());
        // Sequence completes at t+3; the full 5 s run counts from there.
        f.bank.warmup_sequence(Duration::ZERO);
        f.controller.tick(f.t0 + Duration::from_secs(3));
        f.controller.tick(f.t0 + Duration::from_secs(7));
        assert_eq!(f.controller.mode(), OperatingMode::Run);
        f.controller.tick(f.t0 + Duration::from_secs(8));
        assert_eq!(f.controller.mode(), OperatingMode::Idle);
    }

    #[test]
    fn repeated_run_request_is_idempotent() {
        let mut f = fixture(60);
        let t0 = f.t0;
        enter_run_warmed(&mut f, t0);
        // 10 s later a second `run` arrives: no new warm-up, timer intact.
        let later = f.t0 + Duration::from_secs(10);
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Run)))
            .unwrap();
        f.controller.tick(later);
        assert!(!f.bank.take_warmup_request());
        assert_eq!(f.snapshot.elapsed_s(), 10);
    }

    #[test]
    fn run_counts_down_and_finishes_once() {
        let mut f = fixture(5);
        let t0 = f.t0;
        enter_run_warmed(&mut f, t0);
        let mut remaining_seen = Vec::new();
        for s in 1..=7u64 {
            f.controller.tick(f.t0 + Duration::from_secs(s));
            remaining_seen.push(f.snapshot.remaining_s());
        }
        // Monotonic to zero...
        assert!(remaining_seen.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*remaining_seen.last().unwrap(), 0);
        // ...exactly one finished event, then Idle with actuators off.
        let finished: Vec<String> = lines(&f.out_rx)
            .into_iter()
            .filter(|l| l.contains("finished"))
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0],
            r#"{"mode":"run","status":"finished"}"#
        );
        assert_eq!(f.controller.mode(), OperatingMode::Idle);
        for i in 1..=4 {
            assert!(!f.bank.relay_state(i));
        }
    }

    #[test]
    fn run_telemetry_reports_last_raw_conversion() {
        let mut f = fixture(60);
        let t0 = f.t0;
        enter_run_warmed(&mut f, t0);
        f.scale.set_k_t(1.0);
        f.scale.set_adc_zero(0.0);
        // Raw and filtered diverge: raw goes out verbatim, torque uses the
        // filtered counts.
        f.loadcell.publish(123, 100);
        f.controller.tick(t0 + Duration::from_millis(10));
        f.controller.tick(t0 + Duration::from_millis(700));
        let out = lines(&f.out_rx);
        assert_eq!(out.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v["mode"], "run");
        assert_eq!(v["raw"], 123);
        assert!((v["torque"].as_f64().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn idle_window_emits_amplitude_with_tare() {
        let mut f = fixture(60);
        f.scale.set_k_t(1.0);
        f.scale.set_adc_zero(0.0);
        // Two ticks inside the window with different torques, then elapse.
        f.loadcell.publish(10, 10);
        f.controller.tick(f.t0 + Duration::from_millis(10));
        f.loadcell.publish(-10, -10);
        f.controller.tick(f.t0 + Duration::from_millis(20));
        f.controller.tick(f.t0 + Duration::from_millis(700));
        let out = lines(&f.out_rx);
        assert_eq!(out.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v["mode"], "idle");
        // amplitude (10 - (-10))/2 = 10
        assert!((v["amp"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert!((v["offset_amp"].as_f64().unwrap() - 10.0).abs() < 1e-9);

        // Tare captures the filter mean; subsequent windows subtract it.
        f.tx.send(ModeCommand::Tare).unwrap();
        f.loadcell.publish(10, 10);
        f.controller.tick(f.t0 + Duration::from_millis(710));
        f.loadcell.publish(-10, -10);
        f.controller.tick(f.t0 + Duration::from_millis(720));
        f.controller.tick(f.t0 + Duration::from_millis(1400));
        let out = lines(&f.out_rx);
        assert_eq!(out.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert!((v["offset_amp"].as_f64().unwrap() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn flat_idle_signal_emits_no_signal_sentinel() {
        let mut f = fixture(60);
        // k_t unset: torque constant 0 -> amplitude 0 -> sentinel 1.0.
        f.loadcell.publish(1000, 1000);
        f.controller.tick(f.t0 + Duration::from_millis(10));
        f.controller.tick(f.t0 + Duration::from_millis(700));
        let out = lines(&f.out_rx);
        assert_eq!(out.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(v["amp"].as_f64().unwrap(), 1.0);
    }

    #[test]
    fn calib_mode_is_quiet_and_actuators_off() {
        let mut f = fixture(60);
        f.bank.set_relay(3, true);
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Calib)))
            .unwrap();
        f.controller.tick(f.t0);
        assert!(!f.bank.relay_state(3));
        // A full window elapses with signal present: still nothing emitted.
        f.loadcell.publish(500, 500);
        for ms in [100u64, 300, 700, 1400] {
            f.controller.tick(f.t0 + Duration::from_millis(ms));
        }
        assert!(lines(&f.out_rx).is_empty());
    }

    #[test]
    fn stop_from_run_forces_actuators_off() {
        let mut f = fixture(60);
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Run)))
            .unwrap();
        f.controller.tick(f.t0);
        // Simulate the supervisor having energized the relays.
        for i in 1..=4 {
            f.bank.set_relay(i, true);
        }
        f.tx.send(ModeCommand::Request(ModeRequest::Stop)).unwrap();
        f.controller.tick(f.t0 + Duration::from_secs(1));
        assert_eq!(f.controller.mode(), OperatingMode::Idle);
        for i in 1..=4 {
            assert!(!f.bank.relay_state(i));
        }
        assert_eq!(f.snapshot.remaining_s(), 0);
    }

    #[test]
    fn set_run_time_applies_to_next_run() {
        let mut f = fixture(60);
        f.tx.send(ModeCommand::SetRunTime(5)).unwrap();
        f.controller.tick(f.t0);
        f.tx.send(ModeCommand::Request(ModeRequest::Enter(OperatingMode::Run)))
            .unwrap();
        f.controller.tick(f.t0 + Duration::from_millis(10));
        assert_eq!(f.snapshot.run_duration_s(), 5);
        assert_eq!(f.snapshot.remaining_s(), 5);
    }
}
