//! Task wiring: builds the shared state, restores persisted calibration
//! and spawns the periodic contexts.
//!
//! Contexts, in creation order: thermal sampling, actuator supervisor,
//! load-cell feed, calibration task, command processor, mode controller —
//! plus the single serial writer owned by the caller. No priority
//! relationship exists beyond creation order.

use crate::actuator::{self, ActuatorBank};
use crate::calibration::{run_calibration_task, CalibStatus, CalibrationEngine};
use crate::command::CommandProcessor;
use crate::loadcell::{LoadCellFeed, LoadCellShared};
use crate::mode::{ModeController, ModeSnapshot};
use crate::signal::TorqueScale;
use crate::store::CalibrationStore;
use crate::thermal::{ThermalLoop, ThermalShared};
use mdr_common::hal::{CalibrationMemory, OutputBus, RtdReader, TorqueAdc};
use mdr_common::ControllerConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};
use tracing::info;

/// Hardware collaborators handed to the runtime.
pub struct Rig {
    pub adc: Box<dyn TorqueAdc>,
    pub rtd: Box<dyn RtdReader>,
    pub bus: Box<dyn OutputBus>,
    pub memory: Box<dyn CalibrationMemory>,
}

/// Running controller; dropping it does not stop the tasks — call
/// [`stop`](Self::stop).
pub struct Controller {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Shared shutdown flag. External contexts (the serial reader, signal
    /// handlers) set it so the writer drain loop and [`stop`](Self::stop)
    /// can complete.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Signal every task and join them.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Build shared state, restore calibration and spawn all tasks.
///
/// `lines` feeds command frames in; every output line (reply, telemetry,
/// calibration completion) is sent to `out`, whose consumer is the single
/// serial writer.
pub fn spawn(config: &ControllerConfig, rig: Rig, lines: Receiver<String>, out: Sender<String>) -> std::io::Result<Controller> {
    let shutdown = Arc::new(AtomicBool::new(false));

    let bank = Arc::new(ActuatorBank::new(rig.bus));
    let thermal = Arc::new(ThermalShared::new(config.default_setpoint));
    let loadcell = Arc::new(LoadCellShared::default());
    let scale = Arc::new(TorqueScale::new());
    let snapshot = Arc::new(ModeSnapshot::new(config.default_run_duration_s));
    let calib_status = Arc::new(CalibStatus::default());
    let store = Arc::new(Mutex::new(CalibrationStore::new(rig.memory)));

    restore_calibration(&store, &thermal, &scale);

    let (mode_tx, mode_rx) = std::sync::mpsc::channel();
    let (calib_tx, calib_rx) = std::sync::mpsc::channel();

    let engine = CalibrationEngine::new(
        loadcell.clone(),
        bank.clone(),
        scale.clone(),
        thermal.clone(),
        Duration::from_millis(config.calib_sample_interval_ms),
        Duration::from_secs(config.calib_window_s),
        Duration::from_millis(config.warmup_stagger_ms),
    );

    let mut handles = Vec::new();

    {
        let thermal_loop = ThermalLoop::new(rig.rtd, thermal.clone(), bank.clone());
        let period = Duration::from_millis(config.thermal_ms);
        let shutdown = shutdown.clone();
        handles.push(
            Builder::new()
                .name("thermal".into())
                .spawn(move || thermal_loop.run(period, shutdown))?,
        );
    }
    {
        let bank = bank.clone();
        let period = Duration::from_millis(config.supervisor_ms);
        let stagger = Duration::from_millis(config.warmup_stagger_ms);
        let shutdown = shutdown.clone();
        handles.push(
            Builder::new()
                .name("supervisor".into())
                .spawn(move || actuator::run_supervisor(bank, period, stagger, shutdown))?,
        );
    }
    {
        let feed = LoadCellFeed::new(rig.adc, loadcell.clone());
        let period = Duration::from_millis(config.loadcell_ms);
        let shutdown = shutdown.clone();
        handles.push(
            Builder::new()
                .name("loadcell".into())
                .spawn(move || feed.run(period, shutdown))?,
        );
    }
    {
        let engine = engine.clone();
        let store = store.clone();
        let status = calib_status.clone();
        let out = out.clone();
        let shutdown = shutdown.clone();
        handles.push(Builder::new().name("calibration".into()).spawn(move || {
            run_calibration_task(engine, store, status, calib_rx, out, shutdown)
        })?);
    }
    {
        let processor = CommandProcessor::new(
            mode_tx,
            snapshot.clone(),
            calib_tx,
            calib_status,
            engine,
            thermal,
            store,
            bank.clone(),
        );
        let out = out.clone();
        let poll = Duration::from_millis(config.command_poll_ms);
        let shutdown = shutdown.clone();
        handles.push(
            Builder::new()
                .name("command".into())
                .spawn(move || processor.run(lines, out, poll, shutdown))?,
        );
    }
    {
        let controller = ModeController::new(
            mode_rx,
            snapshot,
            bank,
            loadcell,
            scale,
            out,
            config.cycle_period(),
            Instant::now(),
        );
        let tick = Duration::from_millis(config.tick_ms);
        let shutdown = shutdown.clone();
        handles.push(
            Builder::new()
                .name("mode".into())
                .spawn(move || controller.run_loop(tick, shutdown))?,
        );
    }

    info!("controller tasks spawned");
    Ok(Controller { shutdown, handles })
}

/// Apply the persisted record, when present and valid, to the live state.
/// Zero setpoints are skipped so a record that never saw a `set_temp`
/// cannot silence the thermostat.
fn restore_calibration(
    store: &Mutex<CalibrationStore>,
    thermal: &ThermalShared,
    scale: &TorqueScale,
) {
    let Some(record) = store.lock().load() else {
        info!("no persisted calibration, using defaults");
        return;
    };
    thermal.set_offsets(record.rtd_offset);
    if record.rtd_setpoint.iter().all(|&s| s > 0.0) {
        thermal.set_setpoints(record.rtd_setpoint);
    }
    scale.set_adc_zero(record.mdr_adc_zero as f64);
    scale.set_k_t(record.mdr_k_t as f64);
    info!(
        "calibration restored: adc_zero={}, k_t={}",
        record.mdr_adc_zero, record.mdr_k_t
    );
}
