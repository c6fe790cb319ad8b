//! Line-oriented command protocol.
//!
//! One newline-terminated frame in, exactly one reply line out. Frames are
//! flat JSON objects with a mandatory `"cmd"` field; unexpected extra
//! fields are tolerated and keys are case-sensitive. Replies are either an
//! `{ok, cmd, ...}` envelope or a bespoke payload — the asymmetry is part
//! of the protocol and preserved deliberately.
//!
//! Long calibration procedures are only started here; the calibration task
//! runs them and reports completion on its own line, so this loop never
//! blocks the serial channel.

use crate::actuator::ActuatorBank;
use crate::calibration::{CalibRequest, CalibStatus, CalibrationEngine};
use crate::mode::{ModeCommand, ModeSnapshot};
use crate::store::CalibrationStore;
use crate::thermal::ThermalShared;
use mdr_common::mode::ModeRequest;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default zero-offset window for `offset_mdr` [ms].
const DEFAULT_OFFSET_WINDOW_MS: f64 = 5000.0;

/// Command dispatcher. Holds handles to every component a command can
/// touch; owns no periodic state of its own.
pub struct CommandProcessor {
    mode_tx: Sender<ModeCommand>,
    snapshot: Arc<ModeSnapshot>,
    calib_tx: Sender<CalibRequest>,
    calib_status: Arc<CalibStatus>,
    engine: CalibrationEngine,
    thermal: Arc<ThermalShared>,
    store: Arc<Mutex<CalibrationStore>>,
    bank: Arc<ActuatorBank>,
}

impl CommandProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode_tx: Sender<ModeCommand>,
        snapshot: Arc<ModeSnapshot>,
        calib_tx: Sender<CalibRequest>,
        calib_status: Arc<CalibStatus>,
        engine: CalibrationEngine,
        thermal: Arc<ThermalShared>,
        store: Arc<Mutex<CalibrationStore>>,
        bank: Arc<ActuatorBank>,
    ) -> Self {
        Self {
            mode_tx,
            snapshot,
            calib_tx,
            calib_status,
            engine,
            thermal,
            store,
            bank,
        }
    }

    /// Process one frame; always produces exactly one reply line.
    pub fn process_line(&mut self, line: &str) -> String {
        let frame = line.trim_end_matches(['\r', '\n']);
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(frame) else {
            debug!("unparsable frame: {frame:?}");
            return error_reply("bad_json");
        };
        let Some(cmd) = obj.get("cmd").and_then(Value::as_str) else {
            return error_reply("bad_json");
        };
        match cmd {
            "rtd_calib" => self.rtd_calib(&obj),
            "set_temp" => self.set_temp(&obj),
            "set_temp_rtd" => self.set_temp_rtd(&obj),
            "get_temp" => self.get_temp(),
            "set_mode" => self.set_mode(&obj),
            "set_run_time" => self.set_run_time(&obj),
            "calibrate_mdr" => self.calibrate_mdr(&obj),
            "offset_mdr" => self.offset_mdr(&obj),
            "tare_idle_amp" => self.tare_idle_amp(),
            "set_relay" => self.set_relay(&obj),
            "get_relays" => self.get_relays(),
            "get_calib_status" => self.get_calib_status(),
            _ => error_reply("unknown_cmd"),
        }
    }

    fn rtd_calib(&mut self, obj: &Map<String, Value>) -> String {
        let Some(dev) = device_field(obj, "dev") else {
            return error_reply("invalid_device");
        };
        let Some(known) = num_field(obj, "known") else {
            return error_reply("bad_args");
        };
        self.engine
            .calibrate_temperature_channel(&mut self.store.lock(), dev, known as f32);
        ok_reply("rtd_calib")
    }

    fn set_temp(&mut self, obj: &Map<String, Value>) -> String {
        let Some(value) = num_field(obj, "value") else {
            return error_reply("bad_args");
        };
        self.thermal.set_setpoints([value as f32; 2]);
        self.persist_setpoints();
        ok_reply("set_temp")
    }

    fn set_temp_rtd(&mut self, obj: &Map<String, Value>) -> String {
        let Some(dev) = device_field(obj, "dev") else {
            return error_reply("invalid_device");
        };
        let Some(temp) = num_field(obj, "temp") else {
            return error_reply("bad_args");
        };
        self.thermal.set_setpoint(dev, temp as f32);
        self.persist_setpoints();
        serde_json::json!({"dev": dev, "temp": temp}).to_string()
    }

    fn persist_setpoints(&mut self) {
        if let Err(e) = self.store.lock().save_rtd_setpoints(self.thermal.setpoints()) {
            warn!("setpoint persist failed: {e}");
        }
    }

    fn get_temp(&self) -> String {
        serde_json::json!({
            "t1": round2(self.thermal.calibrated(1)),
            "t2": round2(self.thermal.calibrated(2)),
        })
        .to_string()
    }

    fn set_mode(&mut self, obj: &Map<String, Value>) -> String {
        let Some(value) = obj.get("value").and_then(Value::as_str) else {
            return error_reply("bad_args");
        };
        let Some(request) = ModeRequest::parse(value) else {
            return error_reply("bad_args");
        };
        let _ = self.mode_tx.send(ModeCommand::Request(request));
        match request {
            ModeRequest::Stop => {
                serde_json::json!({"mode": "stop", "status": "finished"}).to_string()
            }
            ModeRequest::Enter(_) => ok_reply("set_mode"),
        }
    }

    fn set_run_time(&mut self, obj: &Map<String, Value>) -> String {
        let seconds = num_field(obj, "seconds");
        match seconds {
            Some(s) if s > 0.0 => {
                let _ = self.mode_tx.send(ModeCommand::SetRunTime(s as u32));
                ok_reply("set_run_time")
            }
            _ => error_reply("bad_args"),
        }
    }

    fn calibrate_mdr(&mut self, obj: &Map<String, Value>) -> String {
        let (weight, lever_arm) = match (num_field(obj, "weight"), num_field(obj, "lever")) {
            (Some(w), Some(l)) if w > 0.0 && l > 0.0 => (w, l),
            _ => return error_reply("bad_args"),
        };
        if !self.calib_status.try_claim() {
            return error_reply("calib_busy");
        }
        let _ = self
            .calib_tx
            .send(CalibRequest::TorqueChannel { weight, lever_arm });
        serde_json::json!({"ok": true, "cmd": "calibrate_mdr", "status": "started"}).to_string()
    }

    fn offset_mdr(&mut self, obj: &Map<String, Value>) -> String {
        let ms = match obj.get("ms") {
            None => DEFAULT_OFFSET_WINDOW_MS,
            Some(_) => match num_field(obj, "ms") {
                Some(ms) if ms > 0.0 => ms,
                _ => return error_reply("bad_args"),
            },
        };
        if !self.calib_status.try_claim() {
            return error_reply("calib_busy");
        }
        let _ = self.calib_tx.send(CalibRequest::ZeroOffset {
            duration: Duration::from_millis(ms as u64),
        });
        serde_json::json!({"ok": true, "cmd": "offset_mdr", "status": "started"}).to_string()
    }

    fn tare_idle_amp(&mut self) -> String {
        let _ = self.mode_tx.send(ModeCommand::Tare);
        ok_reply("tare_idle_amp")
    }

    fn set_relay(&mut self, obj: &Map<String, Value>) -> String {
        let relay = num_field(obj, "relay");
        let state = num_field(obj, "state");
        let (relay, state) = match (relay, state) {
            (Some(r), Some(s))
                if (1.0..=4.0).contains(&r) && r.fract() == 0.0 && (s == 0.0 || s == 1.0) =>
            {
                (r as u8, s as u8)
            }
            _ => return error_reply("invalid_relay_or_state"),
        };
        self.bank.set_relay(relay, state == 1);
        serde_json::json!({"ok": true, "cmd": "set_relay", "relay": relay, "state": state})
            .to_string()
    }

    fn get_relays(&self) -> String {
        serde_json::json!({
            "ok": true,
            "cmd": "get_relays",
            "relay1": self.bank.relay_state(1) as u8,
            "relay2": self.bank.relay_state(2) as u8,
            "relay3": self.bank.relay_state(3) as u8,
            "relay4": self.bank.relay_state(4) as u8,
        })
        .to_string()
    }

    fn get_calib_status(&self) -> String {
        let phase = self.calib_status.phase();
        serde_json::json!({
            "ok": true,
            "cmd": "get_calib_status",
            "state": phase.as_str(),
            "busy": self.calib_status.busy() as u8,
            "mode": self.snapshot.mode().as_str(),
        })
        .to_string()
    }

    /// Poll loop: one line in, one reply out through the single writer.
    pub fn run(
        mut self,
        lines: Receiver<String>,
        out: Sender<String>,
        poll: Duration,
        shutdown: Arc<AtomicBool>,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            match lines.recv_timeout(poll) {
                Ok(line) => {
                    let reply = self.process_line(&line);
                    if out.send(reply).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

fn ok_reply(cmd: &str) -> String {
    serde_json::json!({"ok": true, "cmd": cmd}).to_string()
}

fn error_reply(tag: &str) -> String {
    serde_json::json!({"ok": false, "err": tag}).to_string()
}

/// Numeric field: JSON number, or a string holding one.
fn num_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// RTD device field: must be exactly 1 or 2.
fn device_field(obj: &Map<String, Value>, key: &str) -> Option<u8> {
    match num_field(obj, key)? {
        v if v == 1.0 => Some(1),
        v if v == 2.0 => Some(2),
        _ => None,
    }
}

fn round2(value: f32) -> f64 {
    (value as f64 * 100.0).round() / 100.0
}
