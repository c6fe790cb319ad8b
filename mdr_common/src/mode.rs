//! Operating mode of the instrument.
//!
//! `Idle`, `Run` and `Calib` are the persistent states of the mode
//! controller. The serial protocol additionally accepts `powerup` (maps to
//! Idle, the power-on state) and `stop` (a transient request that forces
//! Idle), neither of which is a state of its own.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persistent operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Quiescent monitoring: actuators off, idle-amplitude telemetry.
    Idle,
    /// Timed test run: actuators sequenced on, run-timer active.
    Run,
    /// Calibration procedures expected: actuators off, telemetry quiet.
    Calib,
}

impl OperatingMode {
    /// Wire name used in telemetry lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Idle => "idle",
            OperatingMode::Run => "run",
            OperatingMode::Calib => "calib",
        }
    }

    /// Numeric encoding for the atomic snapshot.
    pub const fn as_u8(self) -> u8 {
        match self {
            OperatingMode::Idle => 0,
            OperatingMode::Run => 1,
            OperatingMode::Calib => 2,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8); unknown values read as Idle.
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => OperatingMode::Run,
            2 => OperatingMode::Calib,
            _ => OperatingMode::Idle,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mode request as it appears on the wire (`set_mode` value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    /// Enter a persistent mode.
    Enter(OperatingMode),
    /// Transient stop: force Idle, emit a finished status.
    Stop,
}

impl ModeRequest {
    /// Parse a `set_mode` value string. Case-sensitive, like the rest of
    /// the protocol keys.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "powerup" | "idle" => Some(ModeRequest::Enter(OperatingMode::Idle)),
            "run" => Some(ModeRequest::Enter(OperatingMode::Run)),
            "calib" => Some(ModeRequest::Enter(OperatingMode::Calib)),
            "stop" => Some(ModeRequest::Stop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_round_trip() {
        for mode in [OperatingMode::Idle, OperatingMode::Run, OperatingMode::Calib] {
            assert_eq!(OperatingMode::from_u8(mode.as_u8()), mode);
        }
    }

    #[test]
    fn parse_wire_values() {
        assert_eq!(
            ModeRequest::parse("powerup"),
            Some(ModeRequest::Enter(OperatingMode::Idle))
        );
        assert_eq!(
            ModeRequest::parse("run"),
            Some(ModeRequest::Enter(OperatingMode::Run))
        );
        assert_eq!(ModeRequest::parse("stop"), Some(ModeRequest::Stop));
        assert_eq!(ModeRequest::parse("RUN"), None);
        assert_eq!(ModeRequest::parse(""), None);
    }
}
