//! # MDR Control Unit
//!
//! Runtime coordination layer for a laboratory torque/rheometer instrument:
//! heated RTD zones, a load-cell torque channel, relay/SSR actuation and a
//! line-oriented serial command protocol, coordinated by an operating-mode
//! state machine and backed by a persisted calibration record.
//!
//! ## Ownership model
//!
//! Shared state is either owned by a single actor or synchronized
//! explicitly; no bare globals:
//!
//! 1. **ModeController** — sole owner of the operating mode, run timer,
//!    cycle windows and tare offset. Commands arrive on an mpsc channel and
//!    are observed on the next tick; an atomic snapshot is exported
//!    read-only.
//! 2. **Calibration task** — sole owner of long calibration procedures;
//!    the command channel stays responsive while one is in flight.
//! 3. **Single writer** — every serial output line (reply, telemetry,
//!    calibration completion) funnels through one writer task, so lines
//!    never interleave.
//!
//! Scalar shares (temperatures, load-cell counts, torque scale, actuator
//! states) are single-word atomics.

pub mod actuator;
pub mod calibration;
pub mod command;
pub mod loadcell;
pub mod mode;
pub mod runtime;
pub mod signal;
pub mod sim;
pub mod store;
pub mod thermal;
