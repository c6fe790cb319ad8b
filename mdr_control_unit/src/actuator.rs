//! Actuator bank: 4 power relays and 2 SSR heater drivers.
//!
//! States are mirrored in atomics so any task can read them without
//! touching the bus; the bus itself sits behind a mutex. Indices are
//! 1-based on the wire; an out-of-range index is a no-op and reads as off.
//!
//! The supervisory loop services warm-up requests (relay 1→2→3→4 with a
//! staggered delay) independently of the mode controller, which only flags
//! the request.

use mdr_common::hal::{OutputBus, OutputChannel};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Relay/SSR state holder plus the bus that drives them.
pub struct ActuatorBank {
    bus: Mutex<Box<dyn OutputBus>>,
    relays: [AtomicBool; 4],
    ssrs: [AtomicBool; 2],
    warmup_requested: AtomicBool,
    warmup_abort: AtomicBool,
    warmup_complete: AtomicBool,
}

impl ActuatorBank {
    /// Take ownership of the bus and force every output off.
    pub fn new(bus: Box<dyn OutputBus>) -> Self {
        let bank = Self {
            bus: Mutex::new(bus),
            relays: std::array::from_fn(|_| AtomicBool::new(false)),
            ssrs: std::array::from_fn(|_| AtomicBool::new(false)),
            warmup_requested: AtomicBool::new(false),
            warmup_abort: AtomicBool::new(false),
            warmup_complete: AtomicBool::new(false),
        };
        bank.all_off();
        bank
    }

    fn drive(&self, channel: OutputChannel, on: bool) {
        if let Err(e) = self.bus.lock().set_output(channel, on) {
            // Hardware failures are logged, not escalated.
            warn!("output drive failed ({channel:?}): {e}");
        }
    }

    /// Set relay `index` (1..=4). Out-of-range is a no-op.
    pub fn set_relay(&self, index: u8, on: bool) {
        let Some(state) = slot(&self.relays, index) else {
            return;
        };
        state.store(on, Ordering::Relaxed);
        self.drive(OutputChannel::Relay(index), on);
    }

    /// Relay state; out-of-range reads as off.
    pub fn relay_state(&self, index: u8) -> bool {
        slot(&self.relays, index)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Set SSR `index` (1..=2). Out-of-range is a no-op.
    pub fn set_ssr(&self, index: u8, on: bool) {
        let Some(state) = slot(&self.ssrs, index) else {
            return;
        };
        state.store(on, Ordering::Relaxed);
        self.drive(OutputChannel::Ssr(index), on);
    }

    /// SSR state; out-of-range reads as off.
    pub fn ssr_state(&self, index: u8) -> bool {
        slot(&self.ssrs, index)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Force all relays and SSRs off. Also withdraws any warm-up still
    /// pending or in flight, so a stop cannot be trailed by the tail of a
    /// staggered sequence re-energizing relays.
    pub fn all_off(&self) {
        self.warmup_requested.store(false, Ordering::Release);
        self.warmup_abort.store(true, Ordering::Release);
        self.warmup_complete.store(false, Ordering::Release);
        for i in 1..=4 {
            self.set_relay(i, false);
        }
        for i in 1..=2 {
            self.set_ssr(i, false);
        }
    }

    /// Flag a warm-up request for the supervisory loop.
    pub fn request_warmup(&self) {
        self.warmup_complete.store(false, Ordering::Release);
        self.warmup_requested.store(true, Ordering::Release);
    }

    /// Consume a pending warm-up request, if any.
    pub fn take_warmup_request(&self) -> bool {
        self.warmup_requested.swap(false, Ordering::AcqRel)
    }

    /// Whether the last requested warm-up sequence ran to completion.
    /// Cleared by a new request and by `all_off`.
    pub fn warmup_complete(&self) -> bool {
        self.warmup_complete.load(Ordering::Acquire)
    }

    /// Blocking warm-up: relays 1→2→3→4 on, `stagger` apart. Abandoned
    /// mid-sequence if `all_off` intervenes.
    pub fn warmup_sequence(&self, stagger: Duration) {
        debug!("relay warm-up sequence start");
        self.warmup_abort.store(false, Ordering::Release);
        for index in 1..=4u8 {
            if self.warmup_abort.load(Ordering::Acquire) {
                debug!("relay warm-up aborted at relay {index}");
                return;
            }
            self.set_relay(index, true);
            if index < 4 {
                std::thread::sleep(stagger);
            }
        }
        self.warmup_complete.store(true, Ordering::Release);
        debug!("relay warm-up sequence complete");
    }
}

/// 1-based lookup into a state array.
fn slot(states: &[AtomicBool], index: u8) -> Option<&AtomicBool> {
    (index as usize).checked_sub(1).and_then(|i| states.get(i))
}

/// Supervisory loop. Polls for warm-up requests at `period` and executes
/// the staggered sequence in this context, never in the requester's.
pub fn run_supervisor(
    bank: Arc<ActuatorBank>,
    period: Duration,
    stagger: Duration,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        if bank.take_warmup_request() {
            bank.warmup_sequence(stagger);
        }
        std::thread::sleep(period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingBus;
    use std::time::Duration;

    fn bank() -> (Arc<ActuatorBank>, RecordingBus) {
        let bus = RecordingBus::default();
        (
            Arc::new(ActuatorBank::new(Box::new(bus.clone()))),
            bus,
        )
    }

    #[test]
    fn set_and_get_by_index() {
        let (bank, _) = bank();
        bank.set_relay(2, true);
        assert!(bank.relay_state(2));
        assert!(!bank.relay_state(1));
        assert!(!bank.relay_state(3));
        assert!(!bank.relay_state(4));
    }

    #[test]
    fn out_of_range_index_is_noop() {
        let (bank, _) = bank();
        bank.set_relay(0, true);
        bank.set_relay(5, true);
        assert!(!bank.relay_state(0));
        assert!(!bank.relay_state(5));
        for i in 1..=4 {
            assert!(!bank.relay_state(i));
        }
    }

    #[test]
    fn all_off_clears_everything() {
        let (bank, _) = bank();
        bank.set_relay(1, true);
        bank.set_ssr(2, true);
        bank.all_off();
        assert!(!bank.relay_state(1));
        assert!(!bank.ssr_state(2));
    }

    #[test]
    fn warmup_sequence_reaches_all_relays() {
        let (bank, bus) = bank();
        bank.warmup_sequence(Duration::ZERO);
        for i in 1..=4 {
            assert!(bank.relay_state(i));
        }
        // The bus saw the relays energized in ascending order.
        let order: Vec<u8> = bus
            .events()
            .into_iter()
            .filter_map(|(ch, on)| match ch {
                OutputChannel::Relay(i) if on => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn warmup_request_is_consumed_once() {
        let (bank, _) = bank();
        assert!(!bank.take_warmup_request());
        bank.request_warmup();
        assert!(bank.take_warmup_request());
        assert!(!bank.take_warmup_request());
    }

    #[test]
    fn warmup_completion_is_signalled_and_cleared() {
        let (bank, _) = bank();
        assert!(!bank.warmup_complete());
        bank.warmup_sequence(Duration::ZERO);
        assert!(bank.warmup_complete());
        // A new request re-arms the signal; all-off withdraws it.
        bank.request_warmup();
        assert!(!bank.warmup_complete());
        bank.warmup_sequence(Duration::ZERO);
        bank.all_off();
        assert!(!bank.warmup_complete());
    }

    #[test]
    fn all_off_aborts_inflight_warmup() {
        let (bank, _) = bank();
        std::thread::scope(|s| {
            let b = bank.clone();
            s.spawn(move || b.warmup_sequence(Duration::from_millis(100)));
            // Wait for relay 1, then stop mid-stagger.
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !bank.relay_state(1) {
                assert!(std::time::Instant::now() < deadline, "sequence never started");
                std::thread::sleep(Duration::from_millis(1));
            }
            bank.all_off();
        });
        assert!(!bank.warmup_complete());
        assert!(!bank.relay_state(4));
    }
}
