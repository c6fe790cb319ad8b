//! Load-cell feed: raw torque-channel ADC counts plus a 10-sample moving
//! average, published through single-word atomics.

use heapless::Deque;
use mdr_common::hal::TorqueAdc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Size of the moving-average window.
const FILTER_LEN: usize = 10;

/// Latest raw and filtered counts, readable from any task.
#[derive(Debug, Default)]
pub struct LoadCellShared {
    raw: AtomicI32,
    filtered: AtomicI32,
}

impl LoadCellShared {
    /// Last raw conversion.
    pub fn raw(&self) -> i32 {
        self.raw.load(Ordering::Relaxed)
    }

    /// Moving average over the last up-to-10 conversions.
    pub fn filtered(&self) -> i32 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Publish a pair of values (used by the feed; handy in tests).
    pub fn publish(&self, raw: i32, filtered: i32) {
        self.raw.store(raw, Ordering::Relaxed);
        self.filtered.store(filtered, Ordering::Relaxed);
    }
}

/// Periodic sampling task owning the ADC.
pub struct LoadCellFeed<A: TorqueAdc> {
    adc: A,
    shared: Arc<LoadCellShared>,
    window: Deque<i32, FILTER_LEN>,
    sum: i64,
}

impl<A: TorqueAdc> LoadCellFeed<A> {
    pub fn new(adc: A, shared: Arc<LoadCellShared>) -> Self {
        Self {
            adc,
            shared,
            window: Deque::new(),
            sum: 0,
        }
    }

    /// One sampling step: read, average, publish.
    pub fn step(&mut self) {
        let raw = match self.adc.read_raw() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("load-cell read failed: {e}");
                return;
            }
        };
        if self.window.is_full() {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old as i64;
            }
        }
        // Cannot fail: we just made room.
        let _ = self.window.push_back(raw);
        self.sum += raw as i64;
        let filtered = (self.sum / self.window.len() as i64) as i32;
        self.shared.publish(raw, filtered);
    }

    /// Sampling loop (~16 ms cadence).
    pub fn run(mut self, period: Duration, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            self.step();
            std::thread::sleep(period);
        }
    }
}
