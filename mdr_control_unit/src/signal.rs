//! Torque-signal conditioning: cycle-window min/max tracking, the bounded
//! amplitude filter and the raw-counts → torque scale.

use heapless::Deque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Guard below which a computed amplitude is considered zero.
pub const AMPLITUDE_EPSILON: f64 = 1e-6;

/// Min/max tracker over one oscillation cycle.
///
/// Bounds start at ±∞ so an empty window can never report a false
/// amplitude.
#[derive(Debug, Clone, Copy)]
pub struct CycleWindow {
    started_at: Instant,
    min: f64,
    max: f64,
}

impl CycleWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Track one sample.
    pub fn observe(&mut self, sample: f64) {
        if sample < self.min {
            self.min = sample;
        }
        if sample > self.max {
            self.max = sample;
        }
    }

    /// Whether the window period has elapsed.
    pub fn elapsed(&self, now: Instant, period: Duration) -> bool {
        now.duration_since(self.started_at) >= period
    }

    /// Peak-to-peak half-amplitude, or `None` if nothing was observed.
    pub fn amplitude(&self) -> Option<f64> {
        if self.min <= self.max {
            Some((self.max - self.min) / 2.0)
        } else {
            None
        }
    }

    /// Start a fresh window at `now`.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}

/// Bounded circular buffer of amplitude samples; outputs the arithmetic
/// mean. `N` is 5 in Run mode and 2 in Idle mode.
#[derive(Debug)]
pub struct AmplitudeFilter<const N: usize> {
    window: Deque<f64, N>,
}

impl<const N: usize> AmplitudeFilter<N> {
    pub const fn new() -> Self {
        Self {
            window: Deque::new(),
        }
    }

    /// Push one amplitude sample, evicting the oldest when full.
    pub fn push(&mut self, amplitude: f64) {
        if self.window.is_full() {
            self.window.pop_front();
        }
        let _ = self.window.push_back(amplitude);
    }

    /// Mean of the buffered samples, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

impl<const N: usize> Default for AmplitudeFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear torque calibration: `torque = (raw − adc_zero) · k_t`.
///
/// Both constants are f64 bit patterns in atomics; the calibration task
/// writes them, the mode controller and command processor read them.
#[derive(Debug)]
pub struct TorqueScale {
    adc_zero: AtomicU64,
    k_t: AtomicU64,
}

impl TorqueScale {
    pub fn new() -> Self {
        Self {
            adc_zero: AtomicU64::new(0.0f64.to_bits()),
            k_t: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub fn adc_zero(&self) -> f64 {
        f64::from_bits(self.adc_zero.load(Ordering::Relaxed))
    }

    pub fn set_adc_zero(&self, zero: f64) {
        self.adc_zero.store(zero.to_bits(), Ordering::Relaxed);
    }

    pub fn k_t(&self) -> f64 {
        f64::from_bits(self.k_t.load(Ordering::Relaxed))
    }

    pub fn set_k_t(&self, k_t: f64) {
        self.k_t.store(k_t.to_bits(), Ordering::Relaxed);
    }

    /// Convert raw counts to torque; 0 while `k_t` is unset (≤ 0).
    pub fn torque(&self, raw: i32) -> f64 {
        let k_t = self.k_t();
        if k_t <= 0.0 {
            return 0.0;
        }
        (raw as f64 - self.adc_zero()) * k_t
    }
}

impl Default for TorqueScale {
    fn default() -> Self {
        Self::new()
    }
}
