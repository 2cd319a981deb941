//! Interval gate that turns a continuous frame stream into sparse snapshots.

use std::time::{Duration, Instant};

/// Returns true when at least `interval` has passed since `last_fire`.
pub fn is_due(now: Instant, last_fire: Instant, interval: Duration) -> bool {
    now.saturating_duration_since(last_fire) >= interval
}

/// Fixed-delay sampling gate on the monotonic clock.
///
/// Seeded at creation, so the first snapshot comes one full interval after
/// the worker starts. The reference instant only moves when the gate fires.
#[derive(Clone, Debug)]
pub struct SamplingGate {
    interval: Duration,
    last_fire: Instant,
    fired: u64,
}

impl SamplingGate {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Duration, seed: Instant) -> Self {
        Self {
            interval,
            last_fire: seed,
            fired: 0,
        }
    }

    /// Consult the gate at `now`; advances the reference instant on fire.
    pub fn poll(&mut self, now: Instant) -> bool {
        if !is_due(now, self.last_fire, self.interval) {
            return false;
        }
        self.last_fire = now;
        self.fired += 1;
        true
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_fire(&self) -> Instant {
        self.last_fire
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }
}
