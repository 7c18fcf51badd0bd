use std::time::{Duration, Instant};

/// Events per second since the start of a run
///
/// Elapsed time is taken from the monotonic clock with millisecond
/// resolution and clamped to at least one millisecond.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    started: Instant,
    events: u64,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(started: Instant) -> Self {
        Self { started, events: 0 }
    }

    /// Count one event and return the updated rate.
    pub fn record(&mut self) -> f64 {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> f64 {
        self.events += 1;
        self.rate_at(now)
    }

    pub fn rate_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        Self::rate(self.events, elapsed)
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `events / (elapsed_ms * 1e-3)` with `elapsed_ms >= 1`.
    pub fn rate(events: u64, elapsed: Duration) -> f64 {
        let elapsed_ms = elapsed.as_millis().max(1);
        events as f64 / (elapsed_ms as f64 * 1e-3)
    }
}
