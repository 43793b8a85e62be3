//! Worker-side runtime cap, independent of the supervisor's countdown.
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Failsafe {
    started_at: Instant,
    max_runtime: Duration,
}

impl Failsafe {
    pub fn new(max_runtime: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            max_runtime,
        }
    }

    /// Restart the clock from now (supervisor refreshed the session).
    pub fn reset(&mut self) {
        self.started_at = Instant::now();
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.max_runtime
    }

    pub fn expired(&self) -> bool {
        self.started_at.elapsed() > self.max_runtime
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }
}
