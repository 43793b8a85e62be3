use tracing::warn;

/// Decision returned by the retry policy after a failed probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again (includes the 1-based number of the attempt that just failed).
    Retry { attempt: u32 },
    /// Attempts exhausted for this iteration; skip to the next one.
    GiveUp,
}

/// Retry policy for transient probe failures.
///
/// Tracks failed attempts within one loop iteration. Transient failures
/// stay inside the worker: they are retried here and never escalate to
/// the supervisor.
pub struct RetryPolicy {
    max_attempts: u32,
    failed_attempts: u32,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; 0 behaves like 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failed_attempts: 0,
        }
    }

    /// Record a failed attempt and decide what to do next.
    pub fn on_failure(&mut self, error: &str) -> RetryDecision {
        self.failed_attempts += 1;

        if self.failed_attempts < self.max_attempts {
            warn!(
                error,
                attempt = self.failed_attempts,
                max_attempts = self.max_attempts,
                "probe failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.failed_attempts,
            }
        } else {
            warn!(
                error,
                max_attempts = self.max_attempts,
                "probe attempts exhausted, skipping iteration"
            );
            RetryDecision::GiveUp
        }
    }

    /// Reset the counter for a new iteration.
    pub fn reset(&mut self) {
        self.failed_attempts = 0;
    }

    /// Failed attempts so far in this iteration.
    #[allow(dead_code)]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}
