//! Retry rule and flakiness detection for a single run.

/// Limits how many extra attempts a run may make and tracks their outcomes.
///
/// A run that failed and then passed on its extra attempt is flaky.
#[derive(Debug, Clone)]
pub struct RetryRule {
    max_extra_attempts: u32,
    attempts: u32,
    successes: u32,
}

impl RetryRule {
    /// Creates a rule allowing `max_extra_attempts` attempts after the first.
    pub fn new(max_extra_attempts: u32) -> Self {
        Self {
            max_extra_attempts,
            attempts: 0,
            successes: 0,
        }
    }

    /// The rule used by batches: one extra attempt when enabled, none otherwise.
    pub fn for_run(retry_enabled: bool) -> Self {
        Self::new(u32::from(retry_enabled))
    }

    /// Record the outcome of an attempt.
    pub fn record_attempt(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }

    /// Whether another attempt is allowed after the last recorded one failed.
    pub fn should_retry(&self) -> bool {
        self.attempts <= self.max_extra_attempts && self.successes < self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Check if the run is flaky (passed after an earlier failure).
    pub fn is_flaky(&self) -> bool {
        self.attempts > 1 && self.successes > 0 && self.successes < self.attempts
    }
}
