//! Random delay between run submissions.
//!
//! Spreading submissions out keeps concurrent runs from hitting shared
//! backends at the same instant.

use std::time::Duration;

use rand::Rng;

/// Delay range in milliseconds, `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min_ms: u64,
    max_ms: u64,
}

impl Jitter {
    /// Creates a jitter range. A `max` below `min` is raised to `min`.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
        }
    }

    /// No delay at all.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// Draws a delay uniformly from the range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min_ms >= self.max_ms {
            return self.min();
        }
        Duration::from_millis(rng.gen_range(self.min_ms..self.max_ms))
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new(500, 2000)
    }
}
