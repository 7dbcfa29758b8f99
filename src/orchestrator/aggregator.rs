//! Collects run results from concurrent workers.

use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::executor::RunResult;

/// Progress after a result was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Results collected so far, this one included.
    pub count: usize,
    /// Whether every expected result has now arrived.
    pub complete: bool,
}

#[derive(Default)]
struct Slots {
    results: Vec<RunResult>,
    sealed: bool,
    late: usize,
}

/// Thread-safe collection of run results for one batch.
///
/// Once [`seal`](Self::seal)ed, further results are dropped: a run that
/// finishes after the batch timed out never shows up in the batch result.
pub struct ResultAggregator {
    quantity: usize,
    slots: Mutex<Slots>,
}

impl ResultAggregator {
    pub fn new(quantity: usize) -> Self {
        Self {
            quantity,
            slots: Mutex::new(Slots {
                results: Vec::with_capacity(quantity),
                ..Slots::default()
            }),
        }
    }

    /// Records a result. Returns `None` if the aggregator is already sealed.
    pub fn record(&self, result: RunResult) -> Option<Progress> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.sealed {
            slots.late += 1;
            warn!(
                "Dropping result of run {} that finished after the batch ended",
                result.run_index
            );
            return None;
        }
        slots.results.push(result);
        let count = slots.results.len();
        Some(Progress {
            count,
            complete: count >= self.quantity,
        })
    }

    /// Stops accepting results and returns the ones collected so far.
    pub fn seal(&self) -> Vec<RunResult> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.sealed = true;
        std::mem::take(&mut slots.results)
    }

    pub fn count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .len()
    }

    pub fn quantity(&self) -> usize {
        self.quantity
    }

    /// Number of results dropped because they arrived after the seal.
    pub fn late_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).late
    }
}
