//! Execution unit: runs the operation once and produces a [`RunResult`].
//!
//! The unit never fails. Whatever happens inside the operation, including
//! returned errors and panics, ends up as a [`Outcome::Fail`] with the cause
//! attached, so every submitted run occupies exactly one slot in the batch.
//!
//! # Flow
//!
//! ```text
//!   RunRequest
//!       │
//!       ▼
//!   on_attempt_start hooks ──► Operation::run(attempt, buffer)
//!                                       │
//!                     Ok(report) / Err / panic ──► failures
//!                                       │
//!   on_attempt_finish hooks ◄───────────┘
//!       │
//!       ├── failed and RetryRule allows ──► next attempt (at most one)
//!       ▼
//!   RunResult { outcome, captured_output, duration, attempts }
//! ```

pub mod retry;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info};

use crate::operation::{Attempt, Failure, Operation, OperationReport, OutputBuffer};
use crate::report::{RunHooks, format_elapsed};

pub use retry::RetryRule;

/// One scheduled run of the operation.
#[derive(Clone)]
pub struct RunRequest {
    pub operation: Arc<dyn Operation>,
    pub run_index: usize,
    pub retry_enabled: bool,
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("operation", &self.operation.name())
            .field("run_index", &self.run_index)
            .field("retry_enabled", &self.retry_enabled)
            .finish()
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail { causes: Vec<Failure> },
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }

    /// Failure causes; empty for a pass.
    pub fn causes(&self) -> &[Failure] {
        match self {
            Outcome::Pass => &[],
            Outcome::Fail { causes } => causes,
        }
    }
}

/// Result of one run, retries included.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub operation_name: String,
    pub run_index: usize,
    pub outcome: Outcome,
    /// Everything the run printed, attempts and reporter messages included.
    pub captured_output: Vec<u8>,
    pub duration: Duration,
    /// Number of attempts made: 1, or 2 when the retry was used.
    pub attempts: u32,
    /// Failed first and passed on the retry.
    pub flaky: bool,
}

impl RunResult {
    pub fn is_pass(&self) -> bool {
        self.outcome.is_pass()
    }

    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

/// Runs a single [`RunRequest`] to completion.
pub struct ExecutionUnit {
    hooks: RunHooks,
}

impl ExecutionUnit {
    /// Creates a unit that invokes the given per-run reporter hooks.
    pub fn new(hooks: RunHooks) -> Self {
        Self { hooks }
    }

    /// Executes the request, retrying once if enabled and the first attempt failed.
    pub async fn execute(&self, request: RunRequest) -> RunResult {
        let start = Instant::now();
        let name = request.operation.name().to_string();
        let mut out = OutputBuffer::new();
        let mut retry = RetryRule::for_run(request.retry_enabled);

        info!("STARTING Test {} (run {})", name, request.run_index);

        let causes = loop {
            let attempt = Attempt {
                run_index: request.run_index,
                number: retry.attempts() + 1,
            };

            self.hooks.attempt_start(&request, &attempt, &mut out).await;
            let failures = match invoke(request.operation.as_ref(), &attempt, &mut out).await {
                Ok(report) => report.into_failures(),
                Err(failure) => vec![failure],
            };
            retry.record_attempt(failures.is_empty());
            self.hooks
                .attempt_finish(&request, &attempt, &failures, &mut out)
                .await;

            if failures.is_empty() || !retry.should_retry() {
                break failures;
            }

            info!(
                "Retrying {} (run {}) after failed attempt {}",
                name, request.run_index, attempt.number
            );
            out.line(&format!(
                "[volley] {} run {} failed on attempt {}, retrying",
                name, request.run_index, attempt.number
            ));
        };

        let duration = start.elapsed();
        let outcome = if causes.is_empty() {
            Outcome::Pass
        } else {
            Outcome::Fail { causes }
        };

        info!(
            "FINISHED Test {} (run {}) in {}, result {}",
            name,
            request.run_index,
            format_elapsed(duration),
            if outcome.is_pass() { "SUCCEEDED" } else { "FAILED" }
        );

        RunResult {
            operation_name: name,
            run_index: request.run_index,
            outcome,
            captured_output: out.into_bytes(),
            duration,
            attempts: retry.attempts(),
            flaky: retry.is_flaky(),
        }
    }
}

/// Invokes the operation, turning escaped errors and panics into a failure.
async fn invoke(
    operation: &dyn Operation,
    attempt: &Attempt,
    out: &mut OutputBuffer,
) -> Result<OperationReport, Failure> {
    match AssertUnwindSafe(operation.run(attempt, out))
        .catch_unwind()
        .await
    {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(err)) => {
            error!(
                "UNEXPECTED FAILURE in {} (run {}): {:?}",
                operation.name(),
                attempt.run_index,
                err
            );
            Err(Failure::from_error(&err))
        }
        Err(payload) => {
            let failure = Failure::from_panic(payload.as_ref());
            error!(
                "UNEXPECTED FAILURE in {} (run {}): {}",
                operation.name(),
                attempt.run_index,
                failure.message
            );
            Err(failure)
        }
    }
}
