//! Batch execution engine.
//!
//! The [`Scheduler`] runs one operation `quantity` times with at most
//! `parallelism` runs in flight, collects every run's result and drives the
//! batch-level reporter hooks around the whole thing.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler::run_batch(BatchConfig)
//!       │
//!       │ ReporterSet::activate() ──► initialize + on_batch_start
//!       ▼
//!   submission loop ── jitter ──► WorkerPool (parallelism workers)
//!       │                              │
//!       │                        ExecutionUnit::execute
//!       │                              │
//!       │                              ▼ completion path (on the worker)
//!       │                  ResultAggregator::record
//!       │                  OutputMux::write_block
//!       │                  on_run_complete
//!       │                  PoolShutdown::shutdown (when complete)
//!       ▼
//!   await_termination(deadline) ──► seal ──► on_batch_finish
//!       │
//!       ▼
//!   close_all (every exit path) ──► BatchResult
//! ```
//!
//! # Batch States
//!
//! `Idle → Initializing → Running → {Completed | TimedOut} → Finalized`.
//! Reporters are closed on entry to `Finalized`, whatever state came before.
//!
//! # Example
//!
//! ```no_run
//! use volley::config::load_config;
//! use volley::operation;
//! use volley::orchestrator::Scheduler;
//! use volley::report::{ConsoleReporter, ReporterSet};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("volley.toml"))?;
//!     config.validate()?;
//!
//!     let reporters = ReporterSet::new().with_reporter(ConsoleReporter::new(true, false));
//!     let batch = config.batch_config(operation::from_config(&config.operation));
//!
//!     let result = Scheduler::new(reporters).run_batch(batch).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod aggregator;
pub mod jitter;
pub mod output;
pub mod pool;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{ExecutionUnit, RunRequest, RunResult};
use crate::operation::Operation;
use crate::report::{ActiveReporters, BatchStart, ReporterSet, format_elapsed};

pub use aggregator::{Progress, ResultAggregator};
pub use jitter::Jitter;
pub use output::OutputMux;
pub use pool::{PoolShutdown, WorkerPool};

/// Longest deadline a batch is scheduled with; larger timeouts are capped.
const MAX_BATCH_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Settings of one batch. Immutable once the batch starts.
#[derive(Clone)]
pub struct BatchConfig {
    pub operation: Arc<dyn Operation>,
    pub quantity: usize,
    pub parallelism: usize,
    /// Deadline for the whole batch, measured from pool creation.
    pub timeout: Duration,
    pub retry_enabled: bool,
    pub jitter: Jitter,
}

impl BatchConfig {
    /// One run at a time, a 60 minute timeout, no retry and the default jitter.
    pub fn new(operation: Arc<dyn Operation>, quantity: usize) -> Self {
        Self {
            operation,
            quantity,
            parallelism: 1,
            timeout: Duration::from_secs(60 * 60),
            retry_enabled: false,
            jitter: Jitter::default(),
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry_enabled: bool) -> Self {
        self.retry_enabled = retry_enabled;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.quantity == 0 {
            bail!("quantity must be at least 1");
        }
        if self.parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        Ok(())
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("operation", &self.operation.name())
            .field("quantity", &self.quantity)
            .field("parallelism", &self.parallelism)
            .field("timeout", &self.timeout)
            .field("retry_enabled", &self.retry_enabled)
            .field("jitter", &self.jitter)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Initializing,
    Running,
    Completed,
    TimedOut,
    Finalized,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Idle => "idle",
            BatchState::Initializing => "initializing",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::TimedOut => "timed out",
            BatchState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Aggregated results of one batch.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every collected run passed |
/// | 1 | At least one run failed |
///
/// A timed-out batch whose collected runs all passed exits with 0; the
/// missing runs are reported through [`BatchResult::missing`].
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub operation_name: String,
    /// Number of runs the batch was asked to perform.
    pub quantity: usize,
    /// Collected runs in completion order.
    pub results: Vec<RunResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether the batch ended before every run was collected.
    pub timed_out: bool,
}

impl BatchResult {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.is_pass()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.is_pass()).count()
    }

    /// Runs that failed first and passed on the retry.
    pub fn flaky(&self) -> usize {
        self.results.iter().filter(|r| r.flaky).count()
    }

    /// Runs that were never collected.
    pub fn missing(&self) -> usize {
        self.quantity.saturating_sub(self.results.len())
    }

    /// `true` if every collected run passed.
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.is_pass())
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() == self.quantity
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Runs batches against a set of reporters.
pub struct Scheduler {
    reporters: ReporterSet,
    output: Arc<OutputMux>,
}

impl Scheduler {
    /// Creates a scheduler flushing run output to standard output.
    pub fn new(reporters: ReporterSet) -> Self {
        Self {
            reporters,
            output: Arc::new(OutputMux::stdout()),
        }
    }

    pub fn with_output(mut self, output: OutputMux) -> Self {
        self.output = Arc::new(output);
        self
    }

    /// Runs the batch to completion or until its timeout expires.
    ///
    /// Every enabled reporter is closed exactly once before this returns,
    /// including when the batch body panics; the panic is resumed afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid. Failed runs are not
    /// errors; they are part of the returned [`BatchResult`].
    pub async fn run_batch(&self, config: BatchConfig) -> anyhow::Result<BatchResult> {
        self.run_batch_with(config, Arc::new(PoolShutdown::new())).await
    }

    /// [`run_batch`](Self::run_batch) with a caller-provided pool shutdown signal.
    pub(crate) async fn run_batch_with(
        &self,
        config: BatchConfig,
        shutdown: Arc<PoolShutdown>,
    ) -> anyhow::Result<BatchResult> {
        config.validate()?;

        let reporters = self.reporters.activate();
        let outcome = AssertUnwindSafe(self.execute_batch(&config, &reporters, shutdown))
            .catch_unwind()
            .await;

        reporters.close_all().await;
        debug!("Batch state: {}", BatchState::Finalized);

        match outcome {
            Ok(result) => Ok(result),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    async fn execute_batch(
        &self,
        config: &BatchConfig,
        reporters: &ActiveReporters,
        shutdown: Arc<PoolShutdown>,
    ) -> BatchResult {
        let mut state = BatchState::Idle;
        let batch_id = Uuid::new_v4();
        let name = config.operation.name().to_string();
        let quantity = config.quantity;
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            "STARTING {}, running it {} times {} in parallel",
            name, quantity, config.parallelism
        );
        if !reporters.is_empty() {
            debug!("Active reporters: {}", reporters.names().join(", "));
        }

        transition(&mut state, BatchState::Initializing);
        reporters
            .start_batch(&BatchStart {
                batch_id,
                description: format!(
                    "Running {}, {} times, {} in parallel",
                    name, quantity, config.parallelism
                ),
                operation_name: name.clone(),
                quantity,
                parallelism: config.parallelism,
            })
            .await;

        transition(&mut state, BatchState::Running);
        let aggregator = Arc::new(ResultAggregator::new(quantity));
        let hooks = reporters.hooks();
        let unit = Arc::new(ExecutionUnit::new(hooks.clone()));
        let deadline = Instant::now() + config.timeout.min(MAX_BATCH_TIMEOUT);

        let pool = {
            let aggregator = Arc::clone(&aggregator);
            let shutdown = Arc::clone(&shutdown);
            let output = Arc::clone(&self.output);

            WorkerPool::spawn(config.parallelism, Arc::clone(&shutdown), move |request: RunRequest| {
                let aggregator = Arc::clone(&aggregator);
                let shutdown = Arc::clone(&shutdown);
                let output = Arc::clone(&output);
                let unit = Arc::clone(&unit);
                let hooks = hooks.clone();

                async move {
                    let result = unit.execute(request).await;

                    // Sealing waits for this scope, so a recorded run is
                    // always reported before the batch finishes.
                    let scope = hooks.enter().await;
                    let Some(progress) = aggregator.record(result.clone()) else {
                        return;
                    };
                    info!("Run {} finished of {}", progress.count, aggregator.quantity());

                    if let Err(e) = output.write_block(&result.captured_output) {
                        warn!("Failed to write output of run {}: {}", result.run_index, e);
                    }
                    scope.run_complete(&result).await;
                    drop(scope);

                    if progress.complete && shutdown.shutdown() {
                        debug!("All {} runs collected, shutting down the pool", progress.count);
                    }
                }
            })
        };

        for run_index in 0..quantity {
            let delay = config.jitter.sample(&mut rand::thread_rng());
            if Instant::now() + delay >= deadline {
                warn!(
                    "Batch deadline reached, {} of {} runs were not submitted",
                    quantity - run_index,
                    quantity
                );
                break;
            }
            tokio::time::sleep(delay).await;

            let submitted = pool.submit(RunRequest {
                operation: Arc::clone(&config.operation),
                run_index,
                retry_enabled: config.retry_enabled,
            });
            if !submitted {
                debug!("Pool stopped accepting runs at run {}", run_index);
                break;
            }
        }
        pool.close_queue();

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !pool.await_termination(remaining).await {
            shutdown.shutdown();
        }

        let results = reporters.close_runs(|| aggregator.seal()).await;
        let timed_out = results.len() < quantity;
        transition(
            &mut state,
            if timed_out {
                BatchState::TimedOut
            } else {
                BatchState::Completed
            },
        );

        let elapsed = start.elapsed();
        let batch = BatchResult {
            batch_id,
            operation_name: name.clone(),
            quantity,
            results,
            started_at,
            finished_at: Utc::now(),
            timed_out,
        };

        info!(
            "FINISHED Batch {} in {}: {} passed, {} failed, {} flaky, {} not run",
            name,
            format_elapsed(elapsed),
            batch.passed(),
            batch.failed(),
            batch.flaky(),
            batch.missing()
        );
        if timed_out {
            warn!(
                "Batch timed out after {}, collected {} of {} runs",
                format_elapsed(config.timeout),
                batch.results.len(),
                quantity
            );
        }

        let summary = format!("Test Results: {} finished in {}", name, format_elapsed(elapsed));
        reporters.finish_batch(&summary, &batch).await;

        batch
    }
}

fn transition(state: &mut BatchState, next: BatchState) {
    debug!("Batch state: {} -> {}", state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::operation::{Attempt, Failure, OperationReport, OutputBuffer};
    use crate::orchestrator::output::tests::SharedSink;
    use crate::report::{ReportError, ReportResult, Reporter};

    const HUGE_TIMEOUT: Duration = Duration::from_secs(u64::MAX);

    /// Instrumented operation: counts starts and tracks peak concurrency.
    #[derive(Default)]
    struct Instrumented {
        sleep_ms: u64,
        fail_first_attempt: bool,
        always_fail: bool,
        fail_run: Option<usize>,
        panic_run: Option<usize>,
        started: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Operation for Instrumented {
        fn name(&self) -> &str {
            "suite#instrumented"
        }

        async fn run(&self, attempt: &Attempt, out: &mut OutputBuffer) -> anyhow::Result<OperationReport> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            out.line(&format!("run {} begin", attempt.run_index));
            if self.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            }
            out.line(&format!("run {} end", attempt.run_index));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic_run == Some(attempt.run_index) {
                panic!("driver crashed");
            }
            let fail = self.always_fail
                || self.fail_run == Some(attempt.run_index)
                || (self.fail_first_attempt && attempt.number == 1);
            if fail {
                Ok(OperationReport::failed(vec![Failure::new("assertion failed")]))
            } else {
                Ok(OperationReport::passed())
            }
        }
    }

    #[derive(Default)]
    struct Counting {
        disabled: bool,
        fail: bool,
        complete_delay_ms: u64,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Counting {
        fn push(&self, call: &'static str) -> ReportResult<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                Err(ReportError::Render(format!("{} failed", call)))
            } else {
                Ok(())
            }
        }

        fn count(&self, call: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reporter for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn is_enabled(&self) -> bool {
            self.calls.lock().unwrap().push("is_enabled");
            !self.disabled
        }

        async fn initialize(&self) -> ReportResult<()> {
            self.push("initialize")
        }

        async fn on_batch_start(&self, _start: &BatchStart) -> ReportResult<()> {
            self.push("on_batch_start")
        }

        async fn on_run_complete(&self, _result: &RunResult) -> ReportResult<()> {
            if self.complete_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.complete_delay_ms)).await;
            }
            self.push("on_run_complete")
        }

        async fn on_batch_finish(&self, _summary: &str, _batch: &BatchResult) -> ReportResult<()> {
            self.push("on_batch_finish")
        }

        async fn close(&self) -> ReportResult<()> {
            self.push("close")
        }
    }

    fn batch(op: &Arc<Instrumented>, quantity: usize, parallelism: usize) -> BatchConfig {
        BatchConfig::new(Arc::clone(op) as Arc<dyn Operation>, quantity)
            .with_parallelism(parallelism)
            .with_timeout(Duration::from_secs(30))
            .with_jitter(Jitter::none())
    }

    fn quiet(reporters: ReporterSet) -> (Scheduler, SharedSink) {
        let sink = SharedSink::default();
        let scheduler = Scheduler::new(reporters).with_output(OutputMux::new(sink.clone()));
        (scheduler, sink)
    }

    #[tokio::test]
    async fn test_all_pass() {
        let op = Arc::new(Instrumented::default());
        let (scheduler, _) = quiet(ReporterSet::new());
        let shutdown = Arc::new(PoolShutdown::new());

        let result = scheduler
            .run_batch_with(batch(&op, 5, 2), Arc::clone(&shutdown))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 5);
        assert!(result.results.iter().all(|r| r.is_pass()));
        assert!(result.success());
        assert!(!result.timed_out);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(op.started.load(Ordering::SeqCst), 5);
        assert!(shutdown.is_shutdown());
        assert_eq!(shutdown.requests(), 1);
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let op = Arc::new(Instrumented::default());
        let (scheduler, _) = quiet(ReporterSet::new());

        let config = batch(&op, 3, 2).with_timeout(HUGE_TIMEOUT);
        let result = scheduler.run_batch(config).await.unwrap();

        assert_eq!(result.results.len(), 3);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_all_fail() {
        let op = Arc::new(Instrumented {
            always_fail: true,
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let result = scheduler.run_batch(batch(&op, 3, 3)).await.unwrap();

        assert_eq!(result.results.len(), 3);
        assert_eq!(result.failed(), 3);
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_single_failure_fails_batch() {
        let op = Arc::new(Instrumented {
            fail_run: Some(2),
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let result = scheduler.run_batch(batch(&op, 6, 3)).await.unwrap();

        assert_eq!(result.passed(), 5);
        assert_eq!(result.failed(), 1);
        assert!(!result.success());
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_parallelism() {
        let op = Arc::new(Instrumented {
            sleep_ms: 30,
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let result = scheduler.run_batch(batch(&op, 12, 3)).await.unwrap();

        assert_eq!(result.results.len(), 12);
        let peak = op.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {}", peak);
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_results() {
        let op = Arc::new(Instrumented {
            sleep_ms: 200,
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let config = batch(&op, 10, 1).with_timeout(Duration::from_millis(300));
        let result = scheduler.run_batch(config).await.unwrap();

        assert!(result.results.len() < 10);
        assert!(result.timed_out);
        assert!(result.missing() > 0);
        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_no_submission_after_deadline() {
        let op = Arc::new(Instrumented::default());
        let (scheduler, _) = quiet(ReporterSet::new());

        // Submissions land at ~200ms and ~400ms; the third would be past 500ms.
        let config = batch(&op, 10, 4)
            .with_timeout(Duration::from_millis(500))
            .with_jitter(Jitter::new(200, 200));
        let result = scheduler.run_batch(config).await.unwrap();

        assert_eq!(op.started.load(Ordering::SeqCst), 2);
        assert_eq!(result.results.len(), 2);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_retry_disabled_keeps_failure() {
        let op = Arc::new(Instrumented {
            fail_first_attempt: true,
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let result = scheduler.run_batch(batch(&op, 2, 2)).await.unwrap();

        assert_eq!(result.results.len(), 2);
        assert_eq!(result.failed(), 2);
        assert!(result.results.iter().all(|r| r.attempts == 1));
    }

    #[tokio::test]
    async fn test_retry_enabled_recovers() {
        let op = Arc::new(Instrumented {
            fail_first_attempt: true,
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let result = scheduler
            .run_batch(batch(&op, 2, 2).with_retry(true))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 2);
        assert_eq!(result.passed(), 2);
        assert_eq!(result.flaky(), 2);
        assert!(result.results.iter().all(|r| r.attempts == 2));
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_panicking_run_keeps_its_slot() {
        let op = Arc::new(Instrumented {
            panic_run: Some(1),
            ..Instrumented::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new());

        let result = scheduler.run_batch(batch(&op, 4, 2)).await.unwrap();

        assert_eq!(result.results.len(), 4);
        let failed: Vec<&RunResult> = result.results.iter().filter(|r| !r.is_pass()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].run_index, 1);
        assert_eq!(failed[0].outcome.causes()[0].message, "panicked: driver crashed");
    }

    #[tokio::test]
    async fn test_reporter_call_counts() {
        let enabled = Arc::new(Counting::default());
        let disabled = Arc::new(Counting {
            disabled: true,
            ..Counting::default()
        });
        let (scheduler, _) = quiet(
            ReporterSet::new()
                .with_shared(enabled.clone())
                .with_shared(disabled.clone()),
        );
        let op = Arc::new(Instrumented::default());

        scheduler.run_batch(batch(&op, 5, 2)).await.unwrap();

        assert_eq!(disabled.calls(), vec!["is_enabled"]);
        assert_eq!(enabled.count("is_enabled"), 1);
        assert_eq!(enabled.count("initialize"), 1);
        assert_eq!(enabled.count("on_batch_start"), 1);
        assert_eq!(enabled.count("on_run_complete"), 5);
        assert_eq!(enabled.count("on_batch_finish"), 1);
        assert_eq!(enabled.count("close"), 1);
        assert_eq!(enabled.calls().last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_failing_reporter_does_not_affect_outcome() {
        let failing = Arc::new(Counting {
            fail: true,
            ..Counting::default()
        });
        let healthy = Arc::new(Counting::default());
        let (scheduler, _) = quiet(
            ReporterSet::new()
                .with_shared(failing.clone())
                .with_shared(healthy.clone()),
        );
        let op = Arc::new(Instrumented::default());

        let result = scheduler.run_batch(batch(&op, 3, 3)).await.unwrap();

        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(failing.count("close"), 1);
        assert_eq!(healthy.count("on_run_complete"), 3);
        assert_eq!(healthy.count("close"), 1);
    }

    #[tokio::test]
    async fn test_reporters_closed_on_timeout() {
        let reporter = Arc::new(Counting::default());
        let (scheduler, _) = quiet(ReporterSet::new().with_shared(reporter.clone()));
        let op = Arc::new(Instrumented {
            sleep_ms: 200,
            ..Instrumented::default()
        });

        let config = batch(&op, 5, 1).with_timeout(Duration::from_millis(300));
        let result = scheduler.run_batch(config).await.unwrap();
        assert!(result.timed_out);

        // Give the abandoned in-flight run time to finish; it must stay silent.
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(reporter.count("on_batch_finish"), 1);
        assert_eq!(reporter.count("close"), 1);
        assert_eq!(reporter.count("on_run_complete"), result.results.len());
        assert_eq!(reporter.calls().last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_slow_run_complete_precedes_batch_finish() {
        let reporter = Arc::new(Counting {
            complete_delay_ms: 200,
            ..Counting::default()
        });
        let (scheduler, _) = quiet(ReporterSet::new().with_shared(reporter.clone()));
        let op = Arc::new(Instrumented::default());

        // Runs finish at once, but their completion hooks outlast the deadline.
        let config = batch(&op, 3, 3).with_timeout(Duration::from_millis(100));
        let result = scheduler.run_batch(config).await.unwrap();

        assert_eq!(result.results.len(), 3);
        let calls = reporter.calls();
        let finish = calls.iter().position(|c| *c == "on_batch_finish").unwrap();
        let completes: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == "on_run_complete")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(completes.len(), 3);
        assert!(completes.iter().all(|i| *i < finish));
        assert_eq!(calls.last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_invalid_config_touches_no_reporter() {
        let reporter = Arc::new(Counting::default());
        let (scheduler, _) = quiet(ReporterSet::new().with_shared(reporter.clone()));
        let op = Arc::new(Instrumented::default());

        let err = scheduler.run_batch(batch(&op, 0, 1)).await.unwrap_err();

        assert!(err.to_string().contains("quantity"));
        assert!(reporter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_output_flushed_as_blocks() {
        let op = Arc::new(Instrumented {
            sleep_ms: 5,
            ..Instrumented::default()
        });
        let (scheduler, sink) = quiet(ReporterSet::new());

        scheduler.run_batch(batch(&op, 6, 3)).await.unwrap();

        let text = sink.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 12);
        for pair in lines.chunks(2) {
            let run = pair[0].trim_end_matches(" begin");
            assert_eq!(pair[1], format!("{} end", run));
        }
    }

    #[test]
    fn test_exit_codes() {
        let now = Utc::now();
        let run = |pass: bool| RunResult {
            operation_name: "suite#instrumented".to_string(),
            run_index: 0,
            outcome: if pass {
                crate::executor::Outcome::Pass
            } else {
                crate::executor::Outcome::Fail {
                    causes: vec![Failure::new("x")],
                }
            },
            captured_output: Vec::new(),
            duration: Duration::ZERO,
            attempts: 1,
            flaky: false,
        };
        let result = |results: Vec<RunResult>, quantity: usize| BatchResult {
            batch_id: Uuid::new_v4(),
            operation_name: "suite#instrumented".to_string(),
            quantity,
            timed_out: results.len() < quantity,
            results,
            started_at: now,
            finished_at: now,
        };

        assert_eq!(result(vec![run(true), run(true)], 2).exit_code(), 0);
        assert_eq!(result(vec![run(true), run(false)], 2).exit_code(), 1);
        assert_eq!(result(vec![run(false)], 2).exit_code(), 1);
        // Missing runs alone do not fail the batch.
        assert_eq!(result(vec![run(true)], 2).exit_code(), 0);
        assert_eq!(result(Vec::new(), 2).exit_code(), 0);
    }
}
