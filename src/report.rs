//! Reporter capabilities: optional integrations notified around a batch.
//!
//! Each integration implements [`Reporter`] and is switched on or off on its
//! own. A [`ReporterSet`] holds every known integration; activating it
//! queries [`Reporter::is_enabled`] exactly once per integration and keeps
//! only the enabled ones. Disabled integrations never see another call.
//!
//! Hook failures are contained: an error or panic from one integration is
//! logged and neither changes a run's outcome nor stops the other
//! integrations from being called.
//!
//! # Call Sequence
//!
//! ```text
//!   activate()             is_enabled() on every reporter
//!   initialize()           once per enabled reporter
//!   on_batch_start()       once
//!     on_attempt_start()   per attempt, may write into the run buffer
//!     on_attempt_finish()  per attempt, may write into the run buffer
//!     on_run_complete()    per collected run
//!   on_batch_finish()      once
//!   close()                once, on every exit path
//! ```

pub mod console;
pub mod digest;
pub mod junit;
pub mod teamcity;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::executor::{RunRequest, RunResult};
use crate::operation::{Attempt, Failure, OutputBuffer, panic_message};
use crate::orchestrator::BatchResult;

pub use console::ConsoleReporter;
pub use digest::DigestReporter;
pub use junit::JUnitReporter;
pub use teamcity::TeamCityReporter;

/// Result type for reporter hooks.
pub type ReportResult<T> = Result<T, ReportError>;

/// Errors raised by reporter integrations.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// I/O error writing report files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to render a report.
    #[error("Failed to render report: {0}")]
    Render(String),

    /// A hook was called before the batch started.
    #[error("Reporter {0} was used before the batch started")]
    NotStarted(String),

    /// Other reporter errors.
    #[error("Reporter error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Describes a batch to reporters when it starts.
#[derive(Debug, Clone)]
pub struct BatchStart {
    pub batch_id: Uuid,
    /// Human readable line, e.g. `Running suite#case, 5 times, 2 in parallel`.
    pub description: String,
    pub operation_name: String,
    pub quantity: usize,
    pub parallelism: usize,
}

/// An optional notification or observability integration.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether this integration takes part in batches.
    fn is_enabled(&self) -> bool;

    /// Prepares the integration (open clients, create directories).
    async fn initialize(&self) -> ReportResult<()> {
        Ok(())
    }

    /// Called once before any run is submitted.
    async fn on_batch_start(&self, start: &BatchStart) -> ReportResult<()>;

    /// Called before every attempt; may write into the run's output.
    async fn on_attempt_start(
        &self,
        _run: &RunRequest,
        _attempt: &Attempt,
        _out: &mut OutputBuffer,
    ) -> ReportResult<()> {
        Ok(())
    }

    /// Called after every attempt with its failures (empty on pass).
    async fn on_attempt_finish(
        &self,
        _run: &RunRequest,
        _attempt: &Attempt,
        _failures: &[Failure],
        _out: &mut OutputBuffer,
    ) -> ReportResult<()> {
        Ok(())
    }

    /// Called when a run's result has been collected.
    async fn on_run_complete(&self, _result: &RunResult) -> ReportResult<()> {
        Ok(())
    }

    /// Called once after the batch completed or timed out.
    async fn on_batch_finish(&self, summary: &str, batch: &BatchResult) -> ReportResult<()>;

    /// Releases the integration. Called exactly once per batch.
    async fn close(&self) -> ReportResult<()> {
        Ok(())
    }
}

/// Every known reporter integration, enabled or not.
#[derive(Default)]
pub struct ReporterSet {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl ReporterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reporter to the set.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Arc::new(reporter));
        self
    }

    /// Add a reporter the caller keeps a handle to.
    pub fn with_shared(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    /// Queries every reporter once and keeps the enabled ones.
    pub fn activate(&self) -> ActiveReporters {
        let enabled: Vec<Arc<dyn Reporter>> = self
            .reporters
            .iter()
            .filter(|reporter| {
                let enabled = reporter.is_enabled();
                debug!(
                    "Reporter {} is {}",
                    reporter.name(),
                    if enabled { "enabled" } else { "disabled" }
                );
                enabled
            })
            .cloned()
            .collect();

        ActiveReporters {
            reporters: enabled.into(),
            closed: Arc::new(RwLock::new(false)),
        }
    }
}

/// The enabled reporters of one batch.
///
/// [`close_all`](Self::close_all) consumes the set, so `close` can only be
/// delivered once.
pub struct ActiveReporters {
    reporters: Arc<[Arc<dyn Reporter>]>,
    closed: Arc<RwLock<bool>>,
}

impl ActiveReporters {
    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.reporters.iter().map(|r| r.name()).collect()
    }

    /// Per-run hooks for the execution unit and the completion path.
    pub fn hooks(&self) -> RunHooks {
        RunHooks {
            reporters: Arc::clone(&self.reporters),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Initializes each reporter, then announces the batch to it.
    pub async fn start_batch(&self, start: &BatchStart) {
        for reporter in self.reporters.iter() {
            guarded(reporter.as_ref(), "initialize", reporter.initialize()).await;
            guarded(reporter.as_ref(), "on_batch_start", reporter.on_batch_start(start)).await;
        }
    }

    /// Silences every run-level hook, then runs `f`.
    ///
    /// Waits for hook dispatches already in progress, so once this returns
    /// no run-level hook is running or will run.
    pub async fn close_runs<T>(&self, f: impl FnOnce() -> T) -> T {
        let mut closed = self.closed.write().await;
        *closed = true;
        f()
    }

    pub async fn finish_batch(&self, summary: &str, batch: &BatchResult) {
        for reporter in self.reporters.iter() {
            guarded(
                reporter.as_ref(),
                "on_batch_finish",
                reporter.on_batch_finish(summary, batch),
            )
            .await;
        }
    }

    /// Closes every reporter. A failing close does not skip the others.
    pub async fn close_all(self) {
        *self.closed.write().await = true;
        for reporter in self.reporters.iter() {
            guarded(reporter.as_ref(), "close", reporter.close()).await;
        }
    }
}

/// Per-run view of the active reporters.
///
/// Cheap to clone into workers. Once the batch's run hooks are closed every
/// hook becomes a no-op, so runs finishing after a timeout stay silent.
#[derive(Clone)]
pub struct RunHooks {
    reporters: Arc<[Arc<dyn Reporter>]>,
    closed: Arc<RwLock<bool>>,
}

impl RunHooks {
    /// Hooks with no reporters behind them.
    pub fn none() -> Self {
        Self {
            reporters: Vec::new().into(),
            closed: Arc::new(RwLock::new(false)),
        }
    }

    /// Opens a scope in which the hooks cannot be closed.
    ///
    /// Closing waits until every open scope is dropped. Never open a second
    /// scope while holding one.
    pub async fn enter(&self) -> RunScope<'_> {
        RunScope {
            reporters: &self.reporters,
            closed: self.closed.read().await,
        }
    }

    pub async fn attempt_start(&self, run: &RunRequest, attempt: &Attempt, out: &mut OutputBuffer) {
        self.enter().await.attempt_start(run, attempt, out).await;
    }

    pub async fn attempt_finish(
        &self,
        run: &RunRequest,
        attempt: &Attempt,
        failures: &[Failure],
        out: &mut OutputBuffer,
    ) {
        self.enter()
            .await
            .attempt_finish(run, attempt, failures, out)
            .await;
    }

    pub async fn run_complete(&self, result: &RunResult) {
        self.enter().await.run_complete(result).await;
    }
}

/// Run-level hooks held open; see [`RunHooks::enter`].
pub struct RunScope<'a> {
    reporters: &'a [Arc<dyn Reporter>],
    closed: RwLockReadGuard<'a, bool>,
}

impl RunScope<'_> {
    pub fn is_closed(&self) -> bool {
        *self.closed
    }

    fn live(&self) -> &[Arc<dyn Reporter>] {
        if self.is_closed() { &[] } else { self.reporters }
    }

    pub async fn attempt_start(&self, run: &RunRequest, attempt: &Attempt, out: &mut OutputBuffer) {
        for reporter in self.live() {
            guarded(
                reporter.as_ref(),
                "on_attempt_start",
                reporter.on_attempt_start(run, attempt, out),
            )
            .await;
        }
    }

    pub async fn attempt_finish(
        &self,
        run: &RunRequest,
        attempt: &Attempt,
        failures: &[Failure],
        out: &mut OutputBuffer,
    ) {
        for reporter in self.live() {
            guarded(
                reporter.as_ref(),
                "on_attempt_finish",
                reporter.on_attempt_finish(run, attempt, failures, out),
            )
            .await;
        }
    }

    pub async fn run_complete(&self, result: &RunResult) {
        for reporter in self.live() {
            guarded(
                reporter.as_ref(),
                "on_run_complete",
                reporter.on_run_complete(result),
            )
            .await;
        }
    }
}

/// Awaits a reporter hook, logging errors and panics instead of propagating them.
async fn guarded<F>(reporter: &dyn Reporter, hook: &str, call: F)
where
    F: Future<Output = ReportResult<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Reporter {} failed in {}: {}", reporter.name(), hook, e),
        Err(payload) => warn!(
            "Reporter {} panicked in {}: {}",
            reporter.name(),
            hook,
            panic_message(payload.as_ref())
        ),
    }
}

/// Formats an elapsed duration for banners and summaries.
///
/// `850ms`, `4.20s`, `1m 05s`, `2h 03m 04s`.
pub fn format_elapsed(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
