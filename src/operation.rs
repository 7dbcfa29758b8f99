//! The operation under test.
//!
//! An [`Operation`] is the opaque "run the test once" unit that a batch
//! repeats. It writes whatever it prints into the [`OutputBuffer`] it is
//! handed and reports pass/fail through an [`OperationReport`].
//!
//! # Built-in Operations
//!
//! | Implementation | Description |
//! |----------------|-------------|
//! | [`command::CommandOperation`] | Runs a test command as a child process |
//!
//! # Custom Operations
//!
//! ```
//! use async_trait::async_trait;
//! use volley::operation::{Attempt, Operation, OperationReport, OutputBuffer};
//!
//! struct Smoke;
//!
//! #[async_trait]
//! impl Operation for Smoke {
//!     fn name(&self) -> &str {
//!         "smoke#ping"
//!     }
//!
//!     async fn run(&self, _attempt: &Attempt, out: &mut OutputBuffer) -> anyhow::Result<OperationReport> {
//!         out.line("pong");
//!         Ok(OperationReport::passed())
//!     }
//! }
//! ```

pub mod command;

use std::any::Any;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OperationConfig;

pub use command::CommandOperation;

/// Identifies one invocation of an operation within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Index of the run this attempt belongs to.
    pub run_index: usize,
    /// 1-based attempt number; `2` is the single retry.
    pub number: u32,
}

/// One cause of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Short, single-line description.
    pub message: String,
    /// Stack trace, error chain or output tail, when available.
    pub trace: Option<String>,
}

impl Failure {
    /// Creates a failure with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    /// Attaches a trace to the failure.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Converts an error that escaped an operation into a failure cause.
    ///
    /// The trace carries the full error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::new(err.to_string()).with_trace(format!("{:?}", err))
    }

    /// Converts a panic payload into a failure cause.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(format!("panicked: {}", panic_message(payload)))
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// What an operation reports after one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationReport {
    failures: Vec<Failure>,
}

impl OperationReport {
    /// A successful invocation.
    pub fn passed() -> Self {
        Self::default()
    }

    /// A failed invocation with the given causes.
    ///
    /// An empty cause list still counts as a failure.
    pub fn failed(mut failures: Vec<Failure>) -> Self {
        if failures.is_empty() {
            failures.push(Failure::new("operation reported failure without a cause"));
        }
        Self { failures }
    }

    pub fn was_successful(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }
}

/// Captured console output of a single run.
///
/// Every run writes into its own buffer; the buffer is flushed to the
/// shared console in one block once the run completes.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` followed by a newline.
    pub fn line(&mut self, text: &str) {
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(b'\n');
    }

    /// Appends raw `bytes` followed by a newline; they need not be UTF-8.
    pub fn line_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        self.bytes.push(b'\n');
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl io::Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A test that can be executed once.
///
/// Implementations must be safe to invoke concurrently from several
/// workers; each invocation gets its own [`OutputBuffer`].
#[async_trait]
pub trait Operation: Send + Sync {
    /// Stable identifier used in logs and reports, e.g. `suite#case`.
    fn name(&self) -> &str;

    /// Runs the test once.
    ///
    /// Return `Ok` with a failed report for test-level failures. Errors are
    /// reserved for infrastructure problems; the execution unit records
    /// them as failed runs.
    async fn run(&self, attempt: &Attempt, out: &mut OutputBuffer) -> anyhow::Result<OperationReport>;
}

/// Builds the operation described by the configuration.
pub fn from_config(config: &OperationConfig) -> Arc<dyn Operation> {
    match config {
        OperationConfig::Command(cfg) => Arc::new(CommandOperation::new(cfg.clone())),
    }
}
