//! volley: run one test many times with bounded parallelism.
//!
//! Point volley at a single test and it runs that test `quantity` times,
//! at most `parallelism` at once, with a random delay between starts. Every
//! run's output is captured separately and printed as one block when the
//! run completes. The batch result says how many runs passed, failed or
//! never ran, which makes volley a tool for hunting flaky tests.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Operation**: the test being repeated (a command, or any [`Operation`] impl)
//! - **Executor**: runs the operation once, with an optional single retry
//! - **Orchestrator**: worker pool, result aggregation, output multiplexing, timeout
//! - **Report**: optional integrations (console, JUnit XML, TeamCity, digest)
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use volley::config::{CommandOperationConfig, OperationConfig};
//! use volley::operation;
//! use volley::orchestrator::{BatchConfig, Scheduler};
//! use volley::report::ReporterSet;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let op = operation::from_config(&OperationConfig::Command(CommandOperationConfig {
//!         name: "smoke#ping".to_string(),
//!         command: "ping -c 1 localhost".to_string(),
//!         shell: None,
//!         working_dir: None,
//!         env: Default::default(),
//!         timeout_secs: Some(10),
//!     }));
//!
//!     let batch = BatchConfig::new(op, 20)
//!         .with_parallelism(4)
//!         .with_timeout(Duration::from_secs(600));
//!
//!     let result = Scheduler::new(ReporterSet::new()).run_batch(batch).await?;
//!     println!("{} of {} runs failed", result.failed(), result.quantity);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod executor;
pub mod operation;
pub mod orchestrator;
pub mod report;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use executor::{ExecutionUnit, Outcome, RunRequest, RunResult};
pub use operation::{Operation, OperationReport, OutputBuffer};
pub use orchestrator::{BatchConfig, BatchResult, Scheduler};
pub use report::{Reporter, ReporterSet};
