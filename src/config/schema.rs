//! Configuration schema definitions for volley.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── VolleyConfig           - Batch settings (quantity, parallelism, timeout, retry)
//! ├── OperationConfig        - Tagged enum selecting the operation type
//! │   └── Command            - Test command run as a child process
//! └── ReportConfig           - Reporter integrations, each enabled on its own
//!     ├── console
//!     ├── JunitReportConfig
//!     ├── TeamCityReportConfig
//!     └── DigestReportConfig
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for volley.
///
/// # Example
///
/// ```
/// use volley::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [volley]
///     quantity = 20
///     parallelism = 4
///
///     [operation]
///     type = "command"
///     name = "checkout#test_pay"
///     command = "cargo test --test checkout test_pay"
/// "#).unwrap();
///
/// assert_eq!(config.volley.quantity, 20);
/// assert!(config.report.console);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Batch settings.
    #[serde(default)]
    pub volley: VolleyConfig,

    /// The operation run on every iteration.
    pub operation: OperationConfig,

    /// Reporter integrations (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core batch settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `quantity` | 1 |
/// | `parallelism` | 1 |
/// | `timeout_in_minutes` | 60 |
/// | `retry` | false |
/// | `jitter_min_ms` | 500 |
/// | `jitter_max_ms` | 2000 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolleyConfig {
    /// How many times the operation is run.
    #[serde(default = "default_quantity")]
    pub quantity: usize,

    /// Maximum number of runs executing at the same time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Timeout for the whole batch, in minutes.
    ///
    /// Runs still queued when it expires are never started.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_in_minutes: u64,

    /// Give each failed run exactly one more attempt.
    #[serde(default)]
    pub retry: bool,

    /// Lower bound of the random delay between run submissions.
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    /// Upper bound (exclusive) of the random delay between run submissions.
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for VolleyConfig {
    fn default() -> Self {
        Self {
            quantity: default_quantity(),
            parallelism: default_parallelism(),
            timeout_in_minutes: default_timeout_minutes(),
            retry: false,
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

fn default_quantity() -> usize {
    1
}

fn default_parallelism() -> usize {
    1
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_jitter_min_ms() -> u64 {
    500
}

fn default_jitter_max_ms() -> u64 {
    2000
}

/// Operation configuration.
///
/// Tagged by the `type` field in TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationConfig {
    /// Run a test command as a local child process.
    Command(CommandOperationConfig),
}

impl OperationConfig {
    /// The operation's display name.
    pub fn name(&self) -> &str {
        match self {
            OperationConfig::Command(cfg) => &cfg.name,
        }
    }
}

/// Configuration for the command operation.
///
/// # Example
///
/// ```toml
/// [operation]
/// type = "command"
/// name = "tests/login.rs#test_login"
/// command = "cargo test --test login test_login -- --exact"
/// shell = "/bin/bash"
/// timeout_secs = 600
///
/// [operation.env]
/// BROWSER = "headless"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandOperationConfig {
    /// Stable name of the test, e.g. `suite#case`.
    pub name: String,

    /// Command that runs the test once.
    pub command: String,

    /// Shell used as `{shell} -c "{command}"`.
    ///
    /// When unset the command is split into words and executed directly.
    pub shell: Option<String>,

    /// Working directory for the command. `~` is expanded.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Kill a single attempt after this many seconds.
    pub timeout_secs: Option<u64>,
}

/// Reporter integrations.
///
/// Every integration is switched on or off independently.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Progress bar and summary on the terminal.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub console: bool,

    /// JUnit XML report for CI dashboards.
    #[serde(default)]
    pub junit: JunitReportConfig,

    /// TeamCity service messages.
    #[serde(default)]
    pub teamcity: TeamCityReportConfig,

    /// Chat-style digest of the batch.
    #[serde(default)]
    pub digest: DigestReportConfig,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            console: true,
            junit: JunitReportConfig::default(),
            teamcity: TeamCityReportConfig::default(),
            digest: DigestReportConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// JUnit XML reporter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JunitReportConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Default: `"test-results/volley.xml"`
    #[serde(default = "default_junit_path")]
    pub path: PathBuf,

    /// Name of the `<testsuite>` element. Defaults to the operation name.
    pub testsuite_name: Option<String>,
}

impl Default for JunitReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_junit_path(),
            testsuite_name: None,
        }
    }
}

fn default_junit_path() -> PathBuf {
    PathBuf::from("test-results/volley.xml")
}

/// TeamCity reporter settings.
///
/// The reporter is also enabled when `TEAMCITY_VERSION` is set in the
/// environment, which TeamCity does for every build.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TeamCityReportConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Digest reporter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DigestReportConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Markdown digest path; a JSON copy is written next to it.
    ///
    /// Default: `"test-results/digest.md"`
    #[serde(default = "default_digest_path")]
    pub path: PathBuf,
}

impl Default for DigestReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_digest_path(),
        }
    }
}

fn default_digest_path() -> PathBuf {
    PathBuf::from("test-results/digest.md")
}
