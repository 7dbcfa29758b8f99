//! Configuration loading and schema definitions for volley.
//!
//! This module provides types and functions for loading volley configuration
//! from TOML files or strings, validating it, and turning it into the
//! immutable [`BatchConfig`] the scheduler runs.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::operation::Operation;
use crate::orchestrator::BatchConfig;
use crate::orchestrator::jitter::Jitter;

/// Loads volley configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use volley::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("volley.toml"))?;
/// println!("Quantity: {}", config.volley.quantity);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads volley configuration from a TOML string.
///
/// # Example
///
/// ```
/// use volley::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [volley]
///     quantity = 4
///
///     [operation]
///     type = "command"
///     name = "smoke#ping"
///     command = "true"
/// "#)?;
///
/// assert_eq!(config.volley.quantity, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Expands a leading `~` and environment variables in a path.
///
/// Paths that fail to expand are returned unchanged.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    /// Checks the settings that the schema alone cannot express.
    pub fn validate(&self) -> Result<()> {
        let volley = &self.volley;
        if volley.quantity == 0 {
            bail!("quantity must be at least 1");
        }
        if volley.parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        if volley.timeout_in_minutes == 0 {
            bail!("timeout_in_minutes must be at least 1");
        }
        if volley.jitter_min_ms > volley.jitter_max_ms {
            bail!(
                "jitter_min_ms ({}) must not exceed jitter_max_ms ({})",
                volley.jitter_min_ms,
                volley.jitter_max_ms
            );
        }
        match &self.operation {
            OperationConfig::Command(cfg) => {
                if cfg.name.trim().is_empty() {
                    bail!("operation name must not be empty");
                }
                if cfg.command.trim().is_empty() {
                    bail!("operation command must not be empty");
                }
            }
        }
        Ok(())
    }

    /// Builds the batch configuration for the given operation.
    pub fn batch_config(&self, operation: Arc<dyn Operation>) -> BatchConfig {
        BatchConfig::new(operation, self.volley.quantity)
            .with_parallelism(self.volley.parallelism)
            .with_timeout(Duration::from_secs(
                self.volley.timeout_in_minutes.saturating_mul(60),
            ))
            .with_retry(self.volley.retry)
            .with_jitter(Jitter::new(
                self.volley.jitter_min_ms,
                self.volley.jitter_max_ms,
            ))
    }
}
