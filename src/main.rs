//! volley CLI - run one test many times in parallel.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use volley::config::{self, Config, OperationConfig};
use volley::operation;
use volley::orchestrator::Scheduler;
use volley::report::{ConsoleReporter, DigestReporter, JUnitReporter, ReporterSet, TeamCityReporter};

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Run one test many times with bounded parallelism", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "volley.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured operation as a batch
    Run {
        /// Override how many times the operation is run
        #[arg(short = 'n', long)]
        quantity: Option<usize>,

        /// Override how many runs execute at the same time
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Override the batch timeout, in minutes
        #[arg(long)]
        timeout_mins: Option<u64>,

        /// Give each failed run one more attempt
        #[arg(long)]
        retry: bool,

        /// JUnit XML output path (enables the JUnit reporter)
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            quantity,
            parallel,
            timeout_mins,
            retry,
            junit,
        } => {
            let overrides = Overrides {
                quantity,
                parallel,
                timeout_mins,
                retry,
            };
            run_batch(&cli.config, overrides, junit, cli.verbose).await
        }
        Commands::Validate => validate_config(&cli.config).map(|_| ExitCode::SUCCESS),
        Commands::Init => init_config(&cli.config).map(|_| ExitCode::SUCCESS),
    }
}

struct Overrides {
    quantity: Option<usize>,
    parallel: Option<usize>,
    timeout_mins: Option<u64>,
    retry: bool,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(quantity) = self.quantity {
            config.volley.quantity = quantity;
        }
        if let Some(parallel) = self.parallel {
            config.volley.parallelism = parallel;
        }
        if let Some(minutes) = self.timeout_mins {
            config.volley.timeout_in_minutes = minutes;
        }
        if self.retry {
            config.volley.retry = true;
        }
    }
}

async fn run_batch(
    config_path: &Path,
    overrides: Overrides,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<ExitCode> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!("Loaded configuration from {}", config_path.display());

    let operation = operation::from_config(&config.operation);
    let reporters = create_reporters(&config, junit_path, verbose);
    let batch = config.batch_config(operation);

    let result = Scheduler::new(reporters).run_batch(batch).await?;
    // Returning lets the runtime drop runs still in flight after a timeout,
    // which kills their child processes.
    Ok(ExitCode::from(result.exit_code() as u8))
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Quantity: {}", config.volley.quantity);
    println!("  Parallelism: {}", config.volley.parallelism);
    println!("  Timeout: {}m", config.volley.timeout_in_minutes);
    println!("  Retry: {}", config.volley.retry);
    println!(
        "  Jitter: {}ms..{}ms",
        config.volley.jitter_min_ms, config.volley.jitter_max_ms
    );

    match &config.operation {
        OperationConfig::Command(cmd) => {
            println!("  Operation: {} (command: {})", cmd.name, cmd.command);
        }
    }

    let mut reporters = Vec::new();
    if config.report.console {
        reporters.push("console");
    }
    if config.report.junit.enabled {
        reporters.push("junit");
    }
    if config.report.teamcity.enabled {
        reporters.push("teamcity");
    }
    if config.report.digest.enabled {
        reporters.push("digest");
    }
    let reporters = if reporters.is_empty() {
        "none".to_string()
    } else {
        reporters.join(", ")
    };
    println!("  Reporters: {}", reporters);

    Ok(())
}

const STARTER_CONFIG: &str = r#"# volley configuration file

[volley]
quantity = 10
parallelism = 2
timeout_in_minutes = 30
retry = false

[operation]
type = "command"
name = "tests/smoke.rs#test_smoke"
command = "cargo test --test smoke test_smoke -- --exact"
# shell = "/bin/sh"
# working_dir = "."
# timeout_secs = 600

[report]
console = true

[report.junit]
enabled = true
path = "test-results/volley.xml"

[report.teamcity]
enabled = false

[report.digest]
enabled = false
path = "test-results/digest.md"
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  volley run");

    Ok(())
}

fn create_reporters(config: &Config, junit_override: Option<PathBuf>, verbose: bool) -> ReporterSet {
    let report = &config.report;

    let junit_enabled = report.junit.enabled || junit_override.is_some();
    let junit_path = junit_override.unwrap_or_else(|| config::expand_path(&report.junit.path));
    let mut junit = JUnitReporter::new(junit_path).with_enabled(junit_enabled);
    if let Some(name) = &report.junit.testsuite_name {
        junit = junit.with_testsuite_name(name);
    }

    ReporterSet::new()
        .with_reporter(ConsoleReporter::new(report.console, verbose))
        .with_reporter(junit)
        .with_reporter(TeamCityReporter::from_env(report.teamcity.enabled))
        .with_reporter(DigestReporter::new(
            report.digest.enabled,
            config::expand_path(&report.digest.path),
        ))
}
