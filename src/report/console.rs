//! Console reporter: progress bar and a colored summary on the terminal.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{BatchStart, ReportError, ReportResult, Reporter, format_elapsed};
use crate::executor::RunResult;
use crate::orchestrator::BatchResult;

/// Console reporter that shows batch progress in the terminal.
pub struct ConsoleReporter {
    enabled: bool,
    verbose: bool,
    progress: Mutex<Option<indicatif::ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new(enabled: bool, verbose: bool) -> Self {
        Self {
            enabled,
            verbose,
            progress: Mutex::new(None),
        }
    }

    fn take_progress(&self) -> Option<indicatif::ProgressBar> {
        self.progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    fn name(&self) -> &str {
        "console"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn on_batch_start(&self, start: &BatchStart) -> ReportResult<()> {
        println!("{}", console::style(&start.description).bold());

        let pb = indicatif::ProgressBar::new(start.quantity as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .map_err(|e| ReportError::Render(e.to_string()))?
                .progress_chars("#>-"),
        );

        *self
            .progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pb);
        Ok(())
    }

    async fn on_run_complete(&self, result: &RunResult) -> ReportResult<()> {
        let guard = self
            .progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(pb) = guard.as_ref() else {
            return Ok(());
        };
        pb.inc(1);

        let status = if result.flaky {
            console::style("FLAKY").yellow()
        } else if result.is_pass() {
            console::style("PASS ").green()
        } else {
            console::style("FAIL ").red()
        };

        if self.verbose || !result.is_pass() || result.flaky {
            pb.println(format!(
                "{} {} run {} ({})",
                status,
                result.operation_name,
                result.run_index,
                format_elapsed(result.duration)
            ));
        }
        Ok(())
    }

    async fn on_batch_finish(&self, summary: &str, batch: &BatchResult) -> ReportResult<()> {
        if let Some(pb) = self.take_progress() {
            pb.finish_and_clear();
        }

        println!();
        println!("{}", summary);
        println!("  Total:   {}", batch.quantity);
        println!("  Passed:  {}", console::style(batch.passed()).green());
        println!("  Failed:  {}", console::style(batch.failed()).red());

        if batch.missing() > 0 {
            println!("  Not Run: {}", console::style(batch.missing()).red().bold());
        }

        if batch.flaky() > 0 {
            println!("  Flaky:   {}", console::style(batch.flaky()).yellow());
        }

        println!("  Duration: {}", format_elapsed(batch.duration()));

        println!();
        if batch.failed() == 0 && batch.is_complete() {
            println!("{}", console::style("All runs passed!").green().bold());
        } else if batch.failed() == 0 {
            println!(
                "{}",
                console::style("All collected runs passed, but the batch timed out before every run completed.")
                    .yellow()
                    .bold()
            );
        } else {
            println!("{}", console::style("Some runs failed.").red().bold());
            println!();
            println!("Failed runs:");
            for r in batch.results.iter().filter(|r| !r.is_pass()) {
                println!("  - {} run {}", r.operation_name, r.run_index);
                for cause in r.outcome.causes() {
                    println!("    {}", console::style(&cause.message).dim());
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> ReportResult<()> {
        if let Some(pb) = self.take_progress() {
            pb.abandon();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_enablement_follows_config() {
        assert!(ConsoleReporter::new(true, false).is_enabled());
        assert!(!ConsoleReporter::new(false, true).is_enabled());
    }

    #[tokio::test]
    async fn test_progress_cleared_on_finish() {
        let reporter = ConsoleReporter::new(true, false);
        reporter
            .on_batch_start(&BatchStart {
                batch_id: Uuid::new_v4(),
                description: "Running suite#case, 1 times, 1 in parallel".to_string(),
                operation_name: "suite#case".to_string(),
                quantity: 1,
                parallelism: 1,
            })
            .await
            .unwrap();
        assert!(reporter.progress.lock().unwrap().is_some());

        let now = Utc::now();
        let batch = BatchResult {
            batch_id: Uuid::new_v4(),
            operation_name: "suite#case".to_string(),
            quantity: 1,
            results: Vec::new(),
            started_at: now,
            finished_at: now,
            timed_out: true,
        };
        reporter.on_batch_finish("Test Results: suite#case finished in 1ms", &batch).await.unwrap();

        assert!(reporter.progress.lock().unwrap().is_none());
        reporter.close().await.unwrap();
    }
}
