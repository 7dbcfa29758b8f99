//! TeamCity service messages.
//!
//! Every attempt is announced as a TeamCity test. The messages are written
//! into the run's own output buffer, so they reach the console inside the
//! run's block and never interleave with other runs. Each run uses its own
//! `flowId`.
//!
//! ```text
//! ##teamcity[testStarted name='suite#case |[run 3|]' flowId='volley-run-3' captureStandardOutput='true']
//! ##teamcity[testFailed name='suite#case |[run 3|]' flowId='volley-run-3' message='...' details='...']
//! ##teamcity[testFinished name='suite#case |[run 3|]' flowId='volley-run-3']
//! ```

use async_trait::async_trait;

use super::{BatchStart, ReportResult, Reporter};
use crate::executor::RunRequest;
use crate::operation::{Attempt, Failure, OutputBuffer};
use crate::orchestrator::BatchResult;

/// Environment variable TeamCity sets for every build.
pub const TEAMCITY_VERSION_ENV: &str = "TEAMCITY_VERSION";

pub struct TeamCityReporter {
    enabled: bool,
}

impl TeamCityReporter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Enabled when configured, or when running inside a TeamCity build.
    pub fn from_env(configured: bool) -> Self {
        Self::new(configured || std::env::var_os(TEAMCITY_VERSION_ENV).is_some())
    }
}

fn test_name(run: &RunRequest, attempt: &Attempt) -> String {
    if attempt.number > 1 {
        format!(
            "{} [run {} attempt {}]",
            run.operation.name(),
            run.run_index,
            attempt.number
        )
    } else {
        format!("{} [run {}]", run.operation.name(), run.run_index)
    }
}

fn flow_id(run: &RunRequest) -> String {
    format!("volley-run-{}", run.run_index)
}

#[async_trait]
impl Reporter for TeamCityReporter {
    fn name(&self) -> &str {
        "teamcity"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn on_batch_start(&self, start: &BatchStart) -> ReportResult<()> {
        println!(
            "##teamcity[message text='{}' status='NORMAL']",
            escape(&start.description)
        );
        Ok(())
    }

    async fn on_attempt_start(
        &self,
        run: &RunRequest,
        attempt: &Attempt,
        out: &mut OutputBuffer,
    ) -> ReportResult<()> {
        out.line(&format!(
            "##teamcity[testStarted name='{}' flowId='{}' captureStandardOutput='true']",
            escape(&test_name(run, attempt)),
            flow_id(run)
        ));
        Ok(())
    }

    async fn on_attempt_finish(
        &self,
        run: &RunRequest,
        attempt: &Attempt,
        failures: &[Failure],
        out: &mut OutputBuffer,
    ) -> ReportResult<()> {
        let name = escape(&test_name(run, attempt));
        let flow = flow_id(run);

        if let Some(first) = failures.first() {
            let details = failures
                .iter()
                .filter_map(|f| f.trace.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            out.line(&format!(
                "##teamcity[testFailed name='{}' flowId='{}' message='{}' details='{}']",
                name,
                flow,
                escape(&first.message),
                escape(&details)
            ));
        }
        out.line(&format!(
            "##teamcity[testFinished name='{}' flowId='{}']",
            name, flow
        ));
        Ok(())
    }

    async fn on_batch_finish(&self, summary: &str, batch: &BatchResult) -> ReportResult<()> {
        let status = if !batch.success() {
            "FAILURE"
        } else if !batch.is_complete() {
            "WARNING"
        } else {
            "NORMAL"
        };
        println!(
            "##teamcity[message text='{}' status='{}']",
            escape(summary),
            status
        );
        Ok(())
    }
}

/// Escape a value for a TeamCity service message.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '|' => escaped.push_str("||"),
            '\'' => escaped.push_str("|'"),
            '\n' => escaped.push_str("|n"),
            '\r' => escaped.push_str("|r"),
            '[' => escaped.push_str("|["),
            ']' => escaped.push_str("|]"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::operation::{Operation, OperationReport};

    struct Named;

    #[async_trait]
    impl Operation for Named {
        fn name(&self) -> &str {
            "suite#case"
        }

        async fn run(&self, _attempt: &Attempt, _out: &mut OutputBuffer) -> anyhow::Result<OperationReport> {
            Ok(OperationReport::passed())
        }
    }

    fn run() -> RunRequest {
        RunRequest {
            operation: Arc::new(Named),
            run_index: 3,
            retry_enabled: true,
        }
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("it's [x] | y\nz"), "it|'s |[x|] || y|nz");
    }

    #[tokio::test]
    async fn test_failed_attempt_messages() {
        let reporter = TeamCityReporter::new(true);
        let attempt = Attempt {
            run_index: 3,
            number: 1,
        };
        let mut out = OutputBuffer::new();

        reporter.on_attempt_start(&run(), &attempt, &mut out).await.unwrap();
        reporter
            .on_attempt_finish(
                &run(),
                &attempt,
                &[Failure::new("boom").with_trace("line 1\nline 2")],
                &mut out,
            )
            .await
            .unwrap();

        let text = String::from_utf8(out.into_bytes()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "##teamcity[testStarted name='suite#case |[run 3|]' flowId='volley-run-3' captureStandardOutput='true']",
                "##teamcity[testFailed name='suite#case |[run 3|]' flowId='volley-run-3' message='boom' details='line 1|nline 2']",
                "##teamcity[testFinished name='suite#case |[run 3|]' flowId='volley-run-3']",
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_attempt_gets_its_own_name() {
        let reporter = TeamCityReporter::new(true);
        let attempt = Attempt {
            run_index: 3,
            number: 2,
        };
        let mut out = OutputBuffer::new();

        reporter.on_attempt_finish(&run(), &attempt, &[], &mut out).await.unwrap();

        let text = String::from_utf8(out.into_bytes()).unwrap();
        assert_eq!(
            text,
            "##teamcity[testFinished name='suite#case |[run 3 attempt 2|]' flowId='volley-run-3']\n"
        );
    }
}
