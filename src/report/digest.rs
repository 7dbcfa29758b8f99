//! Digest reporter: a short chat-style summary of the batch.
//!
//! The digest starts with the batch description, collects one line per run
//! and ends with the final summary. It is written as markdown at the
//! configured path, with a JSON copy next to it (`digest.md` and
//! `digest.json`) for bots that post it to a channel.
//!
//! A batch that ends without a summary (setup error, panic) still gets a
//! digest, marked as aborted, when the reporter is closed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{BatchStart, ReportError, ReportResult, Reporter, format_elapsed};
use crate::executor::RunResult;
use crate::orchestrator::BatchResult;

pub struct DigestReporter {
    enabled: bool,
    path: PathBuf,
    state: Mutex<Option<Digest>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
enum DigestStatus {
    Running,
    Passed,
    Failed,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
struct DigestRun {
    run_index: usize,
    passed: bool,
    flaky: bool,
    attempts: u32,
    duration_ms: u128,
    causes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Digest {
    batch_id: Uuid,
    description: String,
    started_at: DateTime<Utc>,
    status: DigestStatus,
    summary: Option<String>,
    runs: Vec<DigestRun>,
    #[serde(skip)]
    written: bool,
}

impl Digest {
    fn to_markdown(&self) -> String {
        let mut md = format!("*{}*\n", self.description);
        md.push_str(&format!("_batch {} started {}_\n\n", self.batch_id, self.started_at.to_rfc3339()));

        for run in &self.runs {
            let mark = if run.flaky {
                ":warning:"
            } else if run.passed {
                ":white_check_mark:"
            } else {
                ":x:"
            };
            md.push_str(&format!(
                "{} run {} ({}, {} attempt{})",
                mark,
                run.run_index,
                format_elapsed(std::time::Duration::from_millis(run.duration_ms as u64)),
                run.attempts,
                if run.attempts == 1 { "" } else { "s" }
            ));
            if let Some(cause) = run.causes.first() {
                md.push_str(&format!(": `{}`", cause));
            }
            md.push('\n');
        }

        md.push('\n');
        match (&self.status, &self.summary) {
            (DigestStatus::Aborted, _) => md.push_str("*Batch aborted before it finished*\n"),
            (_, Some(summary)) => md.push_str(&format!("*{}*\n", summary)),
            (_, None) => {}
        }
        md
    }
}

impl DigestReporter {
    pub fn new(enabled: bool, path: PathBuf) -> Self {
        Self {
            enabled,
            path,
            state: Mutex::new(None),
        }
    }

    /// Path of the JSON copy written next to the markdown digest.
    pub fn json_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut Option<Digest>) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    fn write(&self, digest: &Digest) -> ReportResult<()> {
        ensure_parent(&self.path)?;
        std::fs::write(&self.path, digest.to_markdown())?;
        let json = serde_json::to_string_pretty(digest).map_err(|e| ReportError::Render(e.to_string()))?;
        std::fs::write(self.json_path(), json)?;
        tracing::info!("Digest written to: {}", self.path.display());
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[async_trait]
impl Reporter for DigestReporter {
    fn name(&self) -> &str {
        "digest"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn initialize(&self) -> ReportResult<()> {
        ensure_parent(&self.path)?;
        Ok(())
    }

    async fn on_batch_start(&self, start: &BatchStart) -> ReportResult<()> {
        self.with_state(|state| {
            *state = Some(Digest {
                batch_id: start.batch_id,
                description: start.description.clone(),
                started_at: Utc::now(),
                status: DigestStatus::Running,
                summary: None,
                runs: Vec::new(),
                written: false,
            });
        });
        Ok(())
    }

    async fn on_run_complete(&self, result: &RunResult) -> ReportResult<()> {
        self.with_state(|state| {
            let digest = state
                .as_mut()
                .ok_or_else(|| ReportError::NotStarted(self.name().to_string()))?;
            digest.runs.push(DigestRun {
                run_index: result.run_index,
                passed: result.is_pass(),
                flaky: result.flaky,
                attempts: result.attempts,
                duration_ms: result.duration_ms(),
                causes: result
                    .outcome
                    .causes()
                    .iter()
                    .map(|c| c.message.clone())
                    .collect(),
            });
            Ok::<_, ReportError>(())
        })
    }

    async fn on_batch_finish(&self, summary: &str, batch: &BatchResult) -> ReportResult<()> {
        let digest = self.with_state(|state| {
            let digest = state
                .as_mut()
                .ok_or_else(|| ReportError::NotStarted(self.name().to_string()))?;
            digest.status = if batch.failed() > 0 {
                DigestStatus::Failed
            } else if batch.timed_out {
                DigestStatus::TimedOut
            } else {
                DigestStatus::Passed
            };
            digest.summary = Some(summary.to_string());
            digest.written = true;
            Ok::<_, ReportError>(digest.clone())
        })?;
        self.write(&digest)
    }

    async fn close(&self) -> ReportResult<()> {
        let pending = self.with_state(|state| match state.take() {
            Some(mut digest) if !digest.written => {
                digest.status = DigestStatus::Aborted;
                Some(digest)
            }
            _ => None,
        });
        match pending {
            Some(digest) => self.write(&digest),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::executor::Outcome;
    use crate::operation::Failure;

    fn start() -> BatchStart {
        BatchStart {
            batch_id: Uuid::new_v4(),
            description: "Running suite#case, 2 times, 2 in parallel".to_string(),
            operation_name: "suite#case".to_string(),
            quantity: 2,
            parallelism: 2,
        }
    }

    fn run(run_index: usize, outcome: Outcome) -> RunResult {
        RunResult {
            operation_name: "suite#case".to_string(),
            run_index,
            outcome,
            captured_output: Vec::new(),
            duration: Duration::from_millis(250),
            attempts: 1,
            flaky: false,
        }
    }

    #[tokio::test]
    async fn test_digest_written_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = DigestReporter::new(true, dir.path().join("digest.md"));
        let results = vec![
            run(0, Outcome::Pass),
            run(1, Outcome::Fail {
                causes: vec![Failure::new("assertion failed")],
            }),
        ];

        reporter.on_batch_start(&start()).await.unwrap();
        for r in &results {
            reporter.on_run_complete(r).await.unwrap();
        }
        let now = Utc::now();
        let batch = BatchResult {
            batch_id: Uuid::new_v4(),
            operation_name: "suite#case".to_string(),
            quantity: 2,
            results,
            started_at: now,
            finished_at: now,
            timed_out: false,
        };
        reporter
            .on_batch_finish("Test Results: suite#case finished in 1.20s", &batch)
            .await
            .unwrap();
        reporter.close().await.unwrap();

        let md = std::fs::read_to_string(dir.path().join("digest.md")).unwrap();
        assert!(md.starts_with("*Running suite#case, 2 times, 2 in parallel*"));
        assert!(md.contains(":x: run 1 (250ms, 1 attempt): `assertion failed`"));
        assert!(md.trim_end().ends_with("*Test Results: suite#case finished in 1.20s*"));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(reporter.json_path()).unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["runs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_without_finish_writes_aborted_digest() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = DigestReporter::new(true, dir.path().join("digest.md"));

        reporter.on_batch_start(&start()).await.unwrap();
        reporter.close().await.unwrap();

        let md = std::fs::read_to_string(dir.path().join("digest.md")).unwrap();
        assert!(md.contains("aborted"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(reporter.json_path()).unwrap()).unwrap();
        assert_eq!(json["status"], "aborted");
    }

    #[tokio::test]
    async fn test_run_before_start_is_an_error() {
        let reporter = DigestReporter::new(true, PathBuf::from("unused.md"));
        let err = reporter.on_run_complete(&run(0, Outcome::Pass)).await.unwrap_err();
        assert!(matches!(err, ReportError::NotStarted(_)));
    }
}
