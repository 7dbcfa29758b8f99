//! JUnit XML report generation.
//!
//! Writes one `<testcase>` per run of the batch so CI dashboards show how
//! often the operation failed. Runs that never started because the batch
//! timed out are reported as skipped.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" time="12.345">
//!   <testsuite name="checkout" tests="3" failures="1" errors="0" skipped="1" time="12.345">
//!     <testcase classname="checkout" name="test_pay [run 0]" time="4.100"/>
//!     <testcase classname="checkout" name="test_pay [run 1]" time="4.020">
//!       <failure message="`cargo test` exited with exit status: 101" type="AssertionError">
//!         thread 'test_pay' panicked
//!       </failure>
//!       <system-out>...</system-out>
//!     </testcase>
//!     <testcase classname="checkout" name="test_pay [run 2]" time="0.000">
//!       <skipped message="not run before the batch timed out"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use volley::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("test-results/volley.xml".into())
//!     .with_testsuite_name("checkout-flakiness");
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{BatchStart, ReportError, ReportResult, Reporter};
use crate::executor::RunResult;
use crate::orchestrator::BatchResult;

/// Reporter that writes a JUnit XML file when the batch finishes.
///
/// Parent directories are created automatically if they don't exist.
pub struct JUnitReporter {
    enabled: bool,
    output_path: PathBuf,
    testsuite_name: Option<String>,
}

impl JUnitReporter {
    /// Creates an enabled JUnit reporter that writes to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            enabled: true,
            output_path,
            testsuite_name: None,
        }
    }

    /// Sets the test suite name in the XML output.
    ///
    /// Defaults to the part of the operation name before `#` or `::`.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = Some(name.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Generate JUnit XML content for a finished batch.
    fn generate_xml(&self, batch: &BatchResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let (classname, _) = parse_test_id(&batch.operation_name);
        let suite_name = self.testsuite_name.clone().unwrap_or_else(|| classname.clone());

        let tests = batch.quantity;
        let failures = batch.failed();
        let skipped = batch.missing();
        let time = format!("{:.3}", batch.duration().as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", "0"));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", suite_name.as_str()));
        testsuite.push_attribute(("tests", tests.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", "0"));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", batch.started_at.to_rfc3339().as_str()));
        writer.write_event(Event::Start(testsuite))?;

        let mut results: Vec<&RunResult> = batch.results.iter().collect();
        results.sort_by_key(|r| r.run_index);
        for result in &results {
            write_testcase(&mut writer, result)?;
        }

        let collected: HashSet<usize> = results.iter().map(|r| r.run_index).collect();
        for run_index in (0..batch.quantity).filter(|i| !collected.contains(i)) {
            write_skipped(&mut writer, &batch.operation_name, run_index)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }

    fn write_file(&self, xml: String) -> ReportResult<()> {
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        tracing::info!("JUnit XML written to: {}", self.output_path.display());
        Ok(())
    }
}

fn testcase_start(operation_name: &str, run_index: usize, seconds: f64) -> BytesStart<'static> {
    let (classname, name) = parse_test_id(operation_name);
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", format!("{} [run {}]", name, run_index).as_str()));
    testcase.push_attribute(("time", format!("{:.3}", seconds).as_str()));
    testcase
}

/// Write a single test case element for a collected run.
fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, result: &RunResult) -> anyhow::Result<()> {
    let testcase = testcase_start(
        &result.operation_name,
        result.run_index,
        result.duration.as_secs_f64(),
    );

    let causes = result.outcome.causes();
    if causes.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    for cause in causes {
        let mut failure = BytesStart::new("failure");
        failure.push_attribute(("message", strip_invalid_xml(&cause.message).as_str()));
        failure.push_attribute(("type", "AssertionError"));
        match &cause.trace {
            Some(trace) => {
                writer.write_event(Event::Start(failure))?;
                writer.write_event(Event::Text(BytesText::new(&strip_invalid_xml(trace))))?;
                writer.write_event(Event::End(BytesEnd::new("failure")))?;
            }
            None => writer.write_event(Event::Empty(failure))?,
        }
    }

    if !result.captured_output.is_empty() {
        let output = String::from_utf8_lossy(&result.captured_output);
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&strip_invalid_xml(&output))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn write_skipped<W: std::io::Write>(
    writer: &mut Writer<W>,
    operation_name: &str,
    run_index: usize,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(testcase_start(operation_name, run_index, 0.0)))?;
    let mut skipped = BytesStart::new("skipped");
    skipped.push_attribute(("message", "not run before the batch timed out"));
    writer.write_event(Event::Empty(skipped))?;
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    fn name(&self) -> &str {
        "junit"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn initialize(&self) -> ReportResult<()> {
        // Fail early on an unwritable location rather than after the batch.
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    async fn on_batch_start(&self, _start: &BatchStart) -> ReportResult<()> {
        Ok(())
    }

    async fn on_batch_finish(&self, _summary: &str, batch: &BatchResult) -> ReportResult<()> {
        let xml = self
            .generate_xml(batch)
            .map_err(|e| ReportError::Render(e.to_string()))?;
        self.write_file(xml)
    }
}

/// Parse an operation name into classname and name components.
///
/// Accepts `suite#case`, `tests/login.rs::case` and `module::case`.
fn parse_test_id(id: &str) -> (String, String) {
    let split = id
        .rfind('#')
        .map(|idx| (idx, 1))
        .or_else(|| id.rfind("::").map(|idx| (idx, 2)));

    if let Some((idx, len)) = split {
        let classname = id[..idx]
            .replace("::", ".")
            .replace('/', ".")
            .replace(".py", "")
            .replace(".rs", "");
        (classname, id[idx + len..].to_string())
    } else {
        ("volley".to_string(), id.to_string())
    }
}

/// Remove characters that are not allowed in XML 1.0 documents.
///
/// Escaping of markup characters is left to the writer.
fn strip_invalid_xml(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
