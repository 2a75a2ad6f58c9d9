//! JUnit XML report generation.
//!
//! Emits the JUnit schema CI systems ingest (Jenkins, GitLab, GitHub
//! Actions, CircleCI): one `<testsuite>` with one `<testcase>` per classified
//! job, carrying captured output and a `<failure>`/`<error>`/`<skipped>`
//! child according to the classification.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" time="1.234">
//!   <testsuite name="gridtest" tests="3" failures="1" errors="0" skipped="0" time="1.234">
//!     <testcase name="pkg-class1-check_add-c1a" time="0.100"/>
//!     <testcase name="pkg-class1-check_sub-c1a" time="0.150">
//!       <failure message="Exception: boom" type="Exception">...</failure>
//!       <system-out>captured stdout</system-out>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{ReportSink, ReportedCase, RunReport};
use crate::classify::TestStatus;

/// Sink that writes a JUnit XML file.
///
/// Parent directories are created automatically; an existing file is
/// overwritten.
pub struct JUnitSink {
    output_path: PathBuf,
}

impl JUnitSink {
    /// Creates a sink writing to `output_path`.
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Renders the report as a JUnit XML document.
    pub fn render(report: &RunReport) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let stats = &report.stats;
        let tests = stats.total();
        let failures = stats.bucket(TestStatus::Failed).len();
        let errors = stats.bucket(TestStatus::Error).len();
        let skipped = stats.bucket(TestStatus::Skipped).len();
        let time: f64 = report.cases.iter().filter_map(|c| c.elapsed_sec).sum();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{time:.3}").as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", report.suite_name.as_str()));
        testsuite.push_attribute(("tests", tests.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", errors.to_string().as_str()));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute(("time", format!("{time:.3}").as_str()));
        testsuite.push_attribute((
            "timestamp",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string().as_str(),
        ));
        writer.write_event(Event::Start(testsuite))?;

        for case in &report.cases {
            write_testcase(&mut writer, case)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    case: &ReportedCase,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("name", sanitize_text(&case.job_id).as_str()));
    if let Some(elapsed) = case.elapsed_sec {
        testcase.push_attribute(("time", format!("{elapsed:.3}").as_str()));
    }

    let child = match case.status {
        TestStatus::Success => None,
        TestStatus::Failed => Some(("failure", "Exception")),
        TestStatus::Error => Some(("error", "Error")),
        TestStatus::Skipped => Some(("skipped", "Skipped")),
    };

    if child.is_none() && case.stdout.is_empty() && case.stderr.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    if let Some((element, kind)) = child {
        let mut start = BytesStart::new(element);
        if let Some(message) = &case.message {
            start.push_attribute(("message", sanitize_text(message).as_str()));
        }
        start.push_attribute(("type", kind));
        match &case.detail {
            Some(detail) => {
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(&sanitize_text(detail))))?;
                writer.write_event(Event::End(BytesEnd::new(element)))?;
            }
            None => writer.write_event(Event::Empty(start))?,
        }
    }

    if !case.stdout.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&sanitize_text(&case.stdout))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }
    if !case.stderr.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-err")))?;
        writer.write_event(Event::Text(BytesText::new(&sanitize_text(&case.stderr))))?;
        writer.write_event(Event::End(BytesEnd::new("system-err")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters the XML 1.0 charset forbids. Entity escaping is left to
/// the writer; doing it here too would double-encode.
fn sanitize_text(s: &str) -> String {
    s.chars()
        .filter(|c| {
            matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..)
        })
        .collect()
}

#[async_trait]
impl ReportSink for JUnitSink {
    async fn emit(&self, report: &RunReport) -> anyhow::Result<()> {
        let xml = Self::render(report)?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        tracing::info!("JUnit XML written to: {}", self.output_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{JobCacheRecord, JobState, MemoryCacheStore};
    use crate::classify::Classifier;
    use crate::report::build_report;

    fn sample_report() -> RunReport {
        let mut failed = JobCacheRecord::new(JobState::Failed);
        failed.exception = Some("Exception: boom <tag>".to_string());
        failed.backtrace = Some("at line 3".to_string());
        let mut done = JobCacheRecord::new(JobState::Done);
        done.cputime_used = Some(0.25);
        done.captured_stdout = Some("hello".to_string());
        let store = MemoryCacheStore::new()
            .with_job("m-t1", done)
            .with_job("m-t2", failed)
            .with_job("m-t4", JobCacheRecord::new(JobState::NotStarted));
        build_report(&store, Classifier::new(), "gridtest_suite").unwrap()
    }

    #[test]
    fn test_render_counts_and_cases() {
        let xml = JUnitSink::render(&sample_report()).unwrap();
        assert!(xml.contains("<testsuite name=\"gridtest_suite\""));
        assert!(xml.contains("tests=\"3\""));
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("errors=\"1\""));
        assert!(xml.contains("<testcase name=\"m-t1\" time=\"0.250\""));
        assert!(xml.contains("<system-out>hello</system-out>"));
    }

    #[test]
    fn test_render_escapes_markup() {
        let xml = JUnitSink::render(&sample_report()).unwrap();
        assert!(xml.contains("boom &lt;tag&gt;"));
        assert!(!xml.contains("boom <tag>"));
    }

    #[test]
    fn test_error_case_carries_fixed_message() {
        let xml = JUnitSink::render(&sample_report()).unwrap();
        assert!(xml.contains("<error message=\"Job not started.\" type=\"Error\"/>"));
    }

    #[test]
    fn test_sanitize_drops_forbidden_chars() {
        assert_eq!(sanitize_text("a\u{0}b\u{7}c"), "abc");
        assert_eq!(sanitize_text("line\nbreak\ttab"), "line\nbreak\ttab");
    }

    #[tokio::test]
    async fn test_emit_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("junit.xml");
        let sink = JUnitSink::new(path.clone());
        sink.emit(&sample_report()).await.unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("<?xml version=\"1.0\""));
    }
}
