//! Report aggregation and output sinks.

pub mod junit;
pub mod text;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::cache::{CacheError, CacheStore, JobCacheRecord, JobState};
use crate::classify::{Classification, Classifier, KnownFailureUse, TestStatus, strip_escapes};

pub use junit::JUnitSink;
pub use text::TextSink;

/// One classified job, ready for emission.
#[derive(Debug, Clone)]
pub struct ReportedCase {
    pub job_id: String,
    pub status: TestStatus,
    pub message: Option<String>,
    pub detail: Option<String>,
    /// Captured stdout, escapes stripped.
    pub stdout: String,
    /// Captured stderr, escapes stripped.
    pub stderr: String,
    /// CPU seconds, known only for jobs that ran to completion.
    pub elapsed_sec: Option<f64>,
}

/// Per-status job-id sets plus known-failure bookkeeping.
///
/// The four status buckets partition the classified job set: every job id
/// lands in exactly one bucket. The stats are recomputed fully on every run,
/// never updated incrementally.
#[derive(Debug, Clone)]
pub struct RunStats {
    buckets: BTreeMap<TestStatus, BTreeSet<String>>,
    /// Known-failure entries consumed by jobs that failed, as declared.
    pub used_known_failures: BTreeSet<String>,
    /// Known-failure entries consumed by jobs that passed anyway.
    pub unexpected_passes: BTreeSet<String>,
    /// Jobs that never executed (`not_started` or `blocked`); also present
    /// in their status bucket, tracked separately for the summary.
    pub never_ran: BTreeSet<String>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    /// Empty stats with all four buckets present.
    pub fn new() -> Self {
        let buckets = TestStatus::ALL
            .iter()
            .map(|status| (*status, BTreeSet::new()))
            .collect();
        Self {
            buckets,
            used_known_failures: BTreeSet::new(),
            unexpected_passes: BTreeSet::new(),
            never_ran: BTreeSet::new(),
        }
    }

    fn record(&mut self, job_id: &str, classification: &Classification, state: JobState) {
        if let Some(bucket) = self.buckets.get_mut(&classification.status) {
            bucket.insert(job_id.to_string());
        }
        match classification.known_failure {
            Some(KnownFailureUse::AsExpected) => {
                self.used_known_failures.insert(job_id.to_string());
            }
            Some(KnownFailureUse::UnexpectedlyPassed) => {
                self.unexpected_passes.insert(job_id.to_string());
            }
            None => {}
        }
        if matches!(state, JobState::NotStarted | JobState::Blocked) {
            self.never_ran.insert(job_id.to_string());
        }
    }

    /// The job ids classified with `status`.
    pub fn bucket(&self, status: TestStatus) -> &BTreeSet<String> {
        // All four buckets exist from construction.
        &self.buckets[&status]
    }

    /// Bucket size per status.
    pub fn counts(&self) -> BTreeMap<TestStatus, usize> {
        self.buckets.iter().map(|(s, ids)| (*s, ids.len())).collect()
    }

    /// Total classified jobs.
    pub fn total(&self) -> usize {
        self.buckets.values().map(BTreeSet::len).sum()
    }

    /// Jobs that count against the run: failed plus error.
    pub fn failed_or_error(&self) -> usize {
        self.bucket(TestStatus::Failed).len() + self.bucket(TestStatus::Error).len()
    }

    /// Checks the partition law against a job universe: the buckets are
    /// pairwise disjoint and their union is exactly `universe`.
    pub fn is_partition_of(&self, universe: &BTreeSet<String>) -> bool {
        let mut seen = BTreeSet::new();
        for ids in self.buckets.values() {
            for id in ids {
                if !seen.insert(id.clone()) {
                    return false;
                }
            }
        }
        seen == *universe
    }
}

/// A complete classified run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Test-suite name used in the JUnit output.
    pub suite_name: String,
    /// One case per classified job, in classification order.
    pub cases: Vec<ReportedCase>,
    /// Aggregated per-status sets.
    pub stats: RunStats,
}

impl RunReport {
    /// Exit code for the orchestrating process: nonzero only when failures
    /// exist *and* the caller asked to fail on them.
    pub fn exit_code(&self, fail_if_failed: bool) -> i32 {
        if fail_if_failed && self.stats.failed_or_error() > 0 {
            2
        } else {
            0
        }
    }
}

/// Incremental report assembly, one job at a time.
///
/// Drives [`Classifier::classify`] and folds results into [`RunStats`];
/// the binary feeds it job by job so it can show progress.
pub struct ReportBuilder {
    suite_name: String,
    classifier: Classifier,
    cases: Vec<ReportedCase>,
    stats: RunStats,
    universe: BTreeSet<String>,
}

impl ReportBuilder {
    /// Starts a report for `suite_name`.
    pub fn new(suite_name: impl Into<String>, classifier: Classifier) -> Self {
        Self {
            suite_name: suite_name.into(),
            classifier,
            cases: Vec::new(),
            stats: RunStats::new(),
            universe: BTreeSet::new(),
        }
    }

    /// Classifies one job and records it.
    pub fn add(&mut self, job_id: &str, cache: &JobCacheRecord) {
        let classification = self.classifier.classify(job_id, cache);
        self.stats.record(job_id, &classification, cache.state);
        self.universe.insert(job_id.to_string());
        let elapsed_sec = match cache.state {
            JobState::Done => cache.cputime_used,
            _ => None,
        };
        self.cases.push(ReportedCase {
            job_id: job_id.to_string(),
            status: classification.status,
            message: classification.message,
            detail: classification.detail,
            stdout: cache.captured_stdout.as_deref().map(strip_escapes).unwrap_or_default(),
            stderr: cache.captured_stderr.as_deref().map(strip_escapes).unwrap_or_default(),
            elapsed_sec,
        });
    }

    /// Finishes the report, warning about stale known-failure entries.
    pub fn finish(self) -> RunReport {
        let consumed: BTreeSet<String> = self
            .stats
            .used_known_failures
            .union(&self.stats.unexpected_passes)
            .cloned()
            .collect();
        for stale in self.classifier.known_failures().difference(&consumed) {
            tracing::warn!(job_id = %stale, "known-failure entry matched no job; prune it");
        }
        debug_assert!(self.stats.is_partition_of(&self.universe));
        RunReport {
            suite_name: self.suite_name,
            cases: self.cases,
            stats: self.stats,
        }
    }
}

/// Builds a complete report from a cache store.
pub fn build_report(
    store: &dyn CacheStore,
    classifier: Classifier,
    suite_name: &str,
) -> Result<RunReport, CacheError> {
    let mut builder = ReportBuilder::new(suite_name, classifier);
    for job_id in store.all_jobs()? {
        let cache = store.job_cache(&job_id)?;
        builder.add(&job_id, &cache);
    }
    Ok(builder.finish())
}

/// An output sink for a finished report.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Emits the report.
    async fn emit(&self, report: &RunReport) -> anyhow::Result<()>;
}

/// A sink that fans out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl MultiSink {
    /// Creates an empty multi-sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with_sink<S: ReportSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[async_trait]
impl ReportSink for MultiSink {
    async fn emit(&self, report: &RunReport) -> anyhow::Result<()> {
        for sink in &self.sinks {
            sink.emit(report).await?;
        }
        Ok(())
    }
}

/// Prints a styled per-status summary to the terminal.
pub struct ConsoleSink;

#[async_trait]
impl ReportSink for ConsoleSink {
    async fn emit(&self, report: &RunReport) -> anyhow::Result<()> {
        let stats = &report.stats;
        println!();
        println!("Test results for {}:", report.suite_name);
        println!("  Total:   {}", stats.total());
        println!(
            "  Success: {}",
            console::style(stats.bucket(TestStatus::Success).len()).green()
        );
        println!(
            "  Failed:  {}",
            console::style(stats.bucket(TestStatus::Failed).len()).red()
        );
        println!(
            "  Error:   {}",
            console::style(stats.bucket(TestStatus::Error).len()).red().bold()
        );
        println!(
            "  Skipped: {}",
            console::style(stats.bucket(TestStatus::Skipped).len()).yellow()
        );
        if !stats.never_ran.is_empty() {
            println!(
                "  Never ran: {}",
                console::style(stats.never_ran.len()).red().bold()
            );
        }
        if !stats.used_known_failures.is_empty() {
            println!("  Known failures used: {}", stats.used_known_failures.len());
        }
        if !stats.unexpected_passes.is_empty() {
            println!(
                "  {}",
                console::style(format!(
                    "Known failures that passed: {}",
                    stats.unexpected_passes.len()
                ))
                .red()
            );
            for job_id in &stats.unexpected_passes {
                println!("    - {job_id}");
            }
        }

        if stats.failed_or_error() == 0 {
            println!();
            println!("{}", console::style("No failures.").green().bold());
        } else {
            println!();
            println!("Failed jobs:");
            for case in &report.cases {
                if matches!(case.status, TestStatus::Failed | TestStatus::Error) {
                    println!("  - {}", case.job_id);
                    if let Some(message) = &case.message {
                        for line in message.lines().take(3) {
                            println!("    {}", console::style(line).dim());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
