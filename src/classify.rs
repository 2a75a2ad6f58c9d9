//! Classification of terminal job caches into report statuses.
//!
//! The classifier is a pure function of one job's cache record and the
//! known-failures set: the same inputs always produce the same
//! [`Classification`], and nothing here ever writes back to the cache.
//!
//! The state machine, by cache state:
//!
//! | state | condition | status |
//! |---|---|---|
//! | done | job is a known failure | error (it was supposed to fail) |
//! | done | result says skip | skipped |
//! | done | — | success |
//! | failed | job is a known failure | skipped (tolerated, tracked) |
//! | failed | skip marker / timeout / OOM | skipped (environmental) |
//! | failed | — | failed |
//! | processing | — | skipped (run was interrupted; policy-configurable) |
//! | not_started | — | error ("Job not started.") |
//! | blocked | — | skipped (upstream failed) |
//!
//! Interrupted (`processing`) jobs default to skipped because a cancelled
//! run is not a test regression; `InterruptedPolicy::Error` restores the
//! stricter reading.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cache::{JobCacheRecord, JobState};

/// Default ceiling for message and detail text in reports.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

/// Marker appended to clipped messages.
///
/// CI dashboards must be able to tell a message was shortened; clipping is
/// never silent.
pub const CLIP_MARKER: &str = "... [clipped]";

/// Default markers whose presence in exception text means the failure was a
/// runner-level skip, not a regression.
pub const DEFAULT_SKIP_MARKERS: &[&str] = &["SkipTest"];

/// Report status of one classified job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Success,
    Skipped,
    Failed,
    Error,
}

impl TestStatus {
    /// All statuses, in bucket order.
    pub const ALL: [TestStatus; 4] = [
        TestStatus::Success,
        TestStatus::Skipped,
        TestStatus::Failed,
        TestStatus::Error,
    ];

    /// Lowercase name, used in text-file names and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Success => "success",
            TestStatus::Skipped => "skipped",
            TestStatus::Failed => "failed",
            TestStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to report a job left in `processing` state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptedPolicy {
    /// The run was interrupted; not a pass/fail signal.
    #[default]
    Skip,
    /// Treat interruption as a reporting error.
    Error,
}

/// How a known-failure entry was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownFailureUse {
    /// The job failed, as declared.
    AsExpected,
    /// The job passed although it was declared failing — a regression in the
    /// known-failures list itself.
    UnexpectedlyPassed,
}

/// Outcome of classifying one job. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: TestStatus,
    /// Short human-readable reason, already stripped and clipped.
    pub message: Option<String>,
    /// Longer detail (exception plus backtrace), stripped and clipped.
    pub detail: Option<String>,
    /// Set when a known-failure entry was consumed for this job.
    pub known_failure: Option<KnownFailureUse>,
}

impl Classification {
    fn status_only(status: TestStatus) -> Self {
        Self {
            status,
            message: None,
            detail: None,
            known_failure: None,
        }
    }

    fn with_message(status: TestStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            detail: None,
            known_failure: None,
        }
    }
}

/// Strips ANSI escape sequences and stray control characters from captured
/// text. Terminal color codes are meaningless in a static XML report and can
/// corrupt it.
pub fn strip_escapes(s: &str) -> String {
    let stripped: Cow<'_, str> = console::strip_ansi_codes(s);
    stripped
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

/// Clips `s` to at most `max_len` characters, appending [`CLIP_MARKER`] when
/// anything was cut.
pub fn clip_message(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(CLIP_MARKER.chars().count());
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(CLIP_MARKER);
    out
}

/// Classifies terminal job caches against a known-failures set.
#[derive(Debug, Clone)]
pub struct Classifier {
    known_failures: BTreeSet<String>,
    interrupted: InterruptedPolicy,
    max_message_len: usize,
    skip_markers: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// A classifier with no known failures and default policies.
    pub fn new() -> Self {
        Self {
            known_failures: BTreeSet::new(),
            interrupted: InterruptedPolicy::default(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            skip_markers: DEFAULT_SKIP_MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replaces the known-failures set.
    pub fn with_known_failures(mut self, known_failures: BTreeSet<String>) -> Self {
        self.known_failures = known_failures;
        self
    }

    /// Adds one known-failure job id.
    pub fn add_known_failure(&mut self, job_id: impl Into<String>) {
        self.known_failures.insert(job_id.into());
    }

    /// Sets the policy for jobs found still `processing`.
    pub fn with_interrupted_policy(mut self, policy: InterruptedPolicy) -> Self {
        self.interrupted = policy;
        self
    }

    /// Sets the message/detail length ceiling.
    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_message_len = max_len;
        self
    }

    /// Replaces the exception-text skip markers.
    pub fn with_skip_markers(mut self, markers: Vec<String>) -> Self {
        self.skip_markers = markers;
        self
    }

    /// The known-failure job ids this classifier consults.
    pub fn known_failures(&self) -> &BTreeSet<String> {
        &self.known_failures
    }

    fn clean(&self, s: &str) -> String {
        clip_message(&strip_escapes(s), self.max_message_len)
    }

    fn exception_mentions_skip(&self, cache: &JobCacheRecord) -> bool {
        let Some(exception) = cache.exception.as_deref() else {
            return false;
        };
        self.skip_markers.iter().any(|m| exception.contains(m))
    }

    /// Classifies one job's terminal cache record.
    ///
    /// Pure and idempotent: the same `(cache, known_failures)` pair always
    /// yields the same result. Jobs that never executed (`not_started`,
    /// `blocked`) are classified from their state alone — neither the
    /// known-failures set nor the exception text is consulted for them.
    pub fn classify(&self, job_id: &str, cache: &JobCacheRecord) -> Classification {
        match cache.state {
            JobState::Done => {
                if self.known_failures.contains(job_id) {
                    tracing::warn!(
                        job_id,
                        "known failure passed unexpectedly; prune it from the list"
                    );
                    return Classification {
                        status: TestStatus::Error,
                        message: Some(
                            "Job was declared a known failure but succeeded.".to_string(),
                        ),
                        detail: None,
                        known_failure: Some(KnownFailureUse::UnexpectedlyPassed),
                    };
                }
                if cache.is_skipped_test() {
                    return Classification::with_message(
                        TestStatus::Skipped,
                        "Test reported a skip result.",
                    );
                }
                Classification::status_only(TestStatus::Success)
            }
            JobState::Failed => {
                if self.known_failures.contains(job_id) {
                    tracing::info!(job_id, "known failure, failed as expected");
                    return Classification {
                        status: TestStatus::Skipped,
                        message: Some("Known failure.".to_string()),
                        detail: cache.exception.as_deref().map(|e| self.clean(e)),
                        known_failure: Some(KnownFailureUse::AsExpected),
                    };
                }
                let environmental = if cache.is_timed_out() {
                    Some("Job timed out.")
                } else if cache.is_oom() {
                    Some("Job ran out of memory.")
                } else if cache.is_skipped_test() || self.exception_mentions_skip(cache) {
                    Some("Test skipped.")
                } else {
                    None
                };
                if let Some(reason) = environmental {
                    return Classification {
                        status: TestStatus::Skipped,
                        message: Some(reason.to_string()),
                        detail: cache.exception.as_deref().map(|e| self.clean(e)),
                        known_failure: None,
                    };
                }
                let message = cache
                    .exception
                    .as_deref()
                    .map(|e| self.clean(e))
                    .unwrap_or_else(|| "Job failed without exception text.".to_string());
                let combined = format!(
                    "{}\n{}",
                    cache.exception.as_deref().unwrap_or(""),
                    cache.backtrace.as_deref().unwrap_or("")
                );
                Classification {
                    status: TestStatus::Failed,
                    message: Some(message),
                    detail: Some(self.clean(&combined)),
                    known_failure: None,
                }
            }
            JobState::Processing => {
                let status = match self.interrupted {
                    InterruptedPolicy::Skip => TestStatus::Skipped,
                    InterruptedPolicy::Error => TestStatus::Error,
                };
                Classification::with_message(status, "Job still processing. Probably interrupted.")
            }
            JobState::NotStarted => {
                Classification::with_message(TestStatus::Error, "Job not started.")
            }
            JobState::Blocked => {
                Classification::with_message(TestStatus::Skipped, "Job is blocked.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_with(exception: &str) -> JobCacheRecord {
        let mut record = JobCacheRecord::new(JobState::Failed);
        record.exception = Some(exception.to_string());
        record
    }

    fn known(ids: &[&str]) -> Classifier {
        Classifier::new().with_known_failures(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_done_is_success() {
        let mut record = JobCacheRecord::new(JobState::Done);
        record.result_type = Some("Success".to_string());
        let c = Classifier::new().classify("t1", &record);
        assert_eq!(c.status, TestStatus::Success);
        assert!(c.message.is_none());
        assert!(c.known_failure.is_none());
    }

    #[test]
    fn test_done_with_skip_result() {
        let mut record = JobCacheRecord::new(JobState::Done);
        record.result_type = Some("Skipped".to_string());
        let c = Classifier::new().classify("t1", &record);
        assert_eq!(c.status, TestStatus::Skipped);
    }

    #[test]
    fn test_failed_is_failed_with_exception_text() {
        let mut record = failed_with("Exception: boom");
        record.backtrace = Some("at line 3".to_string());
        let c = Classifier::new().classify("t2", &record);
        assert_eq!(c.status, TestStatus::Failed);
        assert!(c.message.as_deref().unwrap().contains("boom"));
        let detail = c.detail.as_deref().unwrap();
        assert!(detail.contains("boom"));
        assert!(detail.contains("at line 3"));
    }

    #[test]
    fn test_known_failure_that_fails_is_skipped() {
        let c = known(&["t3"]).classify("t3", &failed_with("Exception: expected"));
        assert_eq!(c.status, TestStatus::Skipped);
        assert_eq!(c.known_failure, Some(KnownFailureUse::AsExpected));
    }

    #[test]
    fn test_known_failure_that_passes_is_an_error() {
        let c = known(&["t3"]).classify("t3", &JobCacheRecord::new(JobState::Done));
        assert_eq!(c.status, TestStatus::Error);
        assert_eq!(c.known_failure, Some(KnownFailureUse::UnexpectedlyPassed));
    }

    #[test]
    fn test_not_started_is_error_with_fixed_message() {
        let c = Classifier::new().classify("t4", &JobCacheRecord::new(JobState::NotStarted));
        assert_eq!(c.status, TestStatus::Error);
        assert_eq!(c.message.as_deref(), Some("Job not started."));
    }

    #[test]
    fn test_blocked_is_skipped() {
        let c = Classifier::new().classify("t5", &JobCacheRecord::new(JobState::Blocked));
        assert_eq!(c.status, TestStatus::Skipped);
        assert_eq!(c.message.as_deref(), Some("Job is blocked."));
    }

    #[test]
    fn test_never_ran_ignores_known_failures_and_exception() {
        // A known-failure entry and exception text must not change the
        // outcome for jobs that never executed.
        let classifier = known(&["t6"]);
        let mut not_started = JobCacheRecord::new(JobState::NotStarted);
        not_started.exception = Some("SkipTest: irrelevant".to_string());
        let c = classifier.classify("t6", &not_started);
        assert_eq!(c.status, TestStatus::Error);
        assert!(c.known_failure.is_none());

        let mut blocked = JobCacheRecord::new(JobState::Blocked);
        blocked.exception = Some("Exception: irrelevant".to_string());
        let c = classifier.classify("t6", &blocked);
        assert_eq!(c.status, TestStatus::Skipped);
        assert!(c.known_failure.is_none());
    }

    #[test]
    fn test_processing_policy() {
        let record = JobCacheRecord::new(JobState::Processing);
        let skip = Classifier::new().classify("t7", &record);
        assert_eq!(skip.status, TestStatus::Skipped);

        let strict = Classifier::new().with_interrupted_policy(InterruptedPolicy::Error);
        assert_eq!(strict.classify("t7", &record).status, TestStatus::Error);
    }

    #[test]
    fn test_timeout_oom_and_skip_marker_are_environmental() {
        let mut timed_out = failed_with("Exception: killed");
        timed_out.timed_out = true;
        assert_eq!(
            Classifier::new().classify("t", &timed_out).status,
            TestStatus::Skipped
        );

        let mut oom = failed_with("Exception: killed");
        oom.oom = true;
        assert_eq!(Classifier::new().classify("t", &oom).status, TestStatus::Skipped);

        let marker = failed_with("nose.SkipTest: not on this platform");
        let c = Classifier::new().classify("t", &marker);
        assert_eq!(c.status, TestStatus::Skipped);
        assert_eq!(c.message.as_deref(), Some("Test skipped."));
    }

    #[test]
    fn test_classification_is_idempotent() {
        let classifier = known(&["a", "b"]);
        let record = failed_with("Exception: boom");
        let first = classifier.classify("x", &record);
        for _ in 0..5 {
            assert_eq!(classifier.classify("x", &record), first);
        }
    }

    #[test]
    fn test_clip_message_appends_marker() {
        let long = "x".repeat(5000);
        let clipped = clip_message(&long, 100);
        assert!(clipped.ends_with(CLIP_MARKER));
        assert_eq!(clipped.chars().count(), 100);

        let short = "short";
        assert_eq!(clip_message(short, 100), "short");
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        let long = "é".repeat(200);
        let clipped = clip_message(&long, 50);
        assert!(clipped.ends_with(CLIP_MARKER));
        assert_eq!(clipped.chars().count(), 50);
    }

    #[test]
    fn test_strip_escapes_removes_ansi() {
        let colored = "\u{1b}[31mred\u{1b}[0m plain";
        assert_eq!(strip_escapes(colored), "red plain");
        // Newlines and tabs survive.
        assert_eq!(strip_escapes("a\n\tb"), "a\n\tb");
    }

    #[test]
    fn test_failure_message_is_stripped_and_clipped() {
        let mut record = JobCacheRecord::new(JobState::Failed);
        record.exception = Some(format!("\u{1b}[31m{}\u{1b}[0m", "e".repeat(9000)));
        let classifier = Classifier::new().with_max_message_len(200);
        let c = classifier.classify("t", &record);
        let message = c.message.unwrap();
        assert!(!message.contains('\u{1b}'));
        assert!(message.ends_with(CLIP_MARKER));
        assert_eq!(message.chars().count(), 200);
    }
}
