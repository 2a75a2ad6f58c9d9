//! The external scheduler's per-job cache, as this crate reads it.
//!
//! After a run, the scheduler leaves one terminal cache record per job:
//! lifecycle state, captured output, exception text, and resource markers.
//! This crate only ever reads those records. [`FsCacheStore`] understands the
//! on-disk layout (one JSON file per job); [`MemoryCacheStore`] backs tests
//! and embedders that already hold the records.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Result-type value a skipping test leaves in its cache record.
pub const RESULT_SKIPPED: &str = "Skipped";

/// Errors reading a job cache store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The store directory could not be enumerated.
    #[error("cannot list job cache at {path}")]
    ListFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A job id was requested that the store does not contain.
    #[error("no cache record for job {job_id:?}")]
    MissingJob { job_id: String },

    /// A record exists but could not be read.
    #[error("cannot read cache record for job {job_id:?}")]
    ReadFailed {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A record exists but is not valid JSON for the expected shape.
    ///
    /// This is a hard error rather than a warn-and-skip: a report that
    /// silently drops jobs is worse than no report.
    #[error("cannot parse cache record for job {job_id:?}")]
    ParseFailed {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Lifecycle state of a job in the scheduler's cache.
///
/// `Done` and `Failed` are the only terminal states of a completed run;
/// the other three mean the run was interrupted or the graph never fully
/// executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Blocked,
    Processing,
    Done,
    Failed,
}

/// One job's terminal cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCacheRecord {
    /// Lifecycle state at the time the report is generated.
    pub state: JobState,

    /// CPU seconds the job used, when it ran to completion.
    #[serde(default)]
    pub cputime_used: Option<f64>,

    /// Captured standard output, possibly with terminal escapes.
    #[serde(default)]
    pub captured_stdout: Option<String>,

    /// Captured standard error, possibly with terminal escapes.
    #[serde(default)]
    pub captured_stderr: Option<String>,

    /// Exception text for failed jobs.
    #[serde(default)]
    pub exception: Option<String>,

    /// Backtrace for failed jobs.
    #[serde(default)]
    pub backtrace: Option<String>,

    /// Name of the result type the job produced (e.g. `"Skipped"`).
    #[serde(default)]
    pub result_type: Option<String>,

    /// The job was killed for exceeding its time budget.
    #[serde(default)]
    pub timed_out: bool,

    /// The job was killed for exceeding its memory budget.
    #[serde(default)]
    pub oom: bool,
}

impl JobCacheRecord {
    /// A minimal record in the given state; everything else absent.
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            cputime_used: None,
            captured_stdout: None,
            captured_stderr: None,
            exception: None,
            backtrace: None,
            result_type: None,
            timed_out: false,
            oom: false,
        }
    }

    /// Whether the job was killed on its time budget.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Whether the job was killed on its memory budget.
    pub fn is_oom(&self) -> bool {
        self.oom
    }

    /// Whether the job's result says the test skipped itself.
    pub fn is_skipped_test(&self) -> bool {
        self.result_type.as_deref() == Some(RESULT_SKIPPED)
    }
}

/// Read-only access to a run's job cache.
pub trait CacheStore {
    /// All job ids in the store, sorted.
    fn all_jobs(&self) -> Result<Vec<String>, CacheError>;

    /// The cache record for one job.
    fn job_cache(&self, job_id: &str) -> Result<JobCacheRecord, CacheError>;
}

/// Filesystem store: one `{job_id}.json` record per job under a root
/// directory.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Opens a store rooted at `root`. The directory is not touched until a
    /// read happens.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{job_id}.json"))
    }
}

impl CacheStore for FsCacheStore {
    fn all_jobs(&self) -> Result<Vec<String>, CacheError> {
        let entries = fs::read_dir(&self.root).map_err(|source| CacheError::ListFailed {
            path: self.root.clone(),
            source,
        })?;
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::ListFailed {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                jobs.push(stem.to_string());
            }
        }
        jobs.sort();
        tracing::debug!(count = jobs.len(), root = %self.root.display(), "listed job cache");
        Ok(jobs)
    }

    fn job_cache(&self, job_id: &str) -> Result<JobCacheRecord, CacheError> {
        let path = self.record_path(job_id);
        let contents = fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CacheError::MissingJob {
                    job_id: job_id.to_string(),
                }
            } else {
                CacheError::ReadFailed {
                    job_id: job_id.to_string(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&contents).map_err(|source| CacheError::ParseFailed {
            job_id: job_id.to_string(),
            source,
        })
    }
}

/// In-memory store, for tests and embedders that already hold the records.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    jobs: BTreeMap<String, JobCacheRecord>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, replacing any previous one for the same id.
    pub fn insert(&mut self, job_id: impl Into<String>, record: JobCacheRecord) {
        self.jobs.insert(job_id.into(), record);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_job(mut self, job_id: impl Into<String>, record: JobCacheRecord) -> Self {
        self.insert(job_id, record);
        self
    }
}

impl CacheStore for MemoryCacheStore {
    fn all_jobs(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.jobs.keys().cloned().collect())
    }

    fn job_cache(&self, job_id: &str) -> Result<JobCacheRecord, CacheError> {
        self.jobs.get(job_id).cloned().ok_or_else(|| CacheError::MissingJob {
            job_id: job_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&JobState::NotStarted).unwrap();
        assert_eq!(json, "\"not_started\"");
        let back: JobState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, JobState::Failed);
    }

    #[test]
    fn test_record_defaults_from_minimal_json() {
        let record: JobCacheRecord = serde_json::from_str(r#"{"state": "done"}"#).unwrap();
        assert_eq!(record.state, JobState::Done);
        assert!(record.exception.is_none());
        assert!(!record.is_timed_out());
        assert!(!record.is_skipped_test());
    }

    #[test]
    fn test_skipped_result_type() {
        let mut record = JobCacheRecord::new(JobState::Done);
        record.result_type = Some(RESULT_SKIPPED.to_string());
        assert!(record.is_skipped_test());
    }

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let record = JobCacheRecord::new(JobState::Done);
        std::fs::write(
            dir.path().join("m-t1.json"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FsCacheStore::new(dir.path());
        assert_eq!(store.all_jobs().unwrap(), vec!["m-t1".to_string()]);
        assert_eq!(store.job_cache("m-t1").unwrap().state, JobState::Done);
        assert!(matches!(
            store.job_cache("absent").unwrap_err(),
            CacheError::MissingJob { .. }
        ));
    }

    #[test]
    fn test_fs_store_rejects_garbage_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FsCacheStore::new(dir.path());
        assert!(matches!(
            store.job_cache("bad").unwrap_err(),
            CacheError::ParseFailed { .. }
        ));
    }

    #[test]
    fn test_memory_store_sorted_ids() {
        let store = MemoryCacheStore::new()
            .with_job("b", JobCacheRecord::new(JobState::Done))
            .with_job("a", JobCacheRecord::new(JobState::Failed));
        assert_eq!(store.all_jobs().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
