//! Plain-text triage files: one `{status}_{count}.txt` per status.
//!
//! The count lives in the file name so a CI page listing the artifact
//! directory already tells the whole story; the content is the
//! space-separated sorted job-id list for copy-pasting into a shell.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{ReportSink, RunReport};
use crate::classify::TestStatus;

/// Sink that writes per-status job-id lists into a directory.
pub struct TextSink {
    output_dir: PathBuf,
}

impl TextSink {
    /// Creates a sink writing into `output_dir`.
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    /// Removes `{status}_*.txt` leftovers from a previous run; counts change
    /// between runs, so stale files would otherwise accumulate.
    fn clear_previous(&self) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stale = TestStatus::ALL.iter().any(|status| {
                name.strip_prefix(status.as_str())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .and_then(|rest| rest.strip_suffix(".txt"))
                    .is_some_and(|middle| middle.chars().all(|c| c.is_ascii_digit()))
            });
            if stale {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReportSink for TextSink {
    async fn emit(&self, report: &RunReport) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        self.clear_previous()?;
        for status in TestStatus::ALL {
            let ids = report.stats.bucket(status);
            let file_name = format!("{}_{}.txt", status.as_str(), ids.len());
            let mut content = ids.iter().cloned().collect::<Vec<_>>().join(" ");
            content.push('\n');
            std::fs::write(self.output_dir.join(&file_name), content)?;
            tracing::debug!(file = file_name, "wrote status list");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{JobCacheRecord, JobState, MemoryCacheStore};
    use crate::classify::Classifier;
    use crate::report::build_report;

    fn report() -> RunReport {
        let mut failed = JobCacheRecord::new(JobState::Failed);
        failed.exception = Some("Exception: boom".to_string());
        let store = MemoryCacheStore::new()
            .with_job("m-b", JobCacheRecord::new(JobState::Done))
            .with_job("m-a", JobCacheRecord::new(JobState::Done))
            .with_job("m-c", failed);
        build_report(&store, Classifier::new(), "suite").unwrap()
    }

    #[tokio::test]
    async fn test_writes_one_file_per_status() {
        let dir = tempfile::tempdir().unwrap();
        TextSink::new(dir.path().to_path_buf()).emit(&report()).await.unwrap();

        let success = std::fs::read_to_string(dir.path().join("success_2.txt")).unwrap();
        assert_eq!(success, "m-a m-b\n");
        let failed = std::fs::read_to_string(dir.path().join("failed_1.txt")).unwrap();
        assert_eq!(failed, "m-c\n");
        assert!(dir.path().join("skipped_0.txt").exists());
        assert!(dir.path().join("error_0.txt").exists());
    }

    #[tokio::test]
    async fn test_stale_lists_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("success_9.txt"), "old\n").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "keep\n").unwrap();

        TextSink::new(dir.path().to_path_buf()).emit(&report()).await.unwrap();
        assert!(!dir.path().join("success_9.txt").exists());
        assert!(dir.path().join("success_2.txt").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
