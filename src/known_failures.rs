//! The operator-maintained known-failures list.
//!
//! A TOML table mapping job ids to a free-form annotation (usually a ticket
//! reference or a one-line excuse). Only the key set drives classification;
//! annotations show up in logs so operators can tell entries apart.
//!
//! ```toml
//! "pkg.tests-class1-check_codec-c1a" = "flaky on s390x, see #482"
//! "pkg.tests-simple_check" = { reason = "pending rewrite" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};

/// Known failures, keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct KnownFailures {
    entries: BTreeMap<String, String>,
}

impl KnownFailures {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a TOML known-failures file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read known-failures file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse known-failures file: {}", path.display()))
    }

    /// Parses a TOML known-failures document.
    ///
    /// Values of any TOML type are accepted; they are kept only as display
    /// text for logging.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content).context("invalid TOML")?;
        let entries = table
            .into_iter()
            .map(|(job_id, value)| {
                let annotation = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (job_id, annotation)
            })
            .collect();
        Ok(Self { entries })
    }

    /// Adds an entry, keeping an existing annotation for the same id.
    pub fn insert(&mut self, job_id: impl Into<String>, annotation: impl Into<String>) {
        self.entries.entry(job_id.into()).or_insert_with(|| annotation.into());
    }

    /// The key set consulted by the classifier.
    pub fn ids(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// The annotation for one job id, if present.
    pub fn annotation(&self, job_id: &str) -> Option<&str> {
        self.entries.get(job_id).map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
