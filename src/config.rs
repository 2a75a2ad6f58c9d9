//! Configuration loading and schema definitions for gridtest.
//!
//! Settings load from an optional `gridtest.toml`; command-line flags
//! override file values, and everything has a default, so the file itself is
//! optional.
//!
//! ```toml
//! [report]
//! output_dir = "test-results"
//! junit_file = "junit.xml"
//! suite_name = "my-project"
//!
//! [classify]
//! max_message_len = 4096
//! interrupted = "skip"
//! skip_markers = ["SkipTest"]
//! known_failures = "known-failures.toml"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::classify::{Classifier, DEFAULT_MAX_MESSAGE_LEN, InterruptedPolicy};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Classification policies.
    #[serde(default)]
    pub classify: ClassifyConfig,
}

/// Where and how reports are written.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory receiving the JUnit file and the per-status text lists.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// JUnit XML file name within `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Test-suite name used in the XML.
    #[serde(default = "default_suite_name")]
    pub suite_name: String,

    /// Whether to write the `{status}_{count}.txt` triage files.
    #[serde(default = "default_true")]
    pub text_files: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit_file: default_junit_file(),
            suite_name: default_suite_name(),
            text_files: true,
        }
    }
}

/// Classification policy knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifyConfig {
    /// Ceiling for message/detail text; longer text is clipped with an
    /// explicit marker.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// How to report jobs found still processing.
    #[serde(default)]
    pub interrupted: InterruptedPolicy,

    /// Exception-text substrings that downgrade a failure to a skip.
    #[serde(default = "default_skip_markers")]
    pub skip_markers: Vec<String>,

    /// Path to the known-failures TOML file.
    #[serde(default)]
    pub known_failures: Option<PathBuf>,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            interrupted: InterruptedPolicy::default(),
            skip_markers: default_skip_markers(),
            known_failures: None,
        }
    }
}

impl ClassifyConfig {
    /// Builds a classifier from these policies and a known-failures set.
    pub fn classifier(&self, known_failures: BTreeSet<String>) -> Classifier {
        Classifier::new()
            .with_known_failures(known_failures)
            .with_interrupted_policy(self.interrupted)
            .with_max_message_len(self.max_message_len)
            .with_skip_markers(self.skip_markers.clone())
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_suite_name() -> String {
    "gridtest".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_message_len() -> usize {
    DEFAULT_MAX_MESSAGE_LEN
}

fn default_skip_markers() -> Vec<String> {
    vec!["SkipTest".to_string()]
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    Ok(config)
}
