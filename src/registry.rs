//! The test registry: declarative registrations, collected before expansion.
//!
//! Tests register against object families in four forms:
//!
//! - **plain** — no fixtures, one job per test
//! - **single** — one job per object of one family
//! - **pair** — one job per element of two families' cross product
//! - **named subset** — single or pair, with the id universe filtered
//!   through a glob-like pattern first
//!
//! Any form may be *dynamic* (its body receives the live job-graph handle).
//!
//! Registration typically happens during module initialization, and module
//! initialization can run more than once across a process's import paths.
//! The registry therefore dedups on a stable synthetic key (form + qualified
//! name + targets): the first registration wins and later identical ones are
//! no-ops, so repeated initialization cannot duplicate jobs.

use std::collections::{BTreeMap, HashSet};

use crate::graph::TestBody;

/// An immutable registration entry: one test function and how to call it.
#[derive(Debug, Clone)]
pub struct TestRecord {
    module: String,
    name: String,
    body: TestBody,
    params: serde_json::Value,
}

impl TestRecord {
    /// Creates a record for a test function declared in `module`.
    ///
    /// `module` is the declaring module path (typically `module_path!()`);
    /// it scopes job ids so that equal function names in different modules
    /// never collide.
    pub fn new(module: impl Into<String>, name: impl Into<String>, body: TestBody) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            body,
            params: serde_json::Value::Null,
        }
    }

    /// Attaches free-form parameters forwarded to the scheduler job.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// The declaring module path.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The test function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `module::name`, for diagnostics and dedup keys.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }

    /// The body, tagged by capability.
    pub fn body(&self) -> &TestBody {
        &self.body
    }

    /// Parameters forwarded to the job.
    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Whether the body needs graph-building privileges.
    pub fn is_dynamic(&self) -> bool {
        self.body.is_dynamic()
    }
}

/// A plain registration.
#[derive(Debug, Clone)]
pub struct PlainEntry {
    pub(crate) key: String,
    pub(crate) record: TestRecord,
    /// The job is expected to fail; its id feeds the known-failures set.
    pub(crate) expected_failure: bool,
}

/// A single-family registration, optionally restricted to a subset pattern.
#[derive(Debug, Clone)]
pub struct SingleEntry {
    pub(crate) key: String,
    pub(crate) record: TestRecord,
    pub(crate) subset: Option<String>,
}

/// A two-family registration, optionally restricted on either side.
#[derive(Debug, Clone)]
pub struct PairEntry {
    pub(crate) key: String,
    pub(crate) record: TestRecord,
    pub(crate) second_family: String,
    pub(crate) first_subset: Option<String>,
    pub(crate) second_subset: Option<String>,
}

/// Process-wide table of registered tests.
///
/// Constructed once at process start and threaded through expansion as a
/// parameter; append-only until expansion consumes it.
#[derive(Debug, Default)]
pub struct TestRegistry {
    plain: Vec<PlainEntry>,
    singles: BTreeMap<String, Vec<SingleEntry>>,
    pairs: BTreeMap<String, Vec<PairEntry>>,
    seen: HashSet<String>,
}

impl TestRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// First-registration-wins admission. Returns false for a duplicate key.
    fn admit(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            tracing::debug!(key, "duplicate registration ignored");
            return false;
        }
        self.seen.insert(key.to_string());
        true
    }

    /// Registers a plain test. Returns whether the record was newly added.
    pub fn register_plain(&mut self, record: TestRecord) -> bool {
        self.register_plain_inner(record, false)
    }

    /// Registers a plain test that is expected to fail.
    ///
    /// Its job id joins the known-failures set at classification time, so a
    /// pass is reported as a regression and a failure as a tolerated skip.
    pub fn register_expected_failure(&mut self, record: TestRecord) -> bool {
        self.register_plain_inner(record, true)
    }

    fn register_plain_inner(&mut self, record: TestRecord, expected_failure: bool) -> bool {
        let key = format!("plain:{}", record.qualified_name());
        if !self.admit(&key) {
            return false;
        }
        self.plain.push(PlainEntry {
            key,
            record,
            expected_failure,
        });
        true
    }

    /// Registers a test against every object of `family`.
    pub fn register_single(&mut self, family: &str, record: TestRecord) -> bool {
        self.register_single_inner(family, None, record)
    }

    /// Registers a test against the subset of `family` selected by `pattern`.
    ///
    /// The pattern is resolved at expansion time; an empty expansion or an
    /// unknown explicit id aborts expansion with an error.
    pub fn register_single_subset(
        &mut self,
        family: &str,
        pattern: impl Into<String>,
        record: TestRecord,
    ) -> bool {
        self.register_single_inner(family, Some(pattern.into()), record)
    }

    fn register_single_inner(
        &mut self,
        family: &str,
        subset: Option<String>,
        record: TestRecord,
    ) -> bool {
        let key = format!(
            "single:{}:{}:{}",
            family,
            subset.as_deref().unwrap_or("*all*"),
            record.qualified_name()
        );
        if !self.admit(&key) {
            return false;
        }
        self.singles.entry(family.to_string()).or_default().push(SingleEntry {
            key,
            record,
            subset,
        });
        true
    }

    /// Registers a test against the cross product of two families.
    pub fn register_pair(&mut self, first: &str, second: &str, record: TestRecord) -> bool {
        self.register_pair_inner(first, second, None, None, record)
    }

    /// Registers a pair test with subset patterns on both sides.
    pub fn register_pair_subset(
        &mut self,
        first: &str,
        first_pattern: impl Into<String>,
        second: &str,
        second_pattern: impl Into<String>,
        record: TestRecord,
    ) -> bool {
        self.register_pair_inner(
            first,
            second,
            Some(first_pattern.into()),
            Some(second_pattern.into()),
            record,
        )
    }

    fn register_pair_inner(
        &mut self,
        first: &str,
        second: &str,
        first_subset: Option<String>,
        second_subset: Option<String>,
        record: TestRecord,
    ) -> bool {
        let key = format!(
            "pair:{}:{}:{}:{}:{}",
            first,
            first_subset.as_deref().unwrap_or("*all*"),
            second,
            second_subset.as_deref().unwrap_or("*all*"),
            record.qualified_name()
        );
        if !self.admit(&key) {
            return false;
        }
        self.pairs.entry(first.to_string()).or_default().push(PairEntry {
            key,
            record,
            second_family: second.to_string(),
            first_subset,
            second_subset,
        });
        true
    }

    /// Plain registrations, in registration order.
    pub(crate) fn plain(&self) -> &[PlainEntry] {
        &self.plain
    }

    /// Single-family registrations for `family`, in registration order.
    pub(crate) fn singles_for(&self, family: &str) -> &[SingleEntry] {
        self.singles.get(family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pair registrations whose first family is `family`.
    pub(crate) fn pairs_for(&self, family: &str) -> &[PairEntry] {
        self.pairs.get(family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Family names mentioned by any single or pair registration.
    pub(crate) fn mentioned_families(&self) -> impl Iterator<Item = &str> {
        self.singles.keys().map(String::as_str).chain(
            self.pairs
                .iter()
                .flat_map(|(first, entries)| {
                    std::iter::once(first.as_str())
                        .chain(entries.iter().map(|e| e.second_family.as_str()))
                }),
        )
    }

    /// Total number of registrations across all forms.
    pub fn len(&self) -> usize {
        self.plain.len()
            + self.singles.values().map(Vec::len).sum::<usize>()
            + self.pairs.values().map(Vec::len).sum::<usize>()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
