//! Object families: named universes of configurable fixture objects.
//!
//! A family groups fixture objects under a stable name (`"example_class1"`)
//! and maps each object id to an on-demand instantiation strategy. Families
//! are loaded once from configuration and read thereafter; the matrix
//! expander turns them into instance jobs and crosses them with registered
//! tests.
//!
//! Subset patterns (`"c1*"`) select part of a family's id universe. Pattern
//! expansion fails loudly when nothing matches or an explicit id is unknown:
//! a silently empty subset would hide a configuration typo behind a green
//! test run.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Errors raised while resolving families and subset patterns.
///
/// All of these indicate a broken test declaration and abort matrix
/// expansion; none are downgraded to warnings.
#[derive(Debug, thiserror::Error)]
pub enum FamilyError {
    /// A test was registered against a family the universe does not contain.
    #[error("unknown object family {family:?}")]
    UnknownFamily { family: String },

    /// A wildcard pattern matched no object ids.
    #[error("pattern {pattern:?} matched no objects in family {family:?}")]
    EmptySubset { family: String, pattern: String },

    /// An explicit object id is not part of the family.
    #[error("object id {id:?} is not part of family {family:?}")]
    UnknownObject { family: String, id: String },

    /// A pattern could not be compiled.
    #[error("invalid subset pattern {pattern:?}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// How an object of a family is materialized by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instantiation {
    /// Fetch the raw fixture description without constructing anything.
    Spec,
    /// Construct the live object from its description.
    Instance,
}

/// A named family of fixture objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectFamily {
    /// Stable family name, used in job ids.
    pub name: String,

    /// How objects of this family are materialized.
    #[serde(default = "default_instantiation")]
    pub instantiation: Instantiation,

    /// The object-id universe, kept ordered for deterministic expansion.
    #[serde(default)]
    pub objects: BTreeSet<String>,
}

fn default_instantiation() -> Instantiation {
    Instantiation::Instance
}

impl ObjectFamily {
    /// Creates an empty family.
    pub fn new(name: impl Into<String>, instantiation: Instantiation) -> Self {
        Self {
            name: name.into(),
            instantiation,
            objects: BTreeSet::new(),
        }
    }

    /// Adds an object id (builder style).
    pub fn with_object(mut self, id: impl Into<String>) -> Self {
        self.objects.insert(id.into());
        self
    }

    /// Whether `id` belongs to this family.
    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains(id)
    }

    /// Object ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(String::as_str)
    }

    /// Expands a subset pattern against this family's id universe.
    ///
    /// The pattern is a comma-separated list of tokens. A token containing
    /// `*` or `?` is treated as a glob over the universe; any other token is
    /// an explicit id that must be a member. Results keep universe order and
    /// are deduplicated.
    pub fn expand_subset(&self, pattern: &str) -> Result<Vec<String>, FamilyError> {
        let mut selected = BTreeSet::new();
        for token in pattern.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.contains('*') || token.contains('?') {
                let re = glob_to_regex(token).map_err(|source| FamilyError::BadPattern {
                    pattern: token.to_string(),
                    source,
                })?;
                let before = selected.len();
                for id in &self.objects {
                    if re.is_match(id) {
                        selected.insert(id.clone());
                    }
                }
                if selected.len() == before {
                    return Err(FamilyError::EmptySubset {
                        family: self.name.clone(),
                        pattern: token.to_string(),
                    });
                }
            } else {
                if !self.contains(token) {
                    return Err(FamilyError::UnknownObject {
                        family: self.name.clone(),
                        id: token.to_string(),
                    });
                }
                selected.insert(token.to_string());
            }
        }
        if selected.is_empty() {
            return Err(FamilyError::EmptySubset {
                family: self.name.clone(),
                pattern: pattern.to_string(),
            });
        }
        Ok(selected.into_iter().collect())
    }
}

/// Translates a glob token into an anchored regex.
fn glob_to_regex(token: &str) -> Result<regex::Regex, regex::Error> {
    let mut pattern = String::with_capacity(token.len() + 8);
    pattern.push('^');
    for ch in token.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern)
}

/// The full set of object families available to a run.
///
/// Loaded once at process start (from configuration or built
/// programmatically), then only read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Universe {
    #[serde(default)]
    families: BTreeMap<String, ObjectFamily>,
}

impl Universe {
    /// Creates an empty universe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a family, keyed by its name.
    pub fn insert(&mut self, family: ObjectFamily) {
        self.families.insert(family.name.clone(), family);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_family(mut self, family: ObjectFamily) -> Self {
        self.insert(family);
        self
    }

    /// Looks a family up, failing loudly when it is unknown.
    pub fn family(&self, name: &str) -> Result<&ObjectFamily, FamilyError> {
        self.families.get(name).ok_or_else(|| FamilyError::UnknownFamily {
            family: name.to_string(),
        })
    }

    /// Family names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    /// All families in name order.
    pub fn families(&self) -> impl Iterator<Item = &ObjectFamily> {
        self.families.values()
    }

    /// Number of families.
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Whether the universe holds no families.
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}
