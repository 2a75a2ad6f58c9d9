//! Types shared with the external dependency-graph scheduler.
//!
//! This crate never executes a job. It *defines* jobs — fixture
//! instantiations and test invocations — through the [`JobGraph`] trait,
//! which the embedding scheduler implements. A [`Promise`] names a job whose
//! value will exist once the scheduler has run it; the scheduler resolves
//! promises into [`Object`] values before invoking a test body.

use std::fmt;
use std::sync::Arc;

/// A fixture object as handed to test bodies.
///
/// Fixture definitions come from configuration files, so the resolved value
/// is structured data rather than a concrete Rust type.
pub type Object = serde_json::Value;

/// An opaque handle to a defined job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Promise {
    job_id: String,
}

impl Promise {
    /// Wraps a job id.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }

    /// The id of the promised job.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl fmt::Display for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_id)
    }
}

/// Arguments a test body receives, after the scheduler resolved the bound
/// promises into objects.
#[derive(Debug, Clone)]
pub enum TestArgs {
    /// No fixture objects: a plain test.
    Plain,
    /// One object of a single family.
    Single { object_id: String, object: Object },
    /// One object from each of two families.
    Pair {
        first_id: String,
        first: Object,
        second_id: String,
        second: Object,
    },
}

/// What a test body reports back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestVerdict {
    /// The test ran to completion.
    Passed,
    /// The test decided not to run; the reason ends up in the report.
    Skipped { reason: String },
}

/// A plain, value-returning test body.
pub type ValueFn = Arc<dyn Fn(&TestArgs) -> anyhow::Result<TestVerdict> + Send + Sync>;

/// A test body that runs with graph-building privileges: its first parameter
/// is the live job-graph handle, and it may define further jobs.
pub type GraphFn =
    Arc<dyn Fn(&mut dyn JobGraph, &TestArgs) -> anyhow::Result<TestVerdict> + Send + Sync>;

/// A test body, tagged by capability.
///
/// The capability is resolved at registration time and dispatched by
/// matching, so the scheduler never has to probe what a function expects.
#[derive(Clone)]
pub enum TestBody {
    /// Invoked as a plain function of its arguments.
    Value(ValueFn),
    /// Invoked with the live job-graph handle.
    Graph(GraphFn),
}

impl TestBody {
    /// Wraps a plain closure.
    pub fn value<F>(f: F) -> Self
    where
        F: Fn(&TestArgs) -> anyhow::Result<TestVerdict> + Send + Sync + 'static,
    {
        TestBody::Value(Arc::new(f))
    }

    /// Wraps a graph-building closure.
    pub fn graph<F>(f: F) -> Self
    where
        F: Fn(&mut dyn JobGraph, &TestArgs) -> anyhow::Result<TestVerdict> + Send + Sync + 'static,
    {
        TestBody::Graph(Arc::new(f))
    }

    /// Whether this body needs the live job-graph handle.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, TestBody::Graph(_))
    }
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestBody::Value(_) => f.write_str("TestBody::Value(..)"),
            TestBody::Graph(_) => f.write_str("TestBody::Graph(..)"),
        }
    }
}

/// Which fixture promises a test job is bound to.
#[derive(Debug, Clone)]
pub enum TestBinding {
    /// No fixtures.
    Plain,
    /// One object of one family.
    Single { object_id: String, object: Promise },
    /// The cross-product element of two families.
    Pair {
        first_id: String,
        first: Promise,
        second_id: String,
        second: Promise,
    },
}

/// The work a job performs once the scheduler runs it.
#[derive(Debug, Clone)]
pub enum Task {
    /// Fetch the raw fixture description for an object.
    FetchSpec { family: String, object_id: String },
    /// Instantiate the object from its description.
    Instantiate { family: String, object_id: String },
    /// Invoke a registered test body.
    RunTest {
        /// Function name, for diagnostics.
        name: String,
        body: TestBody,
        binding: TestBinding,
        /// Free-form parameters forwarded verbatim to the body.
        params: serde_json::Value,
    },
}

/// A job definition handed to the scheduler.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Hierarchical, deterministic job id.
    pub id: String,
    /// Jobs whose values this job consumes.
    pub deps: Vec<Promise>,
    /// The work itself.
    pub task: Task,
}

impl JobSpec {
    /// Creates a job spec with no dependencies.
    pub fn new(id: impl Into<String>, task: Task) -> Self {
        Self {
            id: id.into(),
            deps: Vec::new(),
            task,
        }
    }

    /// Adds a dependency.
    pub fn with_dep(mut self, dep: Promise) -> Self {
        self.deps.push(dep);
        self
    }
}

/// The job-definition surface of the external scheduler.
///
/// Implementations own dedup, persistence, and execution; this crate only
/// guarantees that the ids it submits are deterministic and collision-free.
pub trait JobGraph: Send {
    /// Defines a job and returns the promise of its result.
    fn define(&mut self, spec: JobSpec) -> Promise;
}
