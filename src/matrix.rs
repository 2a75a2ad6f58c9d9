//! Matrix expansion: registered tests × object universes → job graph.
//!
//! Expansion is deferred until the object universes exist, because loading
//! the fixture configuration is itself a scheduler job. It runs inside the
//! scheduler's cooperative job-definition phase, so the expansion loop
//! yields between records instead of blocking the phase.
//!
//! Job ids are deterministic: sorted family names, registration order for
//! records, sorted object ids. Re-expanding an unchanged registry against an
//! unchanged universe reproduces an identical graph, which is what lets an
//! incremental scheduler prove "nothing changed".

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::family::{FamilyError, Instantiation, Universe};
use crate::graph::{JobGraph, JobSpec, Promise, Task, TestBinding};
use crate::registry::{TestRecord, TestRegistry};
use crate::sharding::ShardConfig;

/// Errors that abort matrix expansion.
///
/// These indicate a broken test declaration; they propagate to the caller
/// and are never downgraded to warnings.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    /// A registration targets a family the universe does not contain.
    #[error(transparent)]
    Family(#[from] FamilyError),

    /// A named-subset pattern failed to expand for a specific test.
    #[error("cannot expand subset for test {test}: {source}")]
    Subset {
        test: String,
        #[source]
        source: FamilyError,
    },
}

/// What one expansion pass defined.
#[derive(Debug, Default)]
pub struct Expansion {
    /// Fixture instantiation jobs, one per (family, object id).
    pub instance_jobs: Vec<Promise>,
    /// Test invocation jobs, in definition order.
    pub test_jobs: Vec<Promise>,
    /// Job ids of tests registered as expected failures.
    pub expected_failures: BTreeSet<String>,
    /// Registrations skipped because another worker owns them.
    pub filtered_by_shard: usize,
}

impl Expansion {
    /// All defined job ids, instances first, in definition order.
    pub fn job_ids(&self) -> Vec<String> {
        self.instance_jobs
            .iter()
            .chain(self.test_jobs.iter())
            .map(|p| p.job_id().to_string())
            .collect()
    }
}

/// Turns a module path into a job-id component.
fn sanitize(part: &str) -> String {
    part.replace("::", ".")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn run_test_task(record: &TestRecord, binding: TestBinding) -> Task {
    Task::RunTest {
        name: record.name().to_string(),
        body: record.body().clone(),
        binding,
        params: record.params().clone(),
    }
}

/// Expands the registry against the universe, defining jobs through `graph`.
///
/// One fixture-instantiation job is defined per (family, object id), then one
/// test job per combination each registration selects. Registrations whose
/// function name the current worker does not accept are skipped entirely;
/// every other record is consumed exactly once per pass.
pub async fn expand(
    registry: &TestRegistry,
    universe: &Universe,
    graph: &mut dyn JobGraph,
    shard: &ShardConfig,
) -> Result<Expansion, MatrixError> {
    // Fail before defining anything if a registration names a family the
    // universe does not have.
    for name in registry.mentioned_families() {
        universe.family(name)?;
    }

    let mut out = Expansion::default();

    // One instantiation job per object, keyed for binding below.
    let mut instances: BTreeMap<String, BTreeMap<String, Promise>> = BTreeMap::new();
    for family in universe.families() {
        if family.objects.is_empty() {
            tracing::warn!(family = %family.name, "family has no objects");
        }
        let mut per_object = BTreeMap::new();
        for id in family.ids() {
            let task = match family.instantiation {
                Instantiation::Spec => Task::FetchSpec {
                    family: family.name.clone(),
                    object_id: id.to_string(),
                },
                Instantiation::Instance => Task::Instantiate {
                    family: family.name.clone(),
                    object_id: id.to_string(),
                },
            };
            let job_id = format!("{}-instance-{}", family.name, id);
            let promise = graph.define(JobSpec::new(job_id, task));
            out.instance_jobs.push(promise.clone());
            per_object.insert(id.to_string(), promise);
        }
        instances.insert(family.name.clone(), per_object);
        tokio::task::yield_now().await;
    }

    // Each record is consumed at most once per pass, whatever path reaches it.
    let mut scheduled: HashSet<String> = HashSet::new();

    for entry in registry.plain() {
        if !scheduled.insert(entry.key.clone()) {
            continue;
        }
        let record = &entry.record;
        if !shard.accepts(record.name()) {
            out.filtered_by_shard += 1;
            continue;
        }
        let job_id = format!("{}-{}", sanitize(record.module()), record.name());
        let promise = graph.define(JobSpec::new(
            job_id.clone(),
            run_test_task(record, TestBinding::Plain),
        ));
        if entry.expected_failure {
            out.expected_failures.insert(job_id);
        }
        out.test_jobs.push(promise);
        tokio::task::yield_now().await;
    }

    for family_name in universe.names() {
        let family = universe.family(family_name)?;

        for entry in registry.singles_for(family_name) {
            if !scheduled.insert(entry.key.clone()) {
                continue;
            }
            let record = &entry.record;
            if !shard.accepts(record.name()) {
                out.filtered_by_shard += 1;
                continue;
            }
            let ids = match &entry.subset {
                Some(pattern) => {
                    family
                        .expand_subset(pattern)
                        .map_err(|source| MatrixError::Subset {
                            test: record.qualified_name(),
                            source,
                        })?
                }
                None => family.ids().map(str::to_string).collect(),
            };
            if ids.is_empty() {
                tracing::warn!(
                    family = family_name,
                    test = %record.qualified_name(),
                    "no objects to test against"
                );
            }
            for id in &ids {
                let object = instances[family_name][id].clone();
                let job_id = format!(
                    "{}-{}-{}-{}",
                    sanitize(record.module()),
                    family_name,
                    record.name(),
                    id
                );
                let spec = JobSpec::new(
                    job_id,
                    run_test_task(
                        record,
                        TestBinding::Single {
                            object_id: id.clone(),
                            object: object.clone(),
                        },
                    ),
                )
                .with_dep(object);
                out.test_jobs.push(graph.define(spec));
            }
            tokio::task::yield_now().await;
        }

        for entry in registry.pairs_for(family_name) {
            if !scheduled.insert(entry.key.clone()) {
                continue;
            }
            let record = &entry.record;
            if !shard.accepts(record.name()) {
                out.filtered_by_shard += 1;
                continue;
            }
            let second = universe.family(&entry.second_family)?;
            let first_ids = match &entry.first_subset {
                Some(pattern) => {
                    family
                        .expand_subset(pattern)
                        .map_err(|source| MatrixError::Subset {
                            test: record.qualified_name(),
                            source,
                        })?
                }
                None => family.ids().map(str::to_string).collect(),
            };
            let second_ids = match &entry.second_subset {
                Some(pattern) => {
                    second
                        .expand_subset(pattern)
                        .map_err(|source| MatrixError::Subset {
                            test: record.qualified_name(),
                            source,
                        })?
                }
                None => second.ids().map(str::to_string).collect::<Vec<_>>(),
            };
            for first_id in &first_ids {
                for second_id in &second_ids {
                    let first = instances[family_name][first_id].clone();
                    let second_promise = instances[entry.second_family.as_str()][second_id].clone();
                    // The second family is part of the id: two pair
                    // registrations sharing (first family, function) must not
                    // collide when their second families overlap in ids.
                    let job_id = format!(
                        "{}-{}-{}-{}-{}-{}",
                        sanitize(record.module()),
                        family_name,
                        entry.second_family,
                        record.name(),
                        first_id,
                        second_id
                    );
                    let spec = JobSpec::new(
                        job_id,
                        run_test_task(
                            record,
                            TestBinding::Pair {
                                first_id: first_id.clone(),
                                first: first.clone(),
                                second_id: second_id.clone(),
                                second: second_promise.clone(),
                            },
                        ),
                    )
                    .with_dep(first)
                    .with_dep(second_promise);
                    out.test_jobs.push(graph.define(spec));
                }
            }
            tokio::task::yield_now().await;
        }
    }

    tracing::info!(
        instances = out.instance_jobs.len(),
        tests = out.test_jobs.len(),
        filtered = out.filtered_by_shard,
        "matrix expansion complete"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ObjectFamily;
    use crate::graph::{TestBody, TestVerdict};

    struct RecordingGraph {
        specs: Vec<JobSpec>,
    }

    impl RecordingGraph {
        fn new() -> Self {
            Self { specs: Vec::new() }
        }

        fn ids(&self) -> Vec<&str> {
            self.specs.iter().map(|s| s.id.as_str()).collect()
        }

        fn test_ids(&self) -> Vec<&str> {
            self.specs
                .iter()
                .filter(|s| matches!(s.task, Task::RunTest { .. }))
                .map(|s| s.id.as_str())
                .collect()
        }
    }

    impl JobGraph for RecordingGraph {
        fn define(&mut self, spec: JobSpec) -> Promise {
            let promise = Promise::new(spec.id.clone());
            self.specs.push(spec);
            promise
        }
    }

    fn universe() -> Universe {
        Universe::new()
            .with_family(
                ObjectFamily::new("class1", Instantiation::Instance)
                    .with_object("c1a")
                    .with_object("c1b"),
            )
            .with_family(ObjectFamily::new("class2", Instantiation::Spec).with_object("c2a"))
    }

    fn record(name: &str) -> TestRecord {
        TestRecord::new(module_path!(), name, TestBody::value(|_| Ok(TestVerdict::Passed)))
    }

    fn module() -> String {
        sanitize(module_path!())
    }

    #[tokio::test]
    async fn test_single_expansion() {
        let mut registry = TestRegistry::new();
        registry.register_single("class1", record("check_class1"));
        let mut graph = RecordingGraph::new();
        let expansion = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();

        assert_eq!(expansion.instance_jobs.len(), 3);
        assert_eq!(expansion.test_jobs.len(), 2);
        let m = module();
        assert_eq!(
            expansion.test_jobs.iter().map(|p| p.job_id()).collect::<Vec<_>>(),
            vec![
                format!("{m}-class1-check_class1-c1a"),
                format!("{m}-class1-check_class1-c1b"),
            ]
        );
        assert!(graph.ids().contains(&"class1-instance-c1a"));
        assert!(graph.ids().contains(&"class2-instance-c2a"));
    }

    #[tokio::test]
    async fn test_pair_cross_product() {
        let mut registry = TestRegistry::new();
        registry.register_pair("class1", "class2", record("check_all"));
        let mut graph = RecordingGraph::new();
        let expansion = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();

        let m = module();
        assert_eq!(
            expansion.test_jobs.iter().map(|p| p.job_id()).collect::<Vec<_>>(),
            vec![
                format!("{m}-class1-class2-check_all-c1a-c2a"),
                format!("{m}-class1-class2-check_all-c1b-c2a"),
            ]
        );
        // Every pair job depends on both instance jobs.
        let pair_spec = graph
            .specs
            .iter()
            .find(|s| s.id.ends_with("check_all-c1a-c2a"))
            .unwrap();
        assert_eq!(pair_spec.deps.len(), 2);
    }

    #[tokio::test]
    async fn test_named_subset_filters_ids() {
        let mut registry = TestRegistry::new();
        registry.register_single_subset("class1", "c1a", record("check_one"));
        let mut graph = RecordingGraph::new();
        let expansion = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();
        assert_eq!(expansion.test_jobs.len(), 1);
        assert!(expansion.test_jobs[0].job_id().ends_with("check_one-c1a"));
    }

    #[tokio::test]
    async fn test_empty_subset_aborts_expansion() {
        let mut registry = TestRegistry::new();
        registry.register_single_subset("class1", "zzz*", record("check_none"));
        let mut graph = RecordingGraph::new();
        let err = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap_err();
        assert!(matches!(err, MatrixError::Subset { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_id_aborts_expansion() {
        let mut registry = TestRegistry::new();
        registry.register_single_subset("class1", "c9z", record("check_missing"));
        let mut graph = RecordingGraph::new();
        let err = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap_err();
        assert!(matches!(err, MatrixError::Subset { .. }));
    }

    #[tokio::test]
    async fn test_unknown_family_aborts_before_defining_jobs() {
        let mut registry = TestRegistry::new();
        registry.register_single("ghost", record("check_ghost"));
        let mut graph = RecordingGraph::new();
        let err = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap_err();
        assert!(matches!(err, MatrixError::Family(FamilyError::UnknownFamily { .. })));
        assert!(graph.specs.is_empty());
    }

    #[tokio::test]
    async fn test_double_registration_yields_one_job_per_object() {
        let mut registry = TestRegistry::new();
        registry.register_single("class1", record("check_class1"));
        registry.register_single("class1", record("check_class1"));
        let mut graph = RecordingGraph::new();
        let expansion = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();
        assert_eq!(expansion.test_jobs.len(), 2); // one per object id, not four
    }

    #[tokio::test]
    async fn test_expansion_is_deterministic() {
        let mut registry = TestRegistry::new();
        registry.register_single("class1", record("check_class1"));
        registry.register_pair("class1", "class2", record("check_all"));
        registry.register_plain(record("simple_check"));

        let mut first = RecordingGraph::new();
        let mut second = RecordingGraph::new();
        expand(&registry, &universe(), &mut first, &ShardConfig::single())
            .await
            .unwrap();
        expand(&registry, &universe(), &mut second, &ShardConfig::single())
            .await
            .unwrap();
        assert_eq!(first.ids(), second.ids());
    }

    #[tokio::test]
    async fn test_shard_filter_partitions_test_jobs() {
        let mut registry = TestRegistry::new();
        for i in 0..20 {
            registry.register_single("class1", record(&format!("check_{i}")));
        }
        let full: BTreeSet<String> = {
            let mut graph = RecordingGraph::new();
            expand(&registry, &universe(), &mut graph, &ShardConfig::single())
                .await
                .unwrap();
            graph.test_ids().iter().map(|s| s.to_string()).collect()
        };

        let mut union = BTreeSet::new();
        let mut total = 0usize;
        for index in 0..3 {
            let shard = ShardConfig::new(index, 3).unwrap();
            let mut graph = RecordingGraph::new();
            expand(&registry, &universe(), &mut graph, &shard).await.unwrap();
            let ids: BTreeSet<String> = graph.test_ids().iter().map(|s| s.to_string()).collect();
            total += ids.len();
            union.extend(ids);
        }
        // Disjoint buckets covering exactly the unsharded job set.
        assert_eq!(union, full);
        assert_eq!(total, full.len());
    }

    #[tokio::test]
    async fn test_equal_names_in_different_modules_do_not_collide() {
        let mut registry = TestRegistry::new();
        let body = || TestBody::value(|_| Ok(TestVerdict::Passed));
        registry.register_single("class1", TestRecord::new("pkg_a::tests", "check", body()));
        registry.register_single("class1", TestRecord::new("pkg_b::tests", "check", body()));
        let mut graph = RecordingGraph::new();
        let expansion = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();
        let ids: BTreeSet<&str> = expansion.test_jobs.iter().map(|p| p.job_id()).collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.contains("pkg_a.tests-class1-check-c1a"));
        assert!(ids.contains("pkg_b.tests-class1-check-c1a"));
    }

    #[tokio::test]
    async fn test_expected_failures_feed_known_failures() {
        let mut registry = TestRegistry::new();
        registry.register_expected_failure(record("known_broken"));
        let mut graph = RecordingGraph::new();
        let expansion = expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();
        let m = module();
        assert!(expansion.expected_failures.contains(&format!("{m}-known_broken")));
    }

    #[tokio::test]
    async fn test_dynamic_body_rides_into_task() {
        let mut registry = TestRegistry::new();
        registry.register_single(
            "class1",
            TestRecord::new(
                module_path!(),
                "check_dynamic",
                TestBody::graph(|_graph, _args| Ok(TestVerdict::Passed)),
            ),
        );
        let mut graph = RecordingGraph::new();
        expand(&registry, &universe(), &mut graph, &ShardConfig::single())
            .await
            .unwrap();
        let dynamic = graph
            .specs
            .iter()
            .filter_map(|s| match &s.task {
                Task::RunTest { body, .. } => Some(body.is_dynamic()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(dynamic, vec![true, true]);
    }
}
