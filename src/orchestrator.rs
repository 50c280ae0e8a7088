//! Run orchestration.
//!
//! The orchestrator ties the pieces of a sharded coverage run together:
//!
//! ```text
//!  Vec<TestItem>
//!       │ Partitioner::partition()
//!       ▼
//!  ShardAssignment ──► one task per shard (JoinSet)
//!                            │ ShardExecutor::run_shard()
//!                            ▼
//!                       ArtifactStore::put()
//!                            │
//!        wait_for_all() ◄────┘   (bounded, raced against fail-fast)
//!              │
//!              ▼
//!   Merger::merge() ──► render() ──► gate::evaluate() ──► Reporter
//! ```
//!
//! # Execution Flow
//!
//! 1. **Validation**: a bad shard count or threshold stops the run before any
//!    shard starts
//! 2. **Partitioning**: split the tests into N shards
//! 3. **Execution**: run every non-empty shard concurrently; empty shards get
//!    an empty artifact without touching the executor
//! 4. **Collection**: wait until all shards delivered, the wait bound elapsed,
//!    or fail-fast cancelled the run; shards without an artifact are recorded
//!    as missing with the reason
//! 5. **Merge, gate, report**
//!
//! # Example
//!
//! ```no_run
//! use shardcov::config::{ExecutorConfig, load_config};
//! use shardcov::discovery::parse_test_lines;
//! use shardcov::executor::process::ProcessExecutor;
//! use shardcov::orchestrator::Orchestrator;
//! use shardcov::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardcov.toml"))?;
//!     let ExecutorConfig::Process(process) = config.executor.clone();
//!     let executor = ProcessExecutor::new(process, config.report.output_dir.join("artifacts"));
//!
//!     let tests = parse_test_lines(&std::fs::read_to_string("tests.txt")?)?;
//!     let orchestrator = Orchestrator::new(config, executor, ConsoleReporter::new(false));
//!     let result = orchestrator.run(&tests).await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigurationError, CoverageConfig, MergeConfig};
use crate::coverage::{ArtifactStatus, CoverageArtifact, MergedCoverage, Merger, load_known_locations};
use crate::discovery::TestItem;
use crate::executor::{ShardExecutor, ShardSpec};
use crate::gate::{GatePolicy, GateResult, evaluate};
use crate::partition::{Partitioner, ShardAssignment};
use crate::report::{RenderedReport, Reporter, ShardOutcome, render};
use crate::store::ArtifactStore;

/// Everything a run produced.
///
/// Returned by [`Orchestrator::run`] and [`merge_artifacts`], and passed to
/// reporters for final output.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Unique id of this run, as written to the JSON report.
    pub run_id: String,

    /// How tests were split. `None` when merging externally produced artifacts.
    pub assignment: Option<ShardAssignment>,

    pub merged: MergedCoverage,
    pub rendered: RenderedReport,
    pub gate: GateResult,
}

impl PipelineResult {
    pub fn passed(&self) -> bool {
        self.gate.passed
    }

    /// Process exit code: 0 when the gate passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        self.gate.exit_code()
    }
}

/// What a shard task hands back to the orchestrator.
struct ShardTask {
    shard: usize,
    duration: Duration,
    /// Whether the tests passed, or why no artifact was stored.
    result: Result<bool, String>,
}

/// Why collection stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Complete,
    Drained,
    TimedOut,
    Cancelled,
}

/// Coordinates a sharded run from partitioning to the gate verdict.
///
/// # Type Parameters
///
/// - `E`: The shard executor type
/// - `R`: The reporter type
pub struct Orchestrator<E, R> {
    config: Config,
    executor: Arc<E>,
    reporter: R,
    store: Arc<ArtifactStore>,
}

impl<E, R> Orchestrator<E, R>
where
    E: ShardExecutor + 'static,
    R: Reporter,
{
    /// Creates an orchestrator with a fresh artifact store.
    pub fn new(config: Config, executor: E, reporter: R) -> Self {
        let store = Arc::new(ArtifactStore::new(config.shardcov.shard_count));
        Self {
            config,
            executor: Arc::new(executor),
            reporter,
            store,
        }
    }

    /// Uses `store` instead of a fresh one, e.g. to observe or pre-seed it.
    pub fn with_store(mut self, store: Arc<ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Partitions `tests`, runs every shard, merges and gates the result.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] (inside the `anyhow::Error`) before any
    /// shard starts if the configuration is unusable, or an error if the
    /// known-locations baseline cannot be read. Shard failures are never
    /// errors: they end up in the [`GateResult`].
    pub async fn run(&self, tests: &[TestItem]) -> anyhow::Result<PipelineResult> {
        self.config.validate()?;
        let shard_count = self.config.shardcov.shard_count;
        if self.store.expected() != shard_count {
            return Err(ConfigurationError::Invalid(format!(
                "artifact store expects {} shards but the run has {}",
                self.store.expected(),
                shard_count
            ))
            .into());
        }
        let policy = GatePolicy::from_config(&self.config.gate)?;
        let merger = build_merger(shard_count, &self.config.coverage)?;
        let partitioner = Partitioner::new(shard_count, self.config.shardcov.strategy)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting run {} with {} tests on {} shards ({})",
            run_id,
            tests.len(),
            shard_count,
            self.executor.name()
        );

        let assignment = partitioner.partition(tests);
        self.reporter.on_partition_complete(&assignment).await;

        let token = CancellationToken::new();
        let mut tasks: JoinSet<ShardTask> = JoinSet::new();
        let mut task_shards: HashMap<Id, usize> = HashMap::new();
        let mut pending = Vec::new();

        for (index, ids) in assignment.iter() {
            if ids.is_empty() {
                debug!("Shard {} has no tests", index);
                self.store
                    .put(index, CoverageArtifact::new(index, ArtifactStatus::Success));
                self.reporter
                    .on_shard_complete(&ShardOutcome {
                        shard: index,
                        status: ArtifactStatus::Success,
                        duration: Duration::ZERO,
                        error: None,
                    })
                    .await;
                continue;
            }

            let spec = ShardSpec {
                index,
                shard_count,
                tests: ids.to_vec(),
            };
            self.reporter.on_shard_start(&spec).await;
            pending.push(index);

            let executor = Arc::clone(&self.executor);
            let store = Arc::clone(&self.store);
            let token = token.clone();
            let handle = tasks.spawn(run_shard(executor, store, token, spec));
            task_shards.insert(handle.id(), index);
        }

        let mut outcomes: BTreeMap<usize, ShardTask> = BTreeMap::new();
        let mut panics: BTreeMap<usize, String> = BTreeMap::new();
        let wait_bound = Duration::from_secs(self.config.shardcov.wait_timeout_secs);
        let stop = {
            let wait = self.store.wait_for_all(wait_bound);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    snapshot = &mut wait => {
                        break if snapshot.complete { Stop::Complete } else { Stop::TimedOut };
                    }
                    joined = tasks.join_next_with_id() => match joined {
                        None => break Stop::Drained,
                        Some(Ok((_, task))) => {
                            if self.config.shardcov.fail_fast && is_fatal(&task) {
                                warn!("Shard {} failed, cancelling remaining shards", task.shard);
                                token.cancel();
                            }
                            outcomes.insert(task.shard, task);
                        }
                        Some(Err(e)) => {
                            if let Some((shard, reason)) = panic_reason(&task_shards, e) {
                                if self.config.shardcov.fail_fast {
                                    warn!("Shard {} panicked, cancelling remaining shards", shard);
                                    token.cancel();
                                }
                                panics.insert(shard, reason);
                            }
                        }
                    },
                    _ = token.cancelled() => break Stop::Cancelled,
                }
            }
        };
        debug!("Stopped collecting: {:?}", stop);

        token.cancel();
        tasks.abort_all();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, task)) => {
                    outcomes.insert(task.shard, task);
                }
                Err(e) => {
                    if let Some((shard, reason)) = panic_reason(&task_shards, e) {
                        panics.insert(shard, reason);
                    }
                }
            }
        }

        let collected = self.store.snapshot().collected;
        let mut missing_reasons = BTreeMap::new();
        for index in pending {
            if let Some(task) = outcomes.get(&index) {
                if let Err(reason) = &task.result
                    && !collected.contains(&index)
                {
                    missing_reasons.insert(index, reason.clone());
                }
                self.reporter.on_shard_complete(&outcome_of(task)).await;
            } else if !collected.contains(&index) {
                // The task never reported back.
                let reason = match (panics.remove(&index), stop) {
                    (Some(panic), _) => panic,
                    (None, Stop::TimedOut) => "timed out".to_string(),
                    (None, Stop::Cancelled) => "cancelled".to_string(),
                    (None, Stop::Complete | Stop::Drained) => "aborted".to_string(),
                };
                missing_reasons.insert(index, reason.clone());
                self.reporter
                    .on_shard_complete(&ShardOutcome {
                        shard: index,
                        status: ArtifactStatus::Missing,
                        duration: Duration::ZERO,
                        error: Some(reason),
                    })
                    .await;
            }
        }

        let shard_passed: Vec<(usize, bool)> = outcomes
            .values()
            .filter_map(|task| task.result.as_ref().ok().map(|passed| (task.shard, *passed)))
            .collect();

        let merged = merger.merge(&self.store.artifacts(), &missing_reasons);
        let result = finish(run_id, Some(assignment), merged, &policy, &shard_passed);
        self.reporter.on_run_complete(&result).await;

        Ok(result)
    }
}

/// Body of one shard task.
async fn run_shard<E: ShardExecutor>(
    executor: Arc<E>,
    store: Arc<ArtifactStore>,
    token: CancellationToken,
    spec: ShardSpec,
) -> ShardTask {
    let started = Instant::now();
    let shard = spec.index;

    let result = tokio::select! {
        result = executor.run_shard(&spec) => result,
        _ = token.cancelled() => {
            debug!("Shard {} cancelled", shard);
            return ShardTask {
                shard,
                duration: started.elapsed(),
                result: Err("cancelled".to_string()),
            };
        }
    };

    let result = match result {
        Ok(run) => {
            let status = if run.passed {
                ArtifactStatus::Success
            } else {
                ArtifactStatus::Failure
            };
            store.put(shard, run.artifact.with_status(status));
            Ok(run.passed)
        }
        Err(e) => {
            error!("Shard {} produced no artifact: {}", shard, e);
            Err(e.to_string())
        }
    };

    ShardTask {
        shard,
        duration: started.elapsed(),
        result,
    }
}

/// The shard and reason for a task that panicked; `None` for an aborted task.
fn panic_reason(task_shards: &HashMap<Id, usize>, e: JoinError) -> Option<(usize, String)> {
    let shard = *task_shards.get(&e.id())?;
    let payload = e.try_into_panic().ok()?;
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!("Shard {} panicked: {}", shard, message);
    Some((shard, format!("executor panicked: {}", message)))
}

fn is_fatal(task: &ShardTask) -> bool {
    !matches!(task.result, Ok(true))
}

fn outcome_of(task: &ShardTask) -> ShardOutcome {
    let (status, error) = match &task.result {
        Ok(true) => (ArtifactStatus::Success, None),
        Ok(false) => (ArtifactStatus::Failure, None),
        Err(reason) => (ArtifactStatus::Missing, Some(reason.clone())),
    };
    ShardOutcome {
        shard: task.shard,
        status,
        duration: task.duration,
        error,
    }
}

fn build_merger(shard_count: usize, coverage: &CoverageConfig) -> anyhow::Result<Merger> {
    let mut merger = Merger::new(shard_count);
    if let Some(path) = &coverage.known_locations {
        let known = load_known_locations(path)?;
        info!("Loaded {} known locations from {}", known.len(), path.display());
        merger = merger.with_known_locations(known);
    }
    if let Some(prefix) = &coverage.strip_prefix {
        merger = merger.with_strip_prefix(prefix.clone());
    }
    Ok(merger)
}

fn finish(
    run_id: String,
    assignment: Option<ShardAssignment>,
    merged: MergedCoverage,
    policy: &GatePolicy,
    shard_passed: &[(usize, bool)],
) -> PipelineResult {
    let rendered = render(&merged);
    let gate = evaluate(policy, shard_passed, &merged);
    if gate.passed {
        info!("Run {} passed with {:.2}% coverage", run_id, gate.coverage);
    } else {
        warn!("Run {} failed: {}", run_id, gate.reasons.join("; "));
    }
    PipelineResult {
        run_id,
        assignment,
        merged,
        rendered,
        gate,
    }
}

/// Merges artifacts collected elsewhere (e.g. by separate CI jobs) and
/// evaluates the gate, without partitioning or running anything.
///
/// Artifacts are keyed by the shard index they were collected for; a shard
/// passed if its artifact status is `success`.
///
/// # Errors
///
/// Returns a [`ConfigurationError`] for an unusable configuration, or an
/// error if the known-locations baseline cannot be read.
pub fn merge_artifacts(
    config: &MergeConfig,
    artifacts: &BTreeMap<usize, CoverageArtifact>,
) -> anyhow::Result<PipelineResult> {
    config.validate()?;
    let policy = GatePolicy::from_config(&config.gate)?;
    let merger = build_merger(config.shardcov.shard_count, &config.coverage)?;

    let run_id = uuid::Uuid::new_v4().to_string();
    info!("Merging {} artifacts for run {}", artifacts.len(), run_id);

    let merged = merger.merge(artifacts, &BTreeMap::new());
    Ok(finish(run_id, None, merged, &policy, &[]))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::load_config_str;
    use crate::coverage::SourceLocation;
    use crate::executor::{ExecutorError, ExecutorResult, ShardRun};
    use crate::report::NullReporter;

    fn config(shards: usize, extra: &str) -> Config {
        let toml = format!(
            r#"
            [shardcov]
            shard_count = {}
            wait_timeout_secs = 5
            {}

            [discovery]
            type = "list"
            path = "tests.txt"

            [executor]
            type = "process"
            command = "unused"
            "#,
            shards, extra
        );
        load_config_str(&toml).unwrap()
    }

    fn tests(n: usize) -> Vec<TestItem> {
        (0..n).map(|i| TestItem::new(format!("t.py::test_{}", i))).collect()
    }

    /// Covers one line per test, in a file named after the shard.
    struct LineExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShardExecutor for LineExecutor {
        async fn run_shard(&self, shard: &ShardSpec) -> ExecutorResult<ShardRun> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let artifact = shard.tests.iter().enumerate().fold(
                CoverageArtifact::new(shard.index, ArtifactStatus::Success),
                |a, (i, _)| a.with_hits(SourceLocation::line(format!("s{}.py", shard.index), i as u32 + 1), 1),
            );
            Ok(ShardRun {
                passed: true,
                artifact,
            })
        }

        fn name(&self) -> &str {
            "line"
        }
    }

    #[tokio::test]
    async fn test_all_shards_merge() {
        let executor = LineExecutor {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = Orchestrator::new(config(3, ""), executor, NullReporter);

        let result = orchestrator.run(&tests(7)).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.merged.total(), 7);
        assert_eq!(result.gate.coverage, 100.0);
        assert_eq!(orchestrator.executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_shards_skip_executor() {
        let executor = LineExecutor {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = Orchestrator::new(config(4, ""), executor, NullReporter);

        let result = orchestrator.run(&tests(2)).await.unwrap();
        assert!(result.passed());
        assert!(result.merged.missing_shards().is_empty());
        assert_eq!(orchestrator.executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_size_must_match() {
        let executor = LineExecutor {
            calls: AtomicUsize::new(0),
        };
        let orchestrator = Orchestrator::new(config(2, ""), executor, NullReporter)
            .with_store(Arc::new(ArtifactStore::new(3)));

        let err = orchestrator.run(&tests(2)).await.unwrap_err();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    struct BrokenExecutor;

    #[async_trait]
    impl ShardExecutor for BrokenExecutor {
        async fn run_shard(&self, shard: &ShardSpec) -> ExecutorResult<ShardRun> {
            if shard.index == 2 {
                return Err(ExecutorError::ArtifactMissing("shard-2.json".to_string()));
            }
            Ok(ShardRun {
                passed: true,
                artifact: CoverageArtifact::new(shard.index, ArtifactStatus::Success)
                    .with_hits(SourceLocation::line("a.py", shard.index as u32), 1),
            })
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_executor_error_recorded_as_missing() {
        let lenient = Orchestrator::new(config(2, ""), BrokenExecutor, NullReporter);
        let result = lenient.run(&tests(2)).await.unwrap();
        assert!(result.passed());
        assert_eq!(result.gate.missing_shards, vec![2]);
        assert!(result.rendered.summary.contains("No coverage artifact at shard-2.json"));

        let mut strict_config = config(2, "");
        strict_config.gate.fail_strict = true;
        let strict = Orchestrator::new(strict_config, BrokenExecutor, NullReporter);
        assert!(!strict.run(&tests(2)).await.unwrap().passed());
    }

    #[test]
    fn test_merge_artifacts_gates_failures() {
        let artifacts: BTreeMap<_, _> = [
            (1, CoverageArtifact::new(1, ArtifactStatus::Success)
                .with_hits(SourceLocation::line("a.py", 1), 1)),
            (2, CoverageArtifact::new(2, ArtifactStatus::Failure)
                .with_hits(SourceLocation::line("a.py", 2), 1)),
        ]
        .into();

        let result = merge_artifacts(&MergeConfig::from(&config(2, "")), &artifacts).unwrap();
        assert!(result.assignment.is_none());
        assert_eq!(result.gate.failing_shards, vec![2]);
        assert_eq!(result.exit_code(), 1);
    }
}
