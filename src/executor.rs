//! Shard execution.
//!
//! The core does not run tests itself. A [`ShardExecutor`] is handed one
//! shard of the assignment and returns whether its tests passed together with
//! the coverage they produced. Each call is an independent unit of work: an
//! executor failing for one shard never touches another shard's data.
//!
//! ```text
//!  ShardSpec ──► ShardExecutor::run_shard() ──► ShardRun { passed, artifact }
//!                          │
//!                          └──► ExecutorError (shard recorded as missing)
//! ```
//!
//! Retrying is the executor's business; the orchestrator calls each shard
//! once.
//!
//! # Built-in Executors
//!
//! | Executor | Module | Description |
//! |----------|--------|-------------|
//! | Process | [`process`] | Runs a shell command per shard |
//!
//! # Implementing a Custom Executor
//!
//! ```no_run
//! use async_trait::async_trait;
//! use shardcov::coverage::{ArtifactStatus, CoverageArtifact};
//! use shardcov::executor::*;
//!
//! struct RemoteRunner;
//!
//! #[async_trait]
//! impl ShardExecutor for RemoteRunner {
//!     async fn run_shard(&self, shard: &ShardSpec) -> ExecutorResult<ShardRun> {
//!         // Dispatch shard.tests somewhere and fetch the coverage back.
//!         Ok(ShardRun {
//!             passed: true,
//!             artifact: CoverageArtifact::new(shard.index, ArtifactStatus::Success),
//!         })
//!     }
//!
//!     fn name(&self) -> &str {
//!         "remote"
//!     }
//! }
//! ```

pub mod process;

use async_trait::async_trait;

use crate::coverage::{ArtifactError, CoverageArtifact};

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors that keep a shard from producing an artifact.
///
/// A shard whose tests ran and failed is *not* an error: that is a
/// [`ShardRun`] with `passed == false`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The shard's process could not be started.
    #[error("Failed to start shard: {0}")]
    SpawnFailed(String),

    /// The shard ran longer than the executor allows.
    #[error("Shard timed out after {0}s")]
    Timeout(u64),

    /// The shard finished without writing its artifact.
    #[error("No coverage artifact at {0}")]
    ArtifactMissing(String),

    /// The artifact exists but cannot be decoded.
    #[error("Unreadable coverage artifact: {0}")]
    Artifact(#[from] ArtifactError),

    /// I/O error while preparing or collecting the shard.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Executor-specific error not covered by other variants.
    #[error("Executor error: {0}")]
    Other(#[from] anyhow::Error),
}

/// One shard of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    /// 1-based shard index.
    pub index: usize,

    /// Total number of shards in the run.
    pub shard_count: usize,

    /// Test ids to run, in discovery order.
    pub tests: Vec<String>,
}

/// What a shard produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRun {
    /// Whether every test in the shard passed.
    pub passed: bool,

    /// Coverage recorded while running the shard.
    pub artifact: CoverageArtifact,
}

/// Runs one shard's tests and collects its coverage.
///
/// Executors must be shareable across tasks: the orchestrator calls
/// `run_shard` for every shard concurrently.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Runs the tests of `shard`.
    async fn run_shard(&self, shard: &ShardSpec) -> ExecutorResult<ShardRun>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}
