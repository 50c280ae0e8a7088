//! shardcov: sharded test runs with merged coverage gating.
//!
//! This crate splits a test suite into N shards, runs the shards
//! concurrently, collects one coverage artifact per shard, merges them into a
//! single coverage result and decides whether the run passes.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: Find the tests to distribute (test list file or command)
//! - **Partition**: Deterministically assign tests to shards
//! - **Executor**: Run one shard and return its coverage artifact
//! - **Store**: Stage artifacts per shard until the merge
//! - **Coverage**: Artifact formats and the deterministic merge
//! - **Gate**: Pass/fail decision from shard outcomes and coverage
//! - **Report**: Summary, JSON and Cobertura output
//!
//! # Example
//!
//! ```no_run
//! use shardcov::config::load_merge_config;
//! use shardcov::orchestrator::merge_artifacts;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = load_merge_config(std::path::Path::new("shardcov.toml"))?;
//!     let result = merge_artifacts(&config, &Default::default())?;
//!     println!("{}", result.rendered.summary);
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod coverage;
pub mod discovery;
pub mod executor;
pub mod gate;
pub mod orchestrator;
pub mod partition;
pub mod report;
pub mod store;

// Re-export commonly used types
pub use config::{Config, ConfigurationError, MergeConfig, load_config};
pub use coverage::{ArtifactStatus, CoverageArtifact, MergedCoverage, Merger, SourceLocation};
pub use discovery::{TestDiscoverer, TestItem};
pub use executor::{ShardExecutor, ShardRun, ShardSpec};
pub use gate::{GatePolicy, GateResult};
pub use orchestrator::{Orchestrator, PipelineResult, merge_artifacts};
pub use partition::{PartitionStrategy, Partitioner, ShardAssignment};
pub use report::Reporter;
pub use store::ArtifactStore;
