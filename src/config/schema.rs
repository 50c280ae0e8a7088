//! Configuration schema definitions for shardcov.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! tagged enums for discovery/executor type selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ShardcovConfig         - Core settings (shard count, strategy, wait bound)
//! ├── DiscoveryConfig        - Tagged enum selecting discovery type
//! │   ├── List               - Test ids read from a file
//! │   └── Command            - Test ids printed by a shell command
//! ├── ExecutorConfig         - Tagged enum selecting executor type
//! │   └── Process            - Local shell command per shard
//! ├── GateConfig             - Threshold and strictness policy
//! ├── CoverageConfig         - Merge inputs (baseline, path normalisation)
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigurationError;
use crate::partition::PartitionStrategy;

/// Root configuration structure for shardcov.
///
/// # Example
///
/// ```
/// use shardcov::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [shardcov]
///     shard_count = 4
///
///     [discovery]
///     type = "list"
///     path = "tests.txt"
///
///     [executor]
///     type = "process"
///     command = "pytest {tests} --cov-report=xml:{artifact}"
/// "#).unwrap();
/// assert_eq!(config.shardcov.shard_count, 4);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings (shard count, partition strategy, wait bound).
    #[serde(default)]
    pub shardcov: ShardcovConfig,

    /// How the test items are discovered.
    pub discovery: DiscoveryConfig,

    /// How a single shard is executed.
    pub executor: ExecutorConfig,

    /// Gate policy (optional, has defaults).
    #[serde(default)]
    pub gate: GateConfig,

    /// Merge inputs (optional, has defaults).
    #[serde(default)]
    pub coverage: CoverageConfig,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Checks the values serde cannot express as types.
    ///
    /// Called before any shard starts; a failure here aborts the run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_shards_and_gate(&self.shardcov, &self.gate)?;
        let ExecutorConfig::Process(process) = &self.executor;
        if process.command.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "executor.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The sections merging collected artifacts reads.
///
/// `[discovery]` and `[executor]` may be absent, so a CI merge job can use a
/// file with just `[shardcov]` and `[gate]`, or no file at all.
///
/// ```
/// use shardcov::config::MergeConfig;
///
/// let config: MergeConfig = toml::from_str("[gate]\nfail_strict = true").unwrap();
/// assert!(config.gate.fail_strict);
/// assert_eq!(config.shardcov.shard_count, 6);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub shardcov: ShardcovConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub coverage: CoverageConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

impl MergeConfig {
    /// Checks the shard count and threshold.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_shards_and_gate(&self.shardcov, &self.gate)
    }
}

impl From<&Config> for MergeConfig {
    fn from(config: &Config) -> Self {
        Self {
            shardcov: config.shardcov.clone(),
            gate: config.gate.clone(),
            coverage: config.coverage.clone(),
            report: config.report.clone(),
        }
    }
}

fn validate_shards_and_gate(
    shardcov: &ShardcovConfig,
    gate: &GateConfig,
) -> Result<(), ConfigurationError> {
    if shardcov.shard_count == 0 {
        return Err(ConfigurationError::InvalidShardCount(0));
    }
    if let Some(threshold) = gate.threshold {
        super::validate_threshold(threshold)?;
    }
    Ok(())
}

/// Core shardcov settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `shard_count` | 6 |
/// | `strategy` | `round-robin` |
/// | `wait_timeout_secs` | 3600 (1 hour) |
/// | `fail_fast` | false |
/// | `stream_output` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardcovConfig {
    /// Number of shards the suite is split into. Must be at least 1.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// How test items are assigned to shards.
    #[serde(default)]
    pub strategy: PartitionStrategy,

    /// Upper bound on how long the merge waits for all shard artifacts.
    ///
    /// When it elapses, the merge proceeds with whatever has arrived and the
    /// absent shards are recorded as missing.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Cancel still-running shards as soon as one shard fails.
    ///
    /// Cancelled shards are recorded as missing, not failed.
    #[serde(default)]
    pub fail_fast: bool,

    /// Echo executor output prefixed with the shard index.
    #[serde(default)]
    pub stream_output: bool,
}

impl Default for ShardcovConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            strategy: PartitionStrategy::default(),
            wait_timeout_secs: default_wait_timeout(),
            fail_fast: false,
            stream_output: false,
        }
    }
}

fn default_shard_count() -> usize {
    6
}

fn default_wait_timeout() -> u64 {
    3600 // 1 hour
}

/// Test discovery configuration.
///
/// # Example
///
/// ```toml
/// [discovery]
/// type = "command"
/// discover_command = "pytest --collect-only -q | grep '::'"
/// working_dir = "."
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    /// Read test ids from a file, one per line.
    List(ListDiscoveryConfig),

    /// Run a shell command that prints test ids, one per line.
    Command(CommandDiscoveryConfig),
}

/// Configuration for file-based discovery.
///
/// Each non-empty, non-comment line is a test id, optionally followed by a
/// tab and an estimated cost used by the `cost-balanced` strategy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListDiscoveryConfig {
    /// Path of the test list file.
    pub path: PathBuf,
}

/// Configuration for command-based discovery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandDiscoveryConfig {
    /// Shell command printing one test id per line.
    pub discover_command: String,

    /// Working directory for the command.
    pub working_dir: Option<PathBuf>,

    /// Shell used to run the command.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Executor configuration specifying how a shard runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorConfig {
    /// Run each shard as a local shell command.
    Process(ProcessExecutorConfig),
}

/// Configuration for the process executor.
///
/// # Command Placeholders
///
/// | Placeholder | Replaced with |
/// |-------------|---------------|
/// | `{shard}` | 1-based shard index |
/// | `{shard_count}` | Total number of shards |
/// | `{tests}` | Shell-quoted test ids, space separated |
/// | `{artifact}` | Path the coverage artifact must be written to |
///
/// # Example
///
/// ```toml
/// [executor]
/// type = "process"
/// command = "pytest -v {tests} --cov=pkg --cov-report=xml:{artifact}"
/// artifact_format = "cobertura"
/// timeout_secs = 1800
///
/// [executor.env]
/// PYTHONPATH = "src"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessExecutorConfig {
    /// Command template run once per shard.
    pub command: String,

    /// Format of the artifact the command writes.
    #[serde(default)]
    pub artifact_format: ArtifactFormat,

    /// Working directory for spawned processes.
    pub working_dir: Option<PathBuf>,

    /// Environment variables set for every shard process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used to run the command (`{shell} -c "{command}"`).
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Per-shard execution timeout in seconds.
    ///
    /// Default: 3600 (1 hour)
    #[serde(default = "default_shard_timeout")]
    pub timeout_secs: u64,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_shard_timeout() -> u64 {
    3600
}

/// Format of a coverage artifact on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Decide from the file extension, then from the content.
    #[default]
    Auto,
    /// The shardcov JSON wire format.
    Json,
    /// Cobertura XML as written by coverage.py, tarpaulin, etc.
    Cobertura,
}

/// Gate policy.
///
/// # Example
///
/// ```toml
/// [gate]
/// threshold = 80.0
/// fail_strict = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GateConfig {
    /// Minimum overall coverage percentage (0-100). Unset means no minimum.
    pub threshold: Option<f64>,

    /// Fail the gate when a shard is missing or an artifact is inconsistent.
    #[serde(default)]
    pub fail_strict: bool,
}

/// Merge inputs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CoverageConfig {
    /// JSON file listing every instrumentable location.
    ///
    /// Locations listed here but absent from every artifact count as
    /// uncovered instead of being left out of the totals.
    pub known_locations: Option<PathBuf>,

    /// Leading path removed from every file name in every artifact.
    pub strip_prefix: Option<String>,
}

/// Configuration for report output.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"coverage-results"` |
/// | `json` | `true` |
/// | `json_file` | `"coverage.json"` |
/// | `cobertura` | `true` |
/// | `cobertura_file` | `"coverage.xml"` |
/// | `summary_file` | `"summary.txt"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files and shard artifacts are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write the JSON report.
    #[serde(default = "default_true")]
    pub json: bool,

    /// Filename of the JSON report inside `output_dir`.
    #[serde(default = "default_json_file")]
    pub json_file: String,

    /// Whether to write a merged Cobertura XML report.
    #[serde(default = "default_true")]
    pub cobertura: bool,

    /// Filename of the Cobertura report inside `output_dir`.
    #[serde(default = "default_cobertura_file")]
    pub cobertura_file: String,

    /// Filename of the textual summary inside `output_dir`.
    #[serde(default = "default_summary_file")]
    pub summary_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            json: true,
            json_file: default_json_file(),
            cobertura: true,
            cobertura_file: default_cobertura_file(),
            summary_file: default_summary_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("coverage-results")
}

fn default_true() -> bool {
    true
}

fn default_json_file() -> String {
    "coverage.json".to_string()
}

fn default_cobertura_file() -> String {
    "coverage.xml".to_string()
}

fn default_summary_file() -> String {
    "summary.txt".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [discovery]
        type = "list"
        path = "tests.txt"

        [executor]
        type = "process"
        command = "run {tests}"
    "#;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.shardcov.shard_count, 6);
        assert_eq!(config.shardcov.strategy, PartitionStrategy::RoundRobin);
        assert_eq!(config.shardcov.wait_timeout_secs, 3600);
        assert!(!config.shardcov.fail_fast);
        assert!(config.gate.threshold.is_none());
        assert!(!config.gate.fail_strict);
        assert_eq!(config.report.output_dir, PathBuf::from("coverage-results"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.shardcov.shard_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidShardCount(0))
        ));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.gate.threshold = Some(100.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidThreshold(_))
        ));
        config.gate.threshold = Some(f64::NAN);
        assert!(config.validate().is_err());
        config.gate.threshold = Some(100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_and_format_names() {
        let config: Config = toml::from_str(
            r#"
            [shardcov]
            strategy = "cost-balanced"

            [discovery]
            type = "command"
            discover_command = "cat tests.txt"

            [executor]
            type = "process"
            command = "run"
            artifact_format = "cobertura"
            "#,
        )
        .unwrap();
        assert_eq!(config.shardcov.strategy, PartitionStrategy::CostBalanced);
        let ExecutorConfig::Process(process) = &config.executor;
        assert_eq!(process.artifact_format, ArtifactFormat::Cobertura);
        assert_eq!(process.shell, "/bin/sh");
    }
}
