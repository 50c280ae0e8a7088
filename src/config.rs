//! Configuration loading and schema definitions for shardcov.
//!
//! This module provides types and functions for loading shardcov configuration
//! from TOML files or strings, plus the [`ConfigurationError`] raised when a
//! loaded configuration cannot be used. Configuration errors are fatal: they
//! are surfaced before any shard starts.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// A configuration value that makes a run impossible.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    /// The shard count must be at least 1.
    #[error("shard count must be at least 1, got {0}")]
    InvalidShardCount(usize),

    /// The coverage threshold must be a percentage.
    #[error("coverage threshold must be within 0..=100, got {0}")]
    InvalidThreshold(f64),

    /// Any other unusable setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Checks that a coverage threshold is a percentage in `0..=100`.
pub fn validate_threshold(threshold: f64) -> Result<f64, ConfigurationError> {
    if (0.0..=100.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(ConfigurationError::InvalidThreshold(threshold))
    }
}

/// Loads shardcov configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// Semantic checks (shard count, threshold range) are done separately by
/// [`Config::validate`].
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads the merge settings from a TOML file.
///
/// Unlike [`load_config`], the `[discovery]` and `[executor]` sections are
/// not required, and a missing file yields the defaults.
pub fn load_merge_config(path: &Path) -> Result<MergeConfig> {
    if !path.exists() {
        return Ok(MergeConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: MergeConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads shardcov configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardcov::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [shardcov]
///     shard_count = 4
///
///     [discovery]
///     type = "list"
///     path = "tests.txt"
///
///     [executor]
///     type = "process"
///     command = "pytest {tests}"
/// "#)?;
///
/// assert_eq!(config.shardcov.shard_count, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
