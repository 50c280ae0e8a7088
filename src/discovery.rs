//! Test item discovery.
//!
//! Discovery turns "whatever the test framework knows about" into an ordered
//! list of [`TestItem`]s. Order matters: the partitioner is deterministic over
//! discovery order, so the same list always produces the same shards.
//!
//! # Built-in Discoverers
//!
//! | Implementation | Source |
//! |----------------|--------|
//! | [`ListDiscoverer`] | A file with one test id per line |
//! | [`CommandDiscoverer`] | The stdout of a shell command |
//!
//! Both accept the same line format: a test id, optionally followed by a tab
//! and an estimated cost. Blank lines and lines starting with `#` are ignored.
//!
//! ```text
//! tests/test_ocp.py::test_pendulum	12.5
//! tests/test_ocp.py::test_arm
//! # comment
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CommandDiscoveryConfig, ListDiscoveryConfig};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while discovering test items.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The discovery command could not be run or exited non-zero.
    #[error("Discovery command failed: {0}")]
    CommandFailed(String),

    /// A line could not be parsed.
    #[error("Invalid test line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    /// The same test id was discovered twice.
    #[error("Duplicate test id: {0}")]
    DuplicateTest(String),

    /// I/O error reading the test list.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single discovered test.
///
/// Immutable once discovered: the partitioner only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    /// Unique identifier, as understood by the test framework.
    pub id: String,

    /// Estimated cost (typically seconds) used by cost-balanced partitioning.
    pub cost: Option<f64>,

    /// Module or file the test belongs to.
    pub module: String,
}

impl TestItem {
    /// Creates a test item, deriving the module path from the id.
    ///
    /// ```
    /// use shardcov::discovery::TestItem;
    ///
    /// assert_eq!(TestItem::new("tests/test_a.py::TestX::test_y").module, "tests/test_a.py");
    /// assert_eq!(TestItem::new("crate::io::tests::reads").module, "crate::io::tests");
    /// assert_eq!(TestItem::new("standalone").module, "standalone");
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let module = module_of(&id).to_string();
        Self {
            id,
            cost: None,
            module,
        }
    }

    /// Sets the estimated cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// pytest ids name their file before the first `::`; Rust paths name their
/// module before the last `::`.
fn module_of(id: &str) -> &str {
    match id.find("::") {
        Some(idx) if id[..idx].contains('/') || id[..idx].contains('.') => &id[..idx],
        Some(_) => id.rfind("::").map(|idx| &id[..idx]).unwrap_or(id),
        None => id,
    }
}

/// Parses discovery output into test items, preserving line order.
pub fn parse_test_lines(content: &str) -> DiscoveryResult<Vec<TestItem>> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut columns = line.split('\t').map(str::trim);
        let id = columns.next().unwrap_or_default();
        let mut item = TestItem::new(id);

        if let Some(cost) = columns.next().filter(|c| !c.is_empty()) {
            let cost: f64 = cost.parse().map_err(|_| DiscoveryError::InvalidLine {
                line: idx + 1,
                reason: format!("cost '{}' is not a number", cost),
            })?;
            if !cost.is_finite() || cost < 0.0 {
                return Err(DiscoveryError::InvalidLine {
                    line: idx + 1,
                    reason: format!("cost {} must be a non-negative number", cost),
                });
            }
            item = item.with_cost(cost);
        }

        if !seen.insert(item.id.clone()) {
            return Err(DiscoveryError::DuplicateTest(item.id));
        }
        items.push(item);
    }

    Ok(items)
}

/// Finds the test items to distribute across shards.
#[async_trait]
pub trait TestDiscoverer: Send + Sync {
    /// Returns all test items in discovery order.
    async fn discover(&self) -> DiscoveryResult<Vec<TestItem>>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Reads test ids from a file.
pub struct ListDiscoverer {
    path: PathBuf,
}

impl ListDiscoverer {
    pub fn new(config: ListDiscoveryConfig) -> Self {
        Self { path: config.path }
    }
}

#[async_trait]
impl TestDiscoverer for ListDiscoverer {
    async fn discover(&self) -> DiscoveryResult<Vec<TestItem>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let items = parse_test_lines(&content)?;
        debug!("Read {} tests from {}", items.len(), self.path.display());
        Ok(items)
    }

    fn name(&self) -> &str {
        "list"
    }
}

/// Runs a shell command and reads test ids from its stdout.
pub struct CommandDiscoverer {
    config: CommandDiscoveryConfig,
}

impl CommandDiscoverer {
    pub fn new(config: CommandDiscoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TestDiscoverer for CommandDiscoverer {
    async fn discover(&self) -> DiscoveryResult<Vec<TestItem>> {
        let mut cmd = tokio::process::Command::new(&self.config.shell);
        cmd.arg("-c").arg(&self.config.discover_command);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!("Running discovery: {}", self.config.discover_command);
        let output = cmd
            .output()
            .await
            .map_err(|e| DiscoveryError::CommandFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DiscoveryError::CommandFailed(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_test_lines(&String::from_utf8_lossy(&output.stdout))
    }

    fn name(&self) -> &str {
        "command"
    }
}
