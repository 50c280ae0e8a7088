//! Coverage data model: per-shard artifacts and the merged dataset.
//!
//! A [`CoverageArtifact`] is what one shard produces: a map from
//! [`SourceLocation`] to hit count plus an [`ArtifactStatus`]. The
//! [`Merger`] folds every shard's artifact into one [`MergedCoverage`],
//! recording in its metadata any shard whose data is absent or unusable.
//!
//! ```text
//!  shard 1 ─► CoverageArtifact ┐
//!  shard 2 ─► CoverageArtifact ├─► ArtifactStore ─► Merger ─► MergedCoverage
//!  shard N ─► CoverageArtifact ┘
//! ```
//!
//! Artifacts arrive in the JSON wire format (see [`artifact`]) or as
//! Cobertura XML (see [`cobertura`]).

pub mod artifact;
pub mod cobertura;
pub mod merge;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use artifact::{ArtifactError, load_artifact, load_known_locations};
pub use merge::{FileCoverage, MergeMetadata, MergedCoverage, Merger};

/// A range of lines in one source file.
///
/// Ordered by file, then start line, then end line, so maps keyed by
/// location iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl SourceLocation {
    /// A single-line location.
    pub fn line(file: impl Into<String>, line: u32) -> Self {
        Self::range(file, line, line)
    }

    pub fn range(file: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            file: file.into(),
            start_line,
            end_line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}", self.file, self.start_line)
        } else {
            write!(f, "{}:{}-{}", self.file, self.start_line, self.end_line)
        }
    }
}

/// Outcome of a shard as carried by its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    /// The shard ran and its tests passed.
    Success,
    /// The shard ran and some tests failed. Its coverage still counts.
    Failure,
    /// No usable coverage arrived for the shard.
    Missing,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactStatus::Success => "success",
            ArtifactStatus::Failure => "failure",
            ArtifactStatus::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// Coverage produced by one shard.
///
/// Never mutated after it is handed to the store; a re-delivery for the same
/// shard replaces the whole artifact.
///
/// # Example
///
/// ```
/// use shardcov::coverage::{ArtifactStatus, CoverageArtifact, SourceLocation};
///
/// let artifact = CoverageArtifact::new(1, ArtifactStatus::Success)
///     .with_hits(SourceLocation::line("pkg/a.py", 3), 2)
///     .with_hits(SourceLocation::line("pkg/a.py", 4), 0);
///
/// assert_eq!(artifact.hits.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "artifact::ArtifactWire", into = "artifact::ArtifactWire")]
pub struct CoverageArtifact {
    /// 1-based index of the shard that produced this artifact.
    pub shard: usize,

    pub status: ArtifactStatus,

    /// Hit count per instrumented location. Zero means instrumented but
    /// never executed.
    pub hits: BTreeMap<SourceLocation, u64>,
}

impl CoverageArtifact {
    pub fn new(shard: usize, status: ArtifactStatus) -> Self {
        Self {
            shard,
            status,
            hits: BTreeMap::new(),
        }
    }

    /// Adds hits for a location, summing with any hits already recorded.
    pub fn with_hits(mut self, location: SourceLocation, hits: u64) -> Self {
        self.record(location, hits);
        self
    }

    pub fn with_status(mut self, status: ArtifactStatus) -> Self {
        self.status = status;
        self
    }

    /// Adds hits for a location, summing with any hits already recorded.
    pub fn record(&mut self, location: SourceLocation, hits: u64) {
        let entry = self.hits.entry(location).or_insert(0);
        *entry = entry.saturating_add(hits);
    }
}

/// Something that went wrong with one shard, recorded instead of raised.
///
/// Faults never abort a run: they are collected into the merged metadata and
/// the gate result so a failing run is diagnosable from the report alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardFault {
    /// The shard ran but its tests failed.
    #[error("shard {shard}: tests failed")]
    ExecutionFailure { shard: usize },

    /// No artifact arrived for the shard.
    #[error("shard {shard}: artifact missing ({reason})")]
    Missing { shard: usize, reason: String },

    /// An artifact did not fit the expected shard layout and was ignored.
    #[error("artifact for shard {shard} ignored: {reason}")]
    MergeInconsistency { shard: usize, reason: String },
}

impl ShardFault {
    pub fn shard(&self) -> usize {
        match self {
            ShardFault::ExecutionFailure { shard }
            | ShardFault::Missing { shard, .. }
            | ShardFault::MergeInconsistency { shard, .. } => *shard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sums_duplicate_locations() {
        let mut artifact = CoverageArtifact::new(2, ArtifactStatus::Success);
        artifact.record(SourceLocation::line("a.rs", 1), 2);
        artifact.record(SourceLocation::line("a.rs", 1), 3);
        assert_eq!(artifact.hits[&SourceLocation::line("a.rs", 1)], 5);
    }

    #[test]
    fn test_location_display() {
        assert_eq!(SourceLocation::line("a.py", 7).to_string(), "a.py:7");
        assert_eq!(SourceLocation::range("a.py", 7, 9).to_string(), "a.py:7-9");
    }

    #[test]
    fn test_fault_messages() {
        let fault = ShardFault::Missing {
            shard: 3,
            reason: "timed out".to_string(),
        };
        assert_eq!(fault.to_string(), "shard 3: artifact missing (timed out)");
        assert_eq!(fault.shard(), 3);
    }
}
