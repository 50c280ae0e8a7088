//! Deterministic merging of shard artifacts.
//!
//! Merging is a pure summation over a map keyed by [`SourceLocation`], so the
//! result does not depend on the order in which shards completed. A location
//! counts as covered if any shard hit it.
//!
//! Per-file percentages are computed over every instrumentable location of
//! the file: the union of locations seen in any artifact plus the locations
//! of a known baseline that no artifact mentions. The latter count as
//! uncovered; leaving them out would inflate the percentage.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ArtifactStatus, CoverageArtifact, ShardFault, SourceLocation};

/// Coverage totals for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Locations with at least one hit.
    pub covered: usize,
    /// Instrumentable locations.
    pub total: usize,
}

impl FileCoverage {
    /// Covered share in percent. A file with no locations reports 0.
    pub fn percent(&self) -> f64 {
        percent(self.covered, self.total)
    }
}

/// What the merge knew about each shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMetadata {
    /// Expected number of shards.
    pub shard_count: usize,

    /// Status of every shard 1..=N, including absent ones.
    pub shards: BTreeMap<usize, ArtifactStatus>,

    /// Faults recorded during collection and merging.
    pub faults: Vec<ShardFault>,
}

/// The consolidated coverage of one run.
///
/// Created once per run by [`Merger::merge`] and never mutated afterwards.
/// The serializable view of it is [`CoverageReport`](crate::report::CoverageReport).
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCoverage {
    /// Hits per location, summed across shards.
    pub hits: BTreeMap<SourceLocation, u64>,

    /// Totals per file, keyed by path.
    pub files: BTreeMap<String, FileCoverage>,

    pub metadata: MergeMetadata,
}

impl MergedCoverage {
    pub fn covered(&self) -> usize {
        self.files.values().map(|f| f.covered).sum()
    }

    pub fn total(&self) -> usize {
        self.files.values().map(|f| f.total).sum()
    }

    /// Overall coverage in percent, weighted by location.
    pub fn percent(&self) -> f64 {
        percent(self.covered(), self.total())
    }

    /// Shards whose artifact never arrived (or arrived marked missing).
    pub fn missing_shards(&self) -> Vec<usize> {
        self.shards_with(ArtifactStatus::Missing)
    }

    /// Shards whose tests failed.
    pub fn failed_shards(&self) -> Vec<usize> {
        self.shards_with(ArtifactStatus::Failure)
    }

    /// Faults describing ignored artifacts.
    pub fn inconsistencies(&self) -> impl Iterator<Item = &ShardFault> {
        self.metadata
            .faults
            .iter()
            .filter(|f| matches!(f, ShardFault::MergeInconsistency { .. }))
    }

    fn shards_with(&self, status: ArtifactStatus) -> Vec<usize> {
        self.metadata
            .shards
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(idx, _)| *idx)
            .collect()
    }
}

fn percent(covered: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 * 100.0 / total as f64
    }
}

/// Combines shard artifacts into a [`MergedCoverage`].
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use shardcov::coverage::{ArtifactStatus, CoverageArtifact, Merger, SourceLocation};
///
/// let mut artifacts = BTreeMap::new();
/// artifacts.insert(1, CoverageArtifact::new(1, ArtifactStatus::Success)
///     .with_hits(SourceLocation::line("a.py", 1), 1)
///     .with_hits(SourceLocation::line("a.py", 2), 0));
/// artifacts.insert(2, CoverageArtifact::new(2, ArtifactStatus::Success)
///     .with_hits(SourceLocation::line("a.py", 2), 4));
///
/// let merged = Merger::new(2).merge(&artifacts, &BTreeMap::new());
/// assert_eq!(merged.percent(), 100.0);
/// assert_eq!(merged.hits[&SourceLocation::line("a.py", 2)], 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Merger {
    shard_count: usize,
    known: BTreeSet<SourceLocation>,
    strip_prefix: Option<String>,
}

impl Merger {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count,
            ..Default::default()
        }
    }

    /// Adds locations known to be instrumentable even if no shard reports them.
    pub fn with_known_locations(mut self, known: impl IntoIterator<Item = SourceLocation>) -> Self {
        self.known.extend(known);
        self
    }

    /// Removes `prefix` from the start of every file name before merging.
    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    /// Merges `artifacts` (keyed by the shard index they were stored under).
    ///
    /// `missing_reasons` explains why a shard has no artifact; shards with no
    /// artifact and no reason are recorded as "no artifact".
    pub fn merge(
        &self,
        artifacts: &BTreeMap<usize, CoverageArtifact>,
        missing_reasons: &BTreeMap<usize, String>,
    ) -> MergedCoverage {
        let mut hits: BTreeMap<SourceLocation, u64> = BTreeMap::new();
        let mut shards: BTreeMap<usize, ArtifactStatus> = BTreeMap::new();
        let mut faults = Vec::new();

        for (&key, artifact) in artifacts {
            if let Some(reason) = self.inconsistency(key, artifact) {
                warn!("Ignoring artifact stored for shard {}: {}", key, reason);
                faults.push(ShardFault::MergeInconsistency { shard: key, reason });
                continue;
            }

            for (location, count) in &artifact.hits {
                let entry = hits.entry(self.normalize(location)).or_insert(0);
                *entry = entry.saturating_add(*count);
            }
            shards.insert(key, artifact.status);
            debug!(
                "Merged {} locations from shard {} ({})",
                artifact.hits.len(),
                key,
                artifact.status
            );
        }

        for location in &self.known {
            hits.entry(self.normalize(location)).or_insert(0);
        }

        for idx in 1..=self.shard_count {
            match shards.get(&idx).copied() {
                Some(ArtifactStatus::Success) => {}
                Some(ArtifactStatus::Failure) => {
                    faults.push(ShardFault::ExecutionFailure { shard: idx });
                }
                Some(ArtifactStatus::Missing) => faults.push(ShardFault::Missing {
                    shard: idx,
                    reason: missing_reasons
                        .get(&idx)
                        .cloned()
                        .unwrap_or_else(|| "reported missing".to_string()),
                }),
                None => {
                    let reason = missing_reasons
                        .get(&idx)
                        .cloned()
                        .unwrap_or_else(|| "no artifact".to_string());
                    warn!("Shard {} has no artifact: {}", idx, reason);
                    shards.insert(idx, ArtifactStatus::Missing);
                    faults.push(ShardFault::Missing { shard: idx, reason });
                }
            }
        }
        faults.sort_by_key(ShardFault::shard);

        let mut files: BTreeMap<String, FileCoverage> = BTreeMap::new();
        for (location, count) in &hits {
            let file = files.entry(location.file.clone()).or_insert(FileCoverage {
                covered: 0,
                total: 0,
            });
            file.total += 1;
            if *count > 0 {
                file.covered += 1;
            }
        }

        MergedCoverage {
            hits,
            files,
            metadata: MergeMetadata {
                shard_count: self.shard_count,
                shards,
                faults,
            },
        }
    }

    fn inconsistency(&self, key: usize, artifact: &CoverageArtifact) -> Option<String> {
        if key == 0 || key > self.shard_count {
            Some(format!("shard index outside 1..={}", self.shard_count))
        } else if artifact.shard != key {
            Some(format!("artifact declares shard {}", artifact.shard))
        } else {
            None
        }
    }

    fn normalize(&self, location: &SourceLocation) -> SourceLocation {
        match &self.strip_prefix {
            Some(prefix) if location.file.starts_with(prefix.as_str()) => SourceLocation {
                file: location.file[prefix.len()..].to_string(),
                ..location.clone()
            },
            _ => location.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(shard: usize, lines: &[(&str, u32, u64)]) -> CoverageArtifact {
        lines.iter().fold(
            CoverageArtifact::new(shard, ArtifactStatus::Success),
            |a, (file, line, hits)| a.with_hits(SourceLocation::line(*file, *line), *hits),
        )
    }

    fn sample() -> Vec<CoverageArtifact> {
        vec![
            artifact(1, &[("a.py", 1, 1), ("a.py", 2, 0), ("b.py", 1, 0)]),
            artifact(2, &[("a.py", 2, 3), ("b.py", 2, 0)]),
            artifact(3, &[("b.py", 1, 2), ("c.py", 1, 5)]),
        ]
    }

    fn permutations(items: &[CoverageArtifact]) -> Vec<Vec<CoverageArtifact>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_merge_sums_hits_and_computes_percentages() {
        let artifacts: BTreeMap<_, _> = sample().into_iter().map(|a| (a.shard, a)).collect();
        let merged = Merger::new(3).merge(&artifacts, &BTreeMap::new());

        assert_eq!(merged.hits[&SourceLocation::line("a.py", 2)], 3);
        assert_eq!(merged.files["a.py"], FileCoverage { covered: 2, total: 2 });
        assert_eq!(merged.files["b.py"], FileCoverage { covered: 1, total: 2 });
        assert_eq!(merged.files["b.py"].percent(), 50.0);
        assert_eq!(merged.covered(), 4);
        assert_eq!(merged.total(), 5);
        assert_eq!(merged.percent(), 80.0);
        assert!(merged.metadata.faults.is_empty());
    }

    #[test]
    fn test_merge_is_independent_of_arrival_order() {
        let merger = Merger::new(3);
        let mut results = permutations(&sample()).into_iter().map(|order| {
            // Insertion order into the map mirrors arrival order.
            let mut artifacts = BTreeMap::new();
            for a in order {
                artifacts.insert(a.shard, a);
            }
            merger.merge(&artifacts, &BTreeMap::new())
        });
        let first = results.next().unwrap();
        for other in results {
            assert_eq!(first, other);
        }
    }

    #[test]
    fn test_known_locations_count_as_uncovered() {
        let artifacts: BTreeMap<_, _> = [(1, artifact(1, &[("a.py", 1, 1)]))].into();
        let merged = Merger::new(1)
            .with_known_locations([
                SourceLocation::line("a.py", 2),
                SourceLocation::line("never_run.py", 1),
            ])
            .merge(&artifacts, &BTreeMap::new());

        assert_eq!(merged.files["a.py"], FileCoverage { covered: 1, total: 2 });
        assert_eq!(merged.files["never_run.py"].percent(), 0.0);
        assert!((merged.percent() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_shards_are_recorded() {
        let artifacts: BTreeMap<_, _> = [
            (1, artifact(1, &[("a.py", 1, 1)])),
            (2, artifact(2, &[("b.py", 1, 1)])),
            (4, artifact(4, &[("d.py", 1, 1)])),
        ]
        .into();
        let reasons: BTreeMap<_, _> = [(3, "timed out".to_string())].into();
        let merged = Merger::new(4).merge(&artifacts, &reasons);

        assert_eq!(merged.missing_shards(), vec![3]);
        assert_eq!(
            merged.metadata.faults,
            vec![ShardFault::Missing {
                shard: 3,
                reason: "timed out".to_string()
            }]
        );
        assert_eq!(merged.files.len(), 3);
    }

    #[test]
    fn test_out_of_range_artifact_is_ignored() {
        let artifacts: BTreeMap<_, _> = [
            (1, artifact(1, &[("a.py", 1, 1)])),
            (7, artifact(7, &[("zzz.py", 1, 1)])),
        ]
        .into();
        let merged = Merger::new(1).merge(&artifacts, &BTreeMap::new());

        assert!(!merged.files.contains_key("zzz.py"));
        assert_eq!(merged.inconsistencies().count(), 1);
        assert_eq!(merged.metadata.shards.len(), 1);
    }

    #[test]
    fn test_mismatched_shard_index_is_ignored() {
        let artifacts: BTreeMap<_, _> = [(2, artifact(1, &[("a.py", 1, 1)]))].into();
        let merged = Merger::new(2).merge(&artifacts, &BTreeMap::new());

        assert_eq!(merged.inconsistencies().count(), 1);
        assert_eq!(merged.missing_shards(), vec![1, 2]);
    }

    #[test]
    fn test_failed_shard_coverage_still_counts() {
        let failed = artifact(1, &[("a.py", 1, 1)]).with_status(ArtifactStatus::Failure);
        let merged = Merger::new(1).merge(&[(1, failed)].into(), &BTreeMap::new());

        assert_eq!(merged.percent(), 100.0);
        assert_eq!(merged.failed_shards(), vec![1]);
        assert_eq!(
            merged.metadata.faults,
            vec![ShardFault::ExecutionFailure { shard: 1 }]
        );
    }

    #[test]
    fn test_strip_prefix_merges_checkouts() {
        let artifacts: BTreeMap<_, _> = [
            (1, artifact(1, &[("/ci/one/pkg/a.py", 1, 1)])),
            (2, artifact(2, &[("pkg/a.py", 1, 2)])),
        ]
        .into();
        let merged = Merger::new(2)
            .with_strip_prefix("/ci/one/")
            .merge(&artifacts, &BTreeMap::new());

        assert_eq!(merged.files.len(), 1);
        assert_eq!(merged.hits[&SourceLocation::line("pkg/a.py", 1)], 3);
    }

    #[test]
    fn test_empty_merge_reports_zero_percent() {
        let merged = Merger::new(0).merge(&BTreeMap::new(), &BTreeMap::new());
        assert_eq!(merged.total(), 0);
        assert_eq!(merged.percent(), 0.0);
    }
}
