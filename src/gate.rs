//! Pass/fail gating of a run.
//!
//! [`evaluate`] is a pure function of the shard outcomes, the merged
//! coverage and a [`GatePolicy`]. A run fails when:
//!
//! | Condition | Always | Only with `fail_strict` |
//! |-----------|--------|-------------------------|
//! | A shard's tests failed | ✓ | |
//! | Coverage below a configured threshold | ✓ | |
//! | A shard's artifact is missing | | ✓ |
//! | An artifact was ignored as inconsistent | | ✓ |
//!
//! The threshold is inclusive: 80% passes a threshold of 80.

use serde::{Deserialize, Serialize};

use crate::config::{ConfigurationError, GateConfig, validate_threshold};
use crate::coverage::{MergedCoverage, ShardFault};

/// Thresholds and strictness applied by the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    threshold: Option<f64>,
    fail_strict: bool,
}

impl GatePolicy {
    /// Creates a policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidThreshold`] if the threshold is
    /// outside 0..=100.
    pub fn new(threshold: Option<f64>, fail_strict: bool) -> Result<Self, ConfigurationError> {
        let threshold = threshold.map(validate_threshold).transpose()?;
        Ok(Self {
            threshold,
            fail_strict,
        })
    }

    pub fn from_config(config: &GateConfig) -> Result<Self, ConfigurationError> {
        Self::new(config.threshold, config.fail_strict)
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    pub fn fail_strict(&self) -> bool {
        self.fail_strict
    }
}

/// The verdict of a run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,

    /// Shards whose tests failed.
    pub failing_shards: Vec<usize>,

    /// Shards with no usable artifact.
    pub missing_shards: Vec<usize>,

    /// Merged coverage percentage.
    pub coverage: f64,

    /// Threshold the coverage was held to, if any.
    pub threshold: Option<f64>,

    /// Human-readable reasons for a failure; empty when passed.
    pub reasons: Vec<String>,
}

impl GateResult {
    /// Process exit code: 0 when passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed { 0 } else { 1 }
    }
}

/// Decides whether the run passes.
///
/// `shard_passed` holds one `(shard index, tests passed)` flag per shard that
/// reported. Shards without a flag are judged by the merged metadata only.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use shardcov::coverage::{ArtifactStatus, CoverageArtifact, Merger, SourceLocation};
/// use shardcov::gate::{GatePolicy, evaluate};
///
/// let artifact = CoverageArtifact::new(1, ArtifactStatus::Success)
///     .with_hits(SourceLocation::line("a.py", 1), 1);
/// let merged = Merger::new(1).merge(&[(1, artifact)].into(), &BTreeMap::new());
///
/// let policy = GatePolicy::new(Some(80.0), true)?;
/// let result = evaluate(&policy, &[(1, true)], &merged);
/// assert!(result.passed);
/// assert_eq!(result.exit_code(), 0);
/// # Ok::<(), shardcov::config::ConfigurationError>(())
/// ```
pub fn evaluate(
    policy: &GatePolicy,
    shard_passed: &[(usize, bool)],
    merged: &MergedCoverage,
) -> GateResult {
    let mut reasons = Vec::new();

    let mut failing_shards: Vec<usize> = shard_passed
        .iter()
        .filter(|(_, passed)| !passed)
        .map(|(idx, _)| *idx)
        .chain(merged.failed_shards())
        .collect();
    failing_shards.sort_unstable();
    failing_shards.dedup();
    if !failing_shards.is_empty() {
        reasons.push(format!("tests failed in shard(s) {}", join(&failing_shards)));
    }

    let missing_shards = merged.missing_shards();
    if policy.fail_strict && !missing_shards.is_empty() {
        reasons.push(format!("missing artifacts for shard(s) {}", join(&missing_shards)));
    }

    let inconsistent: Vec<usize> = merged.inconsistencies().map(ShardFault::shard).collect();
    if policy.fail_strict && !inconsistent.is_empty() {
        reasons.push(format!(
            "inconsistent artifacts for shard(s) {}",
            join(&inconsistent)
        ));
    }

    let coverage = merged.percent();
    if let Some(threshold) = policy.threshold
        && coverage < threshold
    {
        reasons.push(format!(
            "coverage {:.2}% is below the {:.2}% threshold",
            coverage, threshold
        ));
    }

    GateResult {
        passed: reasons.is_empty(),
        failing_shards,
        missing_shards,
        coverage,
        threshold: policy.threshold,
        reasons,
    }
}

fn join(shards: &[usize]) -> String {
    shards
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::coverage::{ArtifactStatus, CoverageArtifact, Merger, SourceLocation};

    /// One shard covering `covered` of 100 lines of a single file.
    fn merged_with_percent(covered: u32) -> MergedCoverage {
        let artifact = (1..=100).fold(
            CoverageArtifact::new(1, ArtifactStatus::Success),
            |a, line| a.with_hits(SourceLocation::line("a.py", line), u64::from(line <= covered)),
        );
        Merger::new(1).merge(&[(1, artifact)].into(), &BTreeMap::new())
    }

    fn four_shards_missing_third() -> MergedCoverage {
        let artifacts: BTreeMap<_, _> = [1, 2, 4]
            .into_iter()
            .map(|idx| {
                let artifact = CoverageArtifact::new(idx, ArtifactStatus::Success)
                    .with_hits(SourceLocation::line(format!("f{}.py", idx), 1), 1);
                (idx, artifact)
            })
            .collect();
        let reasons = [(3, "timed out".to_string())].into();
        Merger::new(4).merge(&artifacts, &reasons)
    }

    #[test]
    fn test_threshold_table() {
        let cases = [
            // (threshold, covered, expected pass)
            (Some(80.0), 79, false),
            (Some(80.0), 80, true),
            (Some(80.0), 100, true),
            (None, 0, true),
            (Some(0.0), 0, true),
            (Some(100.0), 99, false),
        ];
        for (threshold, covered, expected) in cases {
            let policy = GatePolicy::new(threshold, false).unwrap();
            let result = evaluate(&policy, &[(1, true)], &merged_with_percent(covered));
            assert_eq!(
                result.passed, expected,
                "threshold {:?} with {}% covered",
                threshold, covered
            );
            assert_eq!(result.threshold, threshold);
        }
    }

    #[test]
    fn test_failed_shard_fails_regardless_of_coverage() {
        let policy = GatePolicy::new(None, false).unwrap();
        let result = evaluate(&policy, &[(1, false)], &merged_with_percent(100));
        assert!(!result.passed);
        assert_eq!(result.failing_shards, vec![1]);
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_missing_shard_fails_only_when_strict() {
        let merged = four_shards_missing_third();
        let flags = [(1, true), (2, true), (4, true)];

        let strict = evaluate(&GatePolicy::new(None, true).unwrap(), &flags, &merged);
        assert!(!strict.passed);
        assert_eq!(strict.missing_shards, vec![3]);

        let lenient = evaluate(&GatePolicy::new(None, false).unwrap(), &flags, &merged);
        assert!(lenient.passed);
        assert_eq!(lenient.missing_shards, vec![3]);
    }

    #[test]
    fn test_inconsistent_artifact_fails_only_when_strict() {
        let good = CoverageArtifact::new(1, ArtifactStatus::Success)
            .with_hits(SourceLocation::line("a.py", 1), 1);
        let stray = CoverageArtifact::new(5, ArtifactStatus::Success);
        let merged = Merger::new(1).merge(&[(1, good), (5, stray)].into(), &BTreeMap::new());

        assert!(evaluate(&GatePolicy::new(None, false).unwrap(), &[(1, true)], &merged).passed);
        let strict = evaluate(&GatePolicy::new(None, true).unwrap(), &[(1, true)], &merged);
        assert!(!strict.passed);
        assert!(strict.reasons[0].contains("inconsistent"));
    }

    #[test]
    fn test_invalid_threshold_is_configuration_error() {
        assert!(matches!(
            GatePolicy::new(Some(101.0), false),
            Err(ConfigurationError::InvalidThreshold(_))
        ));
        assert!(GatePolicy::new(Some(-1.0), false).is_err());
    }
}
