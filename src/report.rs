//! Coverage reporting and run progress output.
//!
//! [`render`] turns a [`MergedCoverage`] into a machine-readable
//! [`CoverageReport`] and a plain-text summary. It does no I/O; writing the
//! results somewhere is the job of a [`Reporter`], which also receives the
//! progress events of a run.

pub mod cobertura;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ReportConfig;
use crate::coverage::{ArtifactStatus, MergedCoverage, ShardFault};
use crate::executor::ShardSpec;
use crate::gate::GateResult;
use crate::orchestrator::PipelineResult;
use crate::partition::ShardAssignment;

/// Machine-readable coverage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Overall coverage in percent, weighted by location.
    pub percent: f64,
    pub covered: usize,
    pub total: usize,

    /// One entry per file, sorted by path.
    pub files: Vec<FileReport>,

    /// One entry per expected shard, in index order.
    pub shards: Vec<ShardReport>,

    pub faults: Vec<ShardFault>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub path: String,
    pub covered: usize,
    pub total: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard: usize,
    pub status: ArtifactStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Output of [`render`].
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub report: CoverageReport,

    /// Line-oriented summary for humans and CI logs.
    pub summary: String,
}

/// Renders merged coverage into a report and a textual summary.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use shardcov::coverage::{ArtifactStatus, CoverageArtifact, Merger, SourceLocation};
/// use shardcov::report::render;
///
/// let artifact = CoverageArtifact::new(1, ArtifactStatus::Success)
///     .with_hits(SourceLocation::line("a.py", 1), 1)
///     .with_hits(SourceLocation::line("a.py", 2), 0);
/// let merged = Merger::new(1).merge(&[(1, artifact)].into(), &BTreeMap::new());
///
/// let rendered = render(&merged);
/// assert_eq!(rendered.report.files.len(), 1);
/// assert!(rendered.summary.contains("a.py"));
/// assert!(rendered.summary.contains("50.00%"));
/// ```
pub fn render(merged: &MergedCoverage) -> RenderedReport {
    let files: Vec<FileReport> = merged
        .files
        .iter()
        .map(|(path, file)| FileReport {
            path: path.clone(),
            covered: file.covered,
            total: file.total,
            percent: file.percent(),
        })
        .collect();

    let shards: Vec<ShardReport> = merged
        .metadata
        .shards
        .iter()
        .map(|(&shard, &status)| ShardReport {
            shard,
            status,
            reason: missing_reason(merged, shard),
        })
        .collect();

    let report = CoverageReport {
        percent: merged.percent(),
        covered: merged.covered(),
        total: merged.total(),
        files,
        shards,
        faults: merged.metadata.faults.clone(),
    };
    let summary = summarize(&report);

    RenderedReport { report, summary }
}

fn missing_reason(merged: &MergedCoverage, shard: usize) -> Option<String> {
    merged.metadata.faults.iter().find_map(|fault| match fault {
        ShardFault::Missing { shard: s, reason } if *s == shard => Some(reason.clone()),
        _ => None,
    })
}

fn summarize(report: &CoverageReport) -> String {
    let width = report
        .files
        .iter()
        .map(|f| f.path.len())
        .max()
        .unwrap_or(0)
        .max("File".len());

    let mut lines = Vec::new();
    lines.push(format!("{:<width$}  {:>15}  {:>7}", "File", "Covered", "Cover"));
    for file in &report.files {
        lines.push(format!(
            "{:<width$}  {:>15}  {:>6.2}%",
            file.path,
            format!("{}/{}", file.covered, file.total),
            file.percent
        ));
    }
    lines.push(String::new());

    lines.push("Shards:".to_string());
    for shard in &report.shards {
        match &shard.reason {
            Some(reason) => lines.push(format!("  shard {}: {} ({})", shard.shard, shard.status, reason)),
            None => lines.push(format!("  shard {}: {}", shard.shard, shard.status)),
        }
    }
    for fault in &report.faults {
        if let ShardFault::MergeInconsistency { .. } = fault {
            lines.push(format!("  {}", fault));
        }
    }
    lines.push(String::new());

    lines.push(format!(
        "Overall: {:.2}% ({}/{} locations)",
        report.percent, report.covered, report.total
    ));

    let mut summary = lines.join("\n");
    summary.push('\n');
    summary
}

/// How one shard ended, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOutcome {
    pub shard: usize,
    pub status: ArtifactStatus,
    pub duration: Duration,

    /// Executor error or cancellation reason for a missing shard.
    pub error: Option<String>,
}

/// A reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the tests have been split into shards.
    async fn on_partition_complete(&self, assignment: &ShardAssignment);

    /// Called when a shard is handed to the executor.
    async fn on_shard_start(&self, shard: &ShardSpec);

    /// Called when a shard finished, failed to produce coverage, or was cancelled.
    async fn on_shard_complete(&self, outcome: &ShardOutcome);

    /// Called after merging and gating.
    async fn on_run_complete(&self, result: &PipelineResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_partition_complete(&self, _assignment: &ShardAssignment) {}
    async fn on_shard_start(&self, _shard: &ShardSpec) {}
    async fn on_shard_complete(&self, _outcome: &ShardOutcome) {}
    async fn on_run_complete(&self, _result: &PipelineResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_partition_complete(&self, assignment: &ShardAssignment) {
        for reporter in &self.reporters {
            reporter.on_partition_complete(assignment).await;
        }
    }

    async fn on_shard_start(&self, shard: &ShardSpec) {
        for reporter in &self.reporters {
            reporter.on_shard_start(shard).await;
        }
    }

    async fn on_shard_complete(&self, outcome: &ShardOutcome) {
        for reporter in &self.reporters {
            reporter.on_shard_complete(outcome).await;
        }
    }

    async fn on_run_complete(&self, result: &PipelineResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows shard progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn progress(&self) -> MutexGuard<'_, Option<indicatif::ProgressBar>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_partition_complete(&self, assignment: &ShardAssignment) {
        println!(
            "Split {} tests into {} shards",
            assignment.total_tests(),
            assignment.shard_count()
        );

        let pb = indicatif::ProgressBar::new(assignment.shard_count() as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} shards")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress() = Some(pb);
    }

    async fn on_shard_start(&self, shard: &ShardSpec) {
        if self.verbose {
            let message = format!("Starting shard {} ({} tests)", shard.index, shard.tests.len());
            match self.progress().as_ref() {
                Some(pb) => pb.println(message),
                None => println!("{}", message),
            }
        }
    }

    async fn on_shard_complete(&self, outcome: &ShardOutcome) {
        let status = match outcome.status {
            ArtifactStatus::Success => console::style("PASS").green(),
            ArtifactStatus::Failure => console::style("FAIL").red(),
            ArtifactStatus::Missing => console::style("MISS").red().bold(),
        };
        let mut line = format!("{} shard {} in {:.1?}", status, outcome.shard, outcome.duration);
        if let Some(error) = &outcome.error {
            line.push_str(&format!(" {}", console::style(error).dim()));
        }

        let progress = self.progress();
        if let Some(pb) = progress.as_ref() {
            pb.inc(1);
            if self.verbose || outcome.status != ArtifactStatus::Success {
                pb.println(line);
            }
        } else if self.verbose || outcome.status != ArtifactStatus::Success {
            println!("{}", line);
        }
    }

    async fn on_run_complete(&self, result: &PipelineResult) {
        if let Some(pb) = self.progress().take() {
            pb.finish_and_clear();
        }

        println!();
        print!("{}", result.rendered.summary);
        println!();

        let gate = &result.gate;
        if let Some(threshold) = gate.threshold {
            println!("Threshold: {:.2}%", threshold);
        }
        if gate.passed {
            println!("{}", console::style("Coverage gate passed.").green().bold());
        } else {
            println!("{}", console::style("Coverage gate failed:").red().bold());
            for reason in &gate.reasons {
                println!("  - {}", reason);
            }
        }
    }
}

/// The JSON document written by [`FileReporter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub gate: GateResult,
    pub coverage: CoverageReport,
}

/// Reporter that persists the merged results into an output directory.
///
/// Writes the JSON report, a Cobertura XML document and the text summary,
/// each switchable through [`ReportConfig`]. Parent directories are created
/// as needed; existing files are overwritten.
pub struct FileReporter {
    config: ReportConfig,
}

impl FileReporter {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Writes every enabled output and returns the paths written.
    pub fn write(&self, result: &PipelineResult) -> anyhow::Result<Vec<PathBuf>> {
        let dir = &self.config.output_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let mut written = Vec::new();

        if self.config.json {
            let document = RunDocument {
                run_id: result.run_id.clone(),
                generated_at: Utc::now(),
                gate: result.gate.clone(),
                coverage: result.rendered.report.clone(),
            };
            let path = dir.join(&self.config.json_file);
            let json = serde_json::to_string_pretty(&document)?;
            write_file(&path, json)?;
            written.push(path);
        }

        if self.config.cobertura {
            let path = dir.join(&self.config.cobertura_file);
            write_file(&path, cobertura::to_xml(&result.merged)?)?;
            written.push(path);
        }

        let path = dir.join(&self.config.summary_file);
        write_file(&path, &result.rendered.summary)?;
        written.push(path);

        Ok(written)
    }
}

fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

#[async_trait]
impl Reporter for FileReporter {
    async fn on_partition_complete(&self, _assignment: &ShardAssignment) {}
    async fn on_shard_start(&self, _shard: &ShardSpec) {}
    async fn on_shard_complete(&self, _outcome: &ShardOutcome) {}

    async fn on_run_complete(&self, result: &PipelineResult) {
        match self.write(result) {
            Ok(paths) => {
                for path in paths {
                    tracing::info!("Report written to: {}", path.display());
                }
            }
            Err(e) => tracing::error!("Failed to write reports: {:#}", e),
        }
    }
}
