//! shardcov CLI - sharded test runs with merged coverage gating.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardcov::config::{
    self, ArtifactFormat, Config, DiscoveryConfig, ExecutorConfig, GateConfig, ReportConfig,
    ShardcovConfig,
};
use shardcov::coverage::{CoverageArtifact, load_artifact};
use shardcov::discovery::{CommandDiscoverer, ListDiscoverer, TestDiscoverer, TestItem};
use shardcov::executor::process::ProcessExecutor;
use shardcov::orchestrator::{Orchestrator, PipelineResult, merge_artifacts};
use shardcov::partition::Partitioner;
use shardcov::report::{ConsoleReporter, FileReporter, MultiReporter, Reporter};

#[derive(Parser)]
#[command(name = "shardcov")]
#[command(about = "Sharded test runs with merged coverage gating", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shardcov.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, shard, run, merge and gate
    Run {
        /// Override the number of shards
        #[arg(short, long)]
        shards: Option<usize>,

        /// Minimum overall coverage percentage
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Fail when a shard's artifact is missing
        #[arg(long)]
        fail_strict: bool,

        /// Cancel running shards after the first failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Print the shard assignment without running anything
    Partition {
        /// Override the number of shards
        #[arg(short, long)]
        shards: Option<usize>,

        /// Only print the test ids of this shard, one per line
        #[arg(long)]
        shard: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Merge artifact files from separate jobs and gate the result
    Merge {
        /// Artifact files (JSON or Cobertura XML)
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,

        /// Override the number of shards
        #[arg(short, long)]
        shards: Option<usize>,

        /// Minimum overall coverage percentage
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Fail when a shard's artifact is missing
        #[arg(long)]
        fail_strict: bool,

        /// Artifact format (auto, json, cobertura)
        #[arg(short, long, default_value = "auto")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose. Logs go to stderr so stdout stays parseable.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            shards,
            threshold,
            fail_strict,
            fail_fast,
        } => {
            let overrides = Overrides {
                shards,
                threshold,
                fail_strict,
                fail_fast,
            };
            run(&cli.config, overrides, cli.verbose).await
        }
        Commands::Partition {
            shards,
            shard,
            format,
        } => partition(&cli.config, shards, shard, &format).await,
        Commands::Merge {
            artifacts,
            shards,
            threshold,
            fail_strict,
            format,
        } => {
            let overrides = Overrides {
                shards,
                threshold,
                fail_strict,
                fail_fast: false,
            };
            merge(&cli.config, &artifacts, overrides, &format, cli.verbose).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Command-line settings that take precedence over the config file.
struct Overrides {
    shards: Option<usize>,
    threshold: Option<f64>,
    fail_strict: bool,
    fail_fast: bool,
}

impl Overrides {
    fn apply(&self, shardcov: &mut ShardcovConfig, gate: &mut GateConfig) {
        if let Some(shards) = self.shards {
            shardcov.shard_count = shards;
        }
        if let Some(threshold) = self.threshold {
            gate.threshold = Some(threshold);
        }
        gate.fail_strict |= self.fail_strict;
        shardcov.fail_fast |= self.fail_fast;
    }
}

fn load_with(config_path: &Path, overrides: &Overrides) -> Result<Config> {
    let mut config = config::load_config(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    overrides.apply(&mut config.shardcov, &mut config.gate);
    config.validate()?;
    Ok(config)
}

async fn discover(discovery: &DiscoveryConfig) -> Result<Vec<TestItem>> {
    let tests = match discovery {
        DiscoveryConfig::List(cfg) => ListDiscoverer::new(cfg.clone()).discover().await,
        DiscoveryConfig::Command(cfg) => CommandDiscoverer::new(cfg.clone()).discover().await,
    }
    .context("Test discovery failed")?;

    if tests.is_empty() {
        warn!("No tests discovered");
    }
    Ok(tests)
}

fn create_reporter(report: &ReportConfig, verbose: bool) -> MultiReporter {
    MultiReporter::new()
        .with_reporter(ConsoleReporter::new(verbose))
        .with_reporter(FileReporter::new(report.clone()))
}

async fn run(config_path: &Path, overrides: Overrides, verbose: bool) -> Result<()> {
    let config = load_with(config_path, &overrides)?;
    let tests = discover(&config.discovery).await?;
    info!("Discovered {} tests", tests.len());

    // Absolute, so the command finds it regardless of its working directory.
    let artifact_dir = std::env::current_dir()?
        .join(&config.report.output_dir)
        .join("artifacts");
    let ExecutorConfig::Process(process) = config.executor.clone();
    let executor =
        ProcessExecutor::new(process, artifact_dir).with_stream_output(config.shardcov.stream_output);

    let reporter = create_reporter(&config.report, verbose);
    let orchestrator = Orchestrator::new(config, executor, reporter);
    let result = orchestrator.run(&tests).await?;

    std::process::exit(result.exit_code());
}

async fn partition(
    config_path: &Path,
    shards: Option<usize>,
    shard: Option<usize>,
    format: &str,
) -> Result<()> {
    let overrides = Overrides {
        shards,
        threshold: None,
        fail_strict: false,
        fail_fast: false,
    };
    let config = load_with(config_path, &overrides)?;
    let tests = discover(&config.discovery).await?;
    let assignment =
        Partitioner::new(config.shardcov.shard_count, config.shardcov.strategy)?.partition(&tests);

    match shard {
        Some(index) => {
            let Some(ids) = assignment.shard(index) else {
                bail!(
                    "Shard {} does not exist (shards are 1..={})",
                    index,
                    assignment.shard_count()
                );
            };
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(ids)?);
            } else {
                for id in ids {
                    println!("{}", id);
                }
            }
        }
        None if format == "json" => {
            println!("{}", serde_json::to_string_pretty(&assignment)?);
        }
        None => {
            for (index, ids) in assignment.iter() {
                println!("Shard {} ({} tests):", index, ids.len());
                for id in ids {
                    println!("  {}", id);
                }
            }
        }
    }

    Ok(())
}

/// Shard index encoded in a `shard-<k>.<ext>` file name.
fn shard_from_file_name(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("shard-")?
        .parse()
        .ok()
}

async fn merge(
    config_path: &Path,
    paths: &[PathBuf],
    overrides: Overrides,
    format: &str,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_merge_config(config_path)?;
    overrides.apply(&mut config.shardcov, &mut config.gate);
    config.validate()?;
    let format = match format {
        "auto" => ArtifactFormat::Auto,
        "json" => ArtifactFormat::Json,
        "cobertura" => ArtifactFormat::Cobertura,
        other => bail!("Unknown artifact format: {}. Use: auto, json, cobertura", other),
    };

    let mut artifacts: BTreeMap<usize, CoverageArtifact> = BTreeMap::new();
    for (position, path) in paths.iter().enumerate() {
        let shard = shard_from_file_name(path).unwrap_or(position + 1);
        let artifact = load_artifact(path, format, shard)
            .with_context(|| format!("Failed to load artifact {}", path.display()))?;
        if artifacts.insert(artifact.shard, artifact).is_some() {
            warn!("Artifact {} replaces an earlier one for the same shard", path.display());
        }
    }

    let result: PipelineResult = merge_artifacts(&config, &artifacts)?;
    create_reporter(&config.report, verbose).on_run_complete(&result).await;

    std::process::exit(result.exit_code());
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Shards: {}", config.shardcov.shard_count);
    println!("  Strategy: {:?}", config.shardcov.strategy);
    println!("  Wait timeout: {}s", config.shardcov.wait_timeout_secs);
    println!("  Fail fast: {}", config.shardcov.fail_fast);

    let discovery = match &config.discovery {
        DiscoveryConfig::List(_) => "list",
        DiscoveryConfig::Command(_) => "command",
    };
    println!("  Discovery: {}", discovery);

    let ExecutorConfig::Process(process) = &config.executor;
    println!("  Executor: process ({})", process.command);

    match config.gate.threshold {
        Some(threshold) => println!("  Threshold: {:.2}%", threshold),
        None => println!("  Threshold: none"),
    }
    println!("  Fail strict: {}", config.gate.fail_strict);
    println!("  Output: {}", config.report.output_dir.display());

    Ok(())
}

const STARTER_CONFIG: &str = r#"# shardcov configuration file

[shardcov]
shard_count = 6
strategy = "round-robin"
wait_timeout_secs = 3600
fail_fast = false

[discovery]
type = "command"
discover_command = "pytest --collect-only -q | grep '::'"

[executor]
type = "process"
command = "pytest {tests} --cov=. --cov-report=xml:{artifact}"
artifact_format = "cobertura"
timeout_secs = 3600

[gate]
# threshold = 80.0
fail_strict = true

[report]
output_dir = "coverage-results"
json = true
cobertura = true
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  shardcov run");

    Ok(())
}
