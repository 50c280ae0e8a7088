//! Local process executor.
//!
//! Runs each shard as `{shell} -c "{command}"` on the local machine, where
//! `command` is the configured template with the shard's placeholders filled
//! in. The exit code decides whether the shard's tests passed; the coverage
//! comes from the artifact file the command writes.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | Separate process per shard |
//! | Timeout | Per shard, child is killed |
//! | Cancellation | Dropping the run kills the child |
//! | Streaming output | Optional, prefixed with the shard index |
//!
//! # Example Configuration
//!
//! ```toml
//! [executor]
//! type = "process"
//! command = "pytest -v {tests} --cov=pkg --cov-report=xml:{artifact}"
//! artifact_format = "cobertura"
//! working_dir = "."
//!
//! [executor.env]
//! PYTHONPATH = "src"
//! ```
//!
//! The shard is also exposed to the command through `SHARDCOV_SHARD`,
//! `SHARDCOV_SHARD_COUNT` and `SHARDCOV_ARTIFACT`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info};

use super::{ExecutorError, ExecutorResult, ShardExecutor, ShardRun, ShardSpec};
use crate::config::{ArtifactFormat, ProcessExecutorConfig};
use crate::coverage::{ArtifactStatus, load_artifact};

/// Executor that runs every shard as a local child process.
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    artifact_dir: PathBuf,
    stream_output: bool,
}

impl ProcessExecutor {
    /// Creates a process executor writing artifacts under `artifact_dir`.
    pub fn new(config: ProcessExecutorConfig, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            artifact_dir: artifact_dir.into(),
            stream_output: false,
        }
    }

    /// Echo each output line as `[shard k] line` instead of logging it.
    pub fn with_stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }

    /// Path the artifact of shard `index` is expected at.
    pub fn artifact_path(&self, index: usize) -> PathBuf {
        let ext = match self.config.artifact_format {
            ArtifactFormat::Cobertura => "xml",
            ArtifactFormat::Json | ArtifactFormat::Auto => "json",
        };
        self.artifact_dir.join(format!("shard-{}.{}", index, ext))
    }

    /// Fills the command template for one shard.
    ///
    /// ```
    /// use shardcov::config::ProcessExecutorConfig;
    /// use shardcov::executor::ShardSpec;
    /// use shardcov::executor::process::ProcessExecutor;
    ///
    /// let config: ProcessExecutorConfig = toml::from_str(
    ///     r#"command = "pytest {tests} --cov-report=xml:{artifact} # {shard}/{shard_count}""#,
    /// ).unwrap();
    /// let executor = ProcessExecutor::new(config, "out");
    /// let shard = ShardSpec {
    ///     index: 2,
    ///     shard_count: 6,
    ///     tests: vec!["t.py::a b".to_string(), "t.py::c".to_string()],
    /// };
    /// let cmd = executor.render_command(&shard, std::path::Path::new("out/shard-2.json"));
    /// assert_eq!(cmd, "pytest 't.py::a b' t.py::c --cov-report=xml:out/shard-2.json # 2/6");
    /// ```
    pub fn render_command(&self, shard: &ShardSpec, artifact: &Path) -> String {
        let artifact = artifact.to_string_lossy();
        self.config
            .command
            .replace("{shard_count}", &shard.shard_count.to_string())
            .replace("{shard}", &shard.index.to_string())
            .replace("{tests}", &shell_words::join(&shard.tests))
            .replace("{artifact}", &shell_words::quote(&artifact))
    }
}

#[async_trait]
impl ShardExecutor for ProcessExecutor {
    async fn run_shard(&self, shard: &ShardSpec) -> ExecutorResult<ShardRun> {
        let artifact_path = self.artifact_path(shard.index);
        if let Some(parent) = artifact_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // A leftover artifact from an earlier run must not be mistaken for this one.
        if let Err(e) = tokio::fs::remove_file(&artifact_path).await
            && e.kind() != ErrorKind::NotFound
        {
            return Err(e.into());
        }

        let command = self.render_command(shard, &artifact_path);
        debug!("Shard {}: {}", shard.index, command);

        let mut process = tokio::process::Command::new(&self.config.shell);
        process
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            process.env(key, value);
        }
        process
            .env("SHARDCOV_SHARD", shard.index.to_string())
            .env("SHARDCOV_SHARD_COUNT", shard.shard_count.to_string())
            .env("SHARDCOV_ARTIFACT", &artifact_path);

        let mut child = process
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("{}: {}", self.config.shell, e)))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let start = std::time::Instant::now();
        let run = async {
            tokio::join!(
                pump_lines(stdout, shard.index, self.stream_output, false),
                pump_lines(stderr, shard.index, self.stream_output, true),
            );
            child.wait().await
        };

        let waited = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), run).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                child.start_kill().ok();
                return Err(ExecutorError::Timeout(self.config.timeout_secs));
            }
        };

        let passed = status.success();
        info!(
            "Shard {} finished in {:?} ({})",
            shard.index,
            start.elapsed(),
            if passed { "passed" } else { "failed" }
        );

        if !artifact_path.exists() {
            return Err(ExecutorError::ArtifactMissing(
                artifact_path.display().to_string(),
            ));
        }

        let artifact = load_artifact(&artifact_path, self.config.artifact_format, shard.index)?
            .with_status(if passed {
                ArtifactStatus::Success
            } else {
                ArtifactStatus::Failure
            });

        Ok(ShardRun { passed, artifact })
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// Drains one output pipe line by line.
async fn pump_lines<R>(reader: Option<R>, shard: usize, echo: bool, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    // Read bytes, not `lines()`: a non-UTF-8 line must not stop the drain, or
    // the child dies of SIGPIPE on its next write.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("[shard {}] output pipe closed: {}", shard, e);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        match (echo, is_stderr) {
            (true, false) => println!("[shard {}] {}", shard, line),
            (true, true) => eprintln!("[shard {}] {}", shard, line),
            (false, _) => debug!("[shard {}] {}", shard, line),
        }
    }
}
