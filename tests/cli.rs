//! Command-line behaviour of the `shardcov` binary.

#![allow(deprecated)] // Command::cargo_bin

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn shardcov() -> Command {
    Command::cargo_bin("shardcov").unwrap()
}

/// Writes a test list and a config using it; returns the config path.
fn setup(dir: &Path, shards: usize, command: &str) -> PathBuf {
    let tests = dir.join("tests.txt");
    std::fs::write(&tests, "t.py::a\nt.py::b\nt.py::c\n# skipped\nt.py::d\n").unwrap();

    let config = dir.join("shardcov.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[shardcov]
shard_count = {shards}
wait_timeout_secs = 60

[discovery]
type = "list"
path = "{tests}"

[executor]
type = "process"
command = '''{command}'''
timeout_secs = 60

[report]
output_dir = "{out}"
"#,
            tests = tests.display(),
            out = dir.join("out").display(),
        ),
    )
    .unwrap();
    config
}

fn json_artifact(shard: usize, hits: &[(&str, u32, u64)]) -> String {
    let locations: Vec<String> = hits
        .iter()
        .map(|(file, line, count)| {
            format!(
                r#"{{"file": "{}", "start_line": {}, "end_line": {}, "hits": {}}}"#,
                file, line, line, count
            )
        })
        .collect();
    format!(r#"{{"shard": {}, "locations": [{}]}}"#, shard, locations.join(", "))
}

#[test]
fn test_init_writes_config_once() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("shardcov.toml");

    shardcov()
        .arg("--config")
        .arg(&config)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    assert!(config.exists());

    shardcov()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"));

    shardcov()
        .arg("--config")
        .arg(&config)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_validate_rejects_zero_shards() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 0, "true");

    shardcov()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("shard count must be at least 1"));
}

#[test]
fn test_partition_single_shard() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 2, "true");

    shardcov()
        .arg("-c")
        .arg(&config)
        .args(["partition", "--shard", "2"])
        .assert()
        .success()
        .stdout("t.py::b\nt.py::d\n");
}

#[test]
fn test_partition_json() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 2, "true");

    let output = shardcov()
        .arg("-c")
        .arg(&config)
        .args(["partition", "--format", "json", "--shards", "3"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["shards"]["1"], serde_json::json!(["t.py::a", "t.py::d"]));
    assert_eq!(value["shards"]["3"], serde_json::json!(["t.py::c"]));
}

#[test]
fn test_partition_unknown_shard() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 2, "true");

    shardcov()
        .arg("-c")
        .arg(&config)
        .args(["partition", "--shard", "5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_merge_artifacts_from_separate_jobs() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 2, "true");

    let one = dir.path().join("shard-1.json");
    let two = dir.path().join("shard-2.json");
    std::fs::write(&one, json_artifact(1, &[("a.py", 1, 1), ("a.py", 2, 0)])).unwrap();
    std::fs::write(&two, json_artifact(2, &[("a.py", 2, 3), ("b.py", 1, 1)])).unwrap();

    shardcov()
        .arg("-c")
        .arg(&config)
        .arg("merge")
        .arg(&one)
        .arg(&two)
        .assert()
        .success()
        .stdout(predicate::str::contains("Overall: 100.00% (3/3 locations)"))
        .stdout(predicate::str::contains("Coverage gate passed."));

    let report = std::fs::read_to_string(dir.path().join("out/coverage.json")).unwrap();
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["coverage"]["files"].as_array().unwrap().len(), 2);
    assert_eq!(report["gate"]["passed"], serde_json::json!(true));
    assert!(dir.path().join("out/coverage.xml").exists());
    assert!(dir.path().join("out/summary.txt").exists());
}

#[test]
fn test_merge_cobertura_without_config_file() {
    let dir = TempDir::new().unwrap();
    let cobertura = |file: &str| {
        format!(
            r#"<?xml version="1.0"?>
<coverage><packages><package name="pkg"><classes>
<class name="{file}" filename="pkg/{file}"><lines><line number="1" hits="1"/></lines></class>
</classes></package></packages></coverage>"#
        )
    };
    std::fs::write(dir.path().join("shard-1.xml"), cobertura("a.py")).unwrap();
    std::fs::write(dir.path().join("shard-2.xml"), cobertura("b.py")).unwrap();

    shardcov()
        .current_dir(dir.path())
        .args(["merge", "--shards", "2", "--fail-strict", "shard-1.xml", "shard-2.xml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Overall: 100.00% (2/2 locations)"));

    assert!(dir.path().join("coverage-results/coverage.json").exists());
}

#[test]
fn test_merge_below_threshold_fails() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 1, "true");

    let one = dir.path().join("shard-1.json");
    std::fs::write(&one, json_artifact(1, &[("a.py", 1, 1), ("a.py", 2, 0)])).unwrap();

    shardcov()
        .arg("-c")
        .arg(&config)
        .args(["merge", "--threshold", "80"])
        .arg(&one)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("below the 80.00% threshold"));
}

#[test]
fn test_merge_missing_shard_strict() {
    let dir = TempDir::new().unwrap();
    let config = setup(dir.path(), 2, "true");

    let one = dir.path().join("shard-1.json");
    std::fs::write(&one, json_artifact(1, &[("a.py", 1, 1)])).unwrap();

    shardcov()
        .arg("-c")
        .arg(&config)
        .arg("merge")
        .arg(&one)
        .assert()
        .success();

    shardcov()
        .arg("-c")
        .arg(&config)
        .args(["merge", "--fail-strict"])
        .arg(&one)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("shard 2: missing"));
}

#[cfg(unix)]
#[test]
fn test_run_with_process_executor() {
    let dir = TempDir::new().unwrap();
    let command = r#"printf '{"shard": {shard}, "locations": [{"file": "s{shard}.py", "start_line": 1, "end_line": 1, "hits": 1}]}' > {artifact}"#;
    let config = setup(dir.path(), 2, command);

    shardcov()
        .arg("-c")
        .arg(&config)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("s1.py"))
        .stdout(predicate::str::contains("s2.py"))
        .stdout(predicate::str::contains("Overall: 100.00% (2/2 locations)"));

    assert!(dir.path().join("out/artifacts/shard-1.json").exists());
    assert!(dir.path().join("out/coverage.json").exists());
}

#[cfg(unix)]
#[test]
fn test_run_failing_shard_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let command = r#"printf '{"shard": {shard}}' > {artifact}; test {shard} -ne 2"#;
    let config = setup(dir.path(), 3, command);

    shardcov()
        .arg("-c")
        .arg(&config)
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("tests failed in shard(s) 2"));
}
