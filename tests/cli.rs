#![cfg(unix)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(dir: &Path, command: &str, quantity: usize) -> PathBuf {
    let path = dir.join("volley.toml");
    let config = format!(
        r#"
[volley]
quantity = {quantity}
parallelism = 2
timeout_in_minutes = 1
jitter_min_ms = 0
jitter_max_ms = 0

[operation]
type = "command"
name = "suite#case"
command = '{command}'
shell = "/bin/sh"

[report]
console = false
"#
    );
    std::fs::write(&path, config).unwrap();
    path
}

fn volley(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("volley").unwrap();
    cmd.current_dir(dir.path());
    cmd
}

#[test]
fn validate_prints_settings() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true", 3);

    volley(&dir)
        .arg("validate")
        .arg("-c")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Quantity: 3"))
        .stdout(predicate::str::contains("Reporters: none"));
}

#[test]
fn validate_rejects_zero_quantity() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true", 0);

    volley(&dir)
        .args(["validate", "-c"])
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("quantity"));
}

#[test]
fn run_all_passing_exits_zero_and_prints_each_run() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "echo output-of-run-$VOLLEY_RUN_INDEX", 3);

    volley(&dir)
        .arg("run")
        .arg("-c")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("output-of-run-0"))
        .stdout(predicate::str::contains("output-of-run-1"))
        .stdout(predicate::str::contains("output-of-run-2"));
}

#[test]
fn run_with_failures_exits_one() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "exit 3", 2);

    volley(&dir).arg("run").arg("-c").arg(&config).assert().code(1);
}

#[test]
fn run_with_huge_timeout_override_exits_zero() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true", 2);

    volley(&dir)
        .args(["run", "--timeout-mins", "200000000000000000", "-c"])
        .arg(&config)
        .assert()
        .success();
}

#[test]
fn run_quantity_override_and_junit_report() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true", 1);
    let junit = dir.path().join("reports/junit.xml");

    volley(&dir)
        .args(["run", "-n", "4", "-c"])
        .arg(&config)
        .arg("--junit")
        .arg(&junit)
        .assert()
        .success();

    let xml = std::fs::read_to_string(&junit).unwrap();
    assert!(xml.contains(r#"tests="4""#));
    assert!(xml.contains("case [run 3]"));
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();

    volley(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created volley.toml"));
    assert!(dir.path().join("volley.toml").exists());

    volley(&dir)
        .arg("validate")
        .assert()
        .success();

    volley(&dir)
        .arg("init")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}
