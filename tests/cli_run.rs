//! CLI exit-code contract: 0 on success, 1 on fatal failures.

use assert_cmd::Command;
use predicates::prelude::*;

fn fast_config_file(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("codegraph.toml");
    std::fs::write(
        &path,
        r#"
[pipeline]
sample_interval_secs = 1
quiescence_samples = 2
max_wait_secs = 60
shutdown_timeout_secs = 10

[worker]
heartbeat_secs = 1
job_timeout_secs = 10

[outbox]
poll_interval_ms = 100
"#,
    )
    .unwrap();
    path
}

#[test]
fn run_in_test_mode_exits_zero_and_reports() {
    let target = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(target.path().join("util.js"), "function add(a,b){return a+b}").unwrap();
    let config = fast_config_file(data.path());

    Command::cargo_bin("codegraph")
        .unwrap()
        .args(["run", "--test-mode"])
        .arg("--target")
        .arg(target.path())
        .arg("--data-dir")
        .arg(data.path().join("state"))
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded"))
        .stdout(predicate::str::contains("POIs: 1"));
}

#[test]
fn missing_target_exits_one() {
    let data = tempfile::tempdir().unwrap();
    let config = fast_config_file(data.path());

    Command::cargo_bin("codegraph")
        .unwrap()
        .args(["run", "--test-mode", "--target", "/no/such/directory"])
        .arg("--data-dir")
        .arg(data.path().join("state"))
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn invalid_config_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[breaker]\npartial_recovery_threshold = 50.0\n").unwrap();

    Command::cargo_bin("codegraph")
        .unwrap()
        .args(["run", "--test-mode"])
        .arg("--config")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("partial_recovery_threshold"));
}
