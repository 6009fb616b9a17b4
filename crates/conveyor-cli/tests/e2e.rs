//! End-to-end tests for the conveyor CLI.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn conveyor() -> Command {
    Command::cargo_bin("conveyor").expect("conveyor binary")
}

#[test]
fn missing_arguments_exit_with_startup_error() {
    conveyor()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn missing_config_file_exits_with_startup_error() {
    conveyor()
        .args(["node-a", "127.0.0.1", "8080"])
        .args(["--config", "/nonexistent/pipeline.txt"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn init_config_writes_a_loadable_sample() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("pipeline.txt");

    conveyor()
        .args(["node-a", "127.0.0.1", "8080"])
        .arg("--config")
        .arg(&config_path)
        .arg("--init-config")
        .assert()
        .success();

    let written = std::fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("validation|"));
    assert!(written.contains("RETRY_WITH_BACKOFF"));
}

#[test]
fn invalid_config_contents_exit_with_startup_error() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("pipeline.txt");
    std::fs::write(&config_path, "badline|only-two-fields\n").unwrap();

    conveyor()
        .args(["node-a", "127.0.0.1", "8080"])
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .code(1);
}
