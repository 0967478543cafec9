//! CLI Integration Tests
//!
//! Argument handling of the node binary. Nothing here starts a node.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli_cmd() -> Command {
    Command::cargo_bin("peerchat").expect("Failed to find peerchat binary")
}

#[test]
fn test_help_lists_flags() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("peer-to-peer text chat"))
        .stdout(predicate::str::contains("--http-port"))
        .stdout(predicate::str::contains("--relay"))
        .stdout(predicate::str::contains("--no-stdin"));
}

#[test]
fn test_version() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_rejects_non_numeric_port() {
    cli_cmd()
        .args(["-p", "not-a-port"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_rejects_invalid_bind_ip() {
    cli_cmd()
        .args(["-i", "localhost", "--no-stdin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid bind ip"));
}
