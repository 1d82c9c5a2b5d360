//! Integration tests for the `hotspot-portal` binary.
//!
//! Cover argument parsing, starter config handling and the one-shot commands
//! that run against the in-memory store, without a router or database.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// The binary with env isolation and its config pointed at `config`.
fn portal_cmd(config: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("hotspot-portal");
    cmd.env("HOME", "/tmp/hotspot-portal-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/hotspot-portal-test-nonexistent")
        .env("MIDTRANS_SERVER_KEY", "SB-Mid-server-cli-test")
        .env_remove("PORTAL_CONFIG")
        .env_remove("PORTAL_OUTPUT")
        .env_remove("PORTAL_BIND")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config);
    cmd
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn no_args_shows_usage() {
    let dir = tempfile::tempdir().unwrap();
    let output = portal_cmd(&dir.path().join("config.toml")).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    portal_cmd(&dir.path().join("config.toml"))
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("serve")
                .and(predicate::str::contains("sync-user"))
                .and(predicate::str::contains("reconcile-pending"))
                .and(predicate::str::contains("router-check")),
        );
}

#[test]
fn version_flag() {
    let dir = tempfile::tempdir().unwrap();
    portal_cmd(&dir.path().join("config.toml"))
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ── init-config ─────────────────────────────────────────────────────

#[test]
fn init_config_writes_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("portal").join("config.toml");

    portal_cmd(&path)
        .arg("init-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[server]"), "{written}");

    // second run refuses to overwrite
    portal_cmd(&path).arg("init-config").assert().code(9);
}

#[test]
fn malformed_config_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[server]\nbind = \"nowhere\"\n").unwrap();

    portal_cmd(&path)
        .arg("pending")
        .assert()
        .code(9)
        .stderr(predicate::str::contains("init-config"));
}

// ── One-shot commands on the in-memory store ────────────────────────

#[test]
fn pending_is_empty_without_database() {
    let dir = tempfile::tempdir().unwrap();
    portal_cmd(&dir.path().join("config.toml"))
        .args(["pending", "-o", "json-compact"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}

#[test]
fn run_job_prints_summary() {
    let dir = tempfile::tempdir().unwrap();
    portal_cmd(&dir.path().join("config.toml"))
        .args(["run-job", "expire-sweep", "-o", "json-compact"])
        .assert()
        .success()
        .stdout(predicate::str::diff("{\"expired\":0}\n"));
}

#[test]
fn unknown_job_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    portal_cmd(&dir.path().join("config.toml"))
        .args(["run-job", "defragment"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown job"));
}

#[test]
fn sync_user_rejects_garbage_identifier() {
    let dir = tempfile::tempdir().unwrap();
    portal_cmd(&dir.path().join("config.toml"))
        .args(["sync-user", "not-a-phone"])
        .assert()
        .code(2);
}
