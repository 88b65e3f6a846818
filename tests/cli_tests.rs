//! CLI integration tests using assert_cmd.
//!
//! Only the subcommands that never reach Redis or PostgreSQL run here:
//! help output, config checking and argument validation.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[allow(deprecated)]
fn fleetfeed() -> Command {
    let mut cmd = Command::cargo_bin("fleetfeed").unwrap();
    cmd.env_remove("FLEETFEED_CONFIG");
    cmd
}

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f
}

// --- Help and arg validation ---

#[test]
fn help_shows_all_subcommands() {
    fleetfeed().arg("--help").assert().success().stdout(
        predicate::str::contains("worker")
            .and(predicate::str::contains("post"))
            .and(predicate::str::contains("check-config")),
    );
}

#[test]
fn help_worker_shows_args() {
    fleetfeed()
        .args(["worker", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--runners")
                .and(predicate::str::contains("--metrics-port"))
                .and(predicate::str::contains("--no-tx")),
        );
}

#[test]
fn post_requires_kind_and_key() {
    fleetfeed()
        .args(["post", "--file", "payload.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--kind"));
}

#[test]
fn post_rejects_unknown_kind() {
    fleetfeed()
        .args([
            "post",
            "--kind",
            "inventory",
            "--work-key",
            "nid1",
            "--file",
            "payload.json",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown kind 'inventory'"));
}

#[test]
fn unknown_subcommand_fails() {
    fleetfeed().arg("nonexistent").assert().failure();
}

// --- check-config ---

#[test]
fn check_config_prints_defaults() {
    fleetfeed()
        .arg("check-config")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[worker]")
                .and(predicate::str::contains("runners = 4"))
                .and(predicate::str::contains("daemonStatus")),
        );
}

#[test]
fn check_config_reads_file() {
    let f = config_file("[worker]\nrunners = 8\n");
    fleetfeed()
        .arg("--config")
        .arg(f.path())
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("runners = 8"));
}

#[test]
fn check_config_rejects_zero_runners() {
    let f = config_file("[worker]\nrunners = 0\n");
    fleetfeed()
        .arg("--config")
        .arg(f.path())
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("runners"));
}

#[test]
fn check_config_rejects_missing_file() {
    fleetfeed()
        .args(["--config", "/nonexistent/fleetfeed.toml", "check-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading config"));
}
