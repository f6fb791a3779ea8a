//! CLI integration tests using assert_cmd.
//!
//! Tests without database: always run (help, arg validation, ephemeral runs).
//! Tests with database: gated on TEST_DATABASE_URL environment variable.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;

#[allow(deprecated)]
fn mersenne_lab() -> Command {
    let mut cmd = Command::cargo_bin("mersenne-lab").unwrap();
    cmd.env_remove("DATABASE_URL");
    cmd
}

// --- Help and arg validation (no database needed) ---

#[test]
fn help_shows_all_subcommands() {
    mersenne_lab().arg("--help").assert().success().stdout(
        predicate::str::contains("serve")
            .and(predicate::str::contains("run"))
            .and(predicate::str::contains("migrate"))
            .and(predicate::str::contains("--database-url"))
            .and(predicate::str::contains("--engine-threads"))
            .and(predicate::str::contains("--checkpoint-interval")),
    );
}

#[test]
fn help_serve_shows_args() {
    mersenne_lab()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--port")
                .and(predicate::str::contains("--static-dir"))
                .and(predicate::str::contains("--ephemeral")),
        );
}

#[test]
fn help_run_shows_args() {
    mersenne_lab()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--block").and(predicate::str::contains("--concurrency")));
}

#[test]
fn missing_subcommand_fails() {
    mersenne_lab().assert().failure();
}

#[test]
fn run_requires_block() {
    mersenne_lab()
        .args(["run", "--ephemeral"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--block"));
}

#[test]
fn run_rejects_non_numeric_block() {
    mersenne_lab()
        .args(["run", "--block", "abc", "--ephemeral"])
        .assert()
        .failure();
}

#[test]
fn migrate_without_database_url_fails() {
    mersenne_lab()
        .arg("migrate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL"));
}

#[test]
fn run_rejects_out_of_range_block() {
    mersenne_lab()
        .args(["run", "--block", "5000", "--ephemeral"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("block"));
}

#[test]
fn run_rejects_zero_concurrency() {
    mersenne_lab()
        .args(["run", "--block", "0", "--concurrency", "0", "--ephemeral"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

// --- Database-backed ---

#[test]
fn migrate_with_database_succeeds() {
    if !common::has_test_db() {
        eprintln!("Skipping: TEST_DATABASE_URL not set");
        return;
    }
    mersenne_lab()
        .env("DATABASE_URL", common::test_db_url())
        .arg("migrate")
        .assert()
        .success();
}
