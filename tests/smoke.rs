//! Smoke tests -- verify the binary runs and the main subcommands work
//! against a scratch database.

mod common;

use assert_cmd::Command;
use predicates::str::contains;

fn testsight(db: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("testsight").unwrap();
    cmd.arg("--db").arg(db).env("RUST_LOG", "error");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("testsight")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Historical test-quality analytics"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("testsight")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("testsight"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "ingest", "report", "dashboard", "export", "recommendations", "health", "train"] {
        Command::cargo_bin("testsight")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_ingest_then_report_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ts.db");
    let input = dir.path().join("runs.json");
    let runs: Vec<_> = (0..3).map(|i| common::suite_run(&format!("run-{i}"), 3 - i)).collect();
    std::fs::write(&input, serde_json::to_string(&runs).unwrap()).unwrap();

    testsight(&db)
        .args(["ingest", "--file"])
        .arg(&input)
        .assert()
        .success()
        .stdout(contains("Stored 3 execution records"));

    testsight(&db)
        .args(["report", "--json"])
        .assert()
        .success()
        .stdout(contains("\"windowDays\": 30"));

    testsight(&db)
        .args(["export", "--format", "csv"])
        .assert()
        .success()
        .stdout(contains("id,timestamp,suiteName"));

    testsight(&db)
        .args(["health"])
        .assert()
        .success()
        .stdout(contains("storage"));
}

#[test]
fn test_train_without_history_fails() {
    let dir = tempfile::tempdir().unwrap();
    testsight(&dir.path().join("ts.db"))
        .args(["train", "--days", "30"])
        .assert()
        .failure()
        .stderr(contains("more runs before model training"));
}

#[test]
fn test_ingest_rejects_invalid_record() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bad.json");
    let mut run = serde_json::to_value(common::suite_run("bad", 1)).unwrap();
    run["suiteName"] = serde_json::Value::from("");
    std::fs::write(&input, run.to_string()).unwrap();

    testsight(&dir.path().join("ts.db"))
        .args(["ingest", "--file"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(contains("suiteName"));
}
