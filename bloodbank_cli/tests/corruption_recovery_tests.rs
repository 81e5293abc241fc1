//! Corruption recovery tests for the bbank binary.
//!
//! These tests verify the system can handle:
//! - Corrupted WAL lines
//! - A torn final WAL write
//! - A corrupted registry file, and recovering from it
//! - A malformed config file

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::Write as IoWrite;
use std::path::Path;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("bbank"))
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn bbank(data_dir: &Path) -> Command {
    let mut cmd = cli();
    cmd.arg("--data-dir").arg(data_dir);
    cmd
}

fn seed(data_dir: &Path) {
    bbank(data_dir)
        .args(["donor", "add", "--name", "Ada", "--age", "34", "--group", "O-"])
        .assert()
        .success();
    bbank(data_dir)
        .args(["recipient", "add", "--name", "Ben", "--age", "61", "--group", "O-", "--quantity", "1"])
        .assert()
        .success();
}

fn available(data_dir: &Path, group: &str) -> u64 {
    let output = bbank(data_dir)
        .args(["inventory", "--json", "--group", group])
        .output()
        .unwrap();
    assert!(output.status.success());
    let row: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    row["availableUnits"].as_u64().unwrap()
}

#[test]
fn test_garbage_wal_lines_ignored() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    seed(data_dir);

    fs::create_dir_all(data_dir.join("wal")).unwrap();
    fs::write(
        data_dir.join("wal/ledger.wal"),
        "{ invalid json }\n{\"event\":\"refund\",\"id\":1}\n",
    )
    .unwrap();

    assert_eq!(available(data_dir, "O-"), 0);

    bbank(data_dir)
        .args(["donate", "--donor", "1", "--group", "O-", "--units", "3"])
        .assert()
        .success();
    assert_eq!(available(data_dir, "O-"), 3);
}

#[test]
fn test_torn_final_write_recovered() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    seed(data_dir);

    bbank(data_dir)
        .args(["donate", "--donor", "1", "--group", "O-", "--units", "4"])
        .assert()
        .success();

    // Simulate a crash halfway through the next append
    {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(data_dir.join("wal/ledger.wal"))
            .unwrap();
        write!(file, r#"{{"event":"issue","id":1,"recipient_id":"#).unwrap();
    }

    assert_eq!(available(data_dir, "O-"), 4);

    // The next append starts on a fresh line, so both events survive
    bbank(data_dir)
        .args(["issue", "--recipient", "1", "--group", "O-", "--units", "1"])
        .assert()
        .success();
    assert_eq!(available(data_dir, "O-"), 3);

    bbank(data_dir).arg("verify").assert().success();
}

#[test]
fn test_corrupted_registry_is_not_overwritten() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();
    seed(data_dir);
    bbank(data_dir)
        .args(["donate", "--donor", "1", "--group", "O-", "--units", "2"])
        .assert()
        .success();
    bbank(data_dir)
        .args(["issue", "--recipient", "1", "--group", "O-", "--units", "1"])
        .assert()
        .success();

    let registry_path = data_dir.join("registry.json");
    fs::write(&registry_path, "{ not a registry ]]]").unwrap();

    // Reads fall back to an empty registry
    bbank(data_dir)
        .args(["donor", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No donors registered."));

    // Writes refuse to replace the file
    bbank(data_dir)
        .args(["donor", "add", "--name", "Eve", "--age", "29", "--group", "A+"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("is corrupt"));
    assert_eq!(
        fs::read_to_string(&registry_path).unwrap(),
        "{ not a registry ]]]"
    );

    bbank(data_dir)
        .arg("recover-registry")
        .assert()
        .success()
        .stdout(predicate::str::contains("Registry reset"));

    let moved: Vec<_> = fs::read_dir(data_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("registry.json.corrupt-"))
        .collect();
    assert_eq!(moved.len(), 1);

    // New parties never take ids the ledger already points at
    bbank(data_dir)
        .args(["donor", "add", "--name", "Eve", "--age", "29", "--group", "A+"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Donor 2 registered"));
    bbank(data_dir)
        .args(["recipient", "add", "--name", "Fay", "--age", "40", "--group", "A+", "--quantity", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recipient 2 registered"));

    // The ledger itself is untouched
    assert_eq!(available(data_dir, "O-"), 1);

    bbank(data_dir)
        .arg("recover-registry")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to recover"));
}

#[test]
fn test_missing_files_are_fine() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().join("does/not/exist/yet");

    bbank(&data_dir).arg("inventory").assert().success();
    bbank(&data_dir).arg("verify").assert().success();
    bbank(&data_dir)
        .args(["donations", "--group", "A+"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No donations recorded."));
}

#[test]
fn test_malformed_config_is_reported() {
    let temp_dir = setup_test_dir();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[stock\nlow_stock_threshold = ").unwrap();

    cli()
        .arg("--config")
        .arg(&config_path)
        .arg("inventory")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("TOML error"));
}
