//! Integration tests for the `inouttraffic-cli` binary.
//!
//! These tests exercise the CLI binary via `assert_cmd`. Commands that need
//! boards are only checked for argument handling and config validation,
//! which happen before any USB access.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn cli() -> assert_cmd::Command {
    cargo_bin_cmd!("inouttraffic-cli")
}

fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn cli_help_succeeds() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("inouttraffic-cli"));
}

#[test]
fn cli_version_prints_version() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn cli_without_subcommand_fails() {
    cli().assert().failure();
}

// ── config ──

#[test]
fn cli_config_shows_defaults_for_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("not found, using defaults"))
        .stdout(predicate::str::contains("inouttraffic.bit"));
}

#[test]
fn cli_config_json_produces_valid_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "bitstream_type = 0x0002\n");
    let output = cli()
        .arg("--json")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value =
        serde_json::from_slice(&output).expect("config --json should produce valid JSON");
    assert!(json["settings"].is_object());
    assert_eq!(json["settings"]["bitstream_type"], 2);
    assert_eq!(json["config_file_exists"], true);
    assert!(json["problems"].as_array().unwrap().is_empty());
}

#[test]
fn cli_config_reports_problems() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "echo_min_len = 9\n");
    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Problems:"))
        .stdout(predicate::str::contains("echo length"));
}

#[test]
fn cli_config_init_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    cli()
        .arg("--config")
        .arg(&path)
        .args(["config", "--init"])
        .assert()
        .success();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("bitstream_type = 1"));
    assert!(text.contains("[packet]"));
}

// ── --verbose flag ──

#[test]
fn cli_verbose_flag_accepted() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .arg("-v")
        .arg("--config")
        .arg(dir.path().join("config.toml"))
        .arg("config")
        .assert()
        .success();
}

// ── Hardware commands ──

#[test]
fn cli_echo_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "bitstream_type = 0\n");
    cli()
        .arg("--config")
        .arg(&path)
        .arg("echo")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error: Config error"))
        .stderr(predicate::str::contains("bitstream_type must be non-zero"));
}

#[test]
fn cli_check_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "chips_per_device = 0\n");
    cli()
        .arg("--config")
        .arg(&path)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("chips_per_device 0 out of range"));
}

#[test]
fn cli_devices_help_succeeds() {
    cli()
        .args(["devices", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("List attached boards"));
}

#[test]
fn cli_check_help_succeeds() {
    cli()
        .args(["check", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--upload"));
}

#[test]
fn cli_echo_help_succeeds() {
    cli()
        .args(["echo", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--rounds"));
}
