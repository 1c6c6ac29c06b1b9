//! CLI integration tests

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Run the CLI with an isolated config home
fn diag(home: &Path, args: &[&str]) -> Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "diag-cli", "--"])
        .args(args)
        .env("DIAG_HOME", home)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("Collect, package and upload cluster diagnostic data"),
        "Should show app description"
    );
    for command in ["collect", "collectdm", "collectk", "package", "unpack", "upload", "download", "history", "config"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("diag"), "Should show binary name");
}

/// Test collect subcommand help
#[test]
fn test_collect_help() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["collect", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Collect help should succeed");
    for flag in ["--from", "--to", "--include", "--exclude", "--role", "--node", "--limit", "--metricsfilter", "--pd"] {
        assert!(stdout.contains(flag), "Should show {} option", flag);
    }
}

/// Test collectk subcommand help
#[test]
fn test_collectk_help() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["collectk", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Collectk help should succeed");
    assert!(stdout.contains("--namespace"), "Should show namespace option");
    assert!(stdout.contains("--name"), "Should show name option");
}

/// Test that an unknown collector is rejected before anything runs
#[test]
fn test_collect_rejects_unknown_collector() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["collect", "prod", "--include", "everything"]);

    assert!(!output.status.success(), "Unknown collector should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown collector"), "Should name the problem");
}

/// Test config set and show
#[test]
fn test_config_roundtrip() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["config", "clinic.token", "abcd1234efgh5678"]);
    assert!(output.status.success(), "Config set should succeed");
    assert!(home.path().join("diag.toml").exists(), "Should write config file");

    let output = diag(home.path(), &["config"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "Config show should succeed");
    assert!(stdout.contains("abcd********5678"), "Token should be masked");
    assert!(!stdout.contains("abcd1234efgh5678"), "Token should not leak");

    let output = diag(home.path(), &["config", "clinic.region", "EU"]);
    assert!(!output.status.success(), "Unknown region should fail");
}

/// Test that upload needs a token
#[test]
fn test_upload_without_token_fails() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("data.diag");
    std::fs::write(&file, b"payload").unwrap();

    let output = diag(home.path(), &["upload", file.to_str().unwrap()]);
    assert!(!output.status.success(), "Upload without token should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("clinic.token"), "Should explain how to set the token");
}

/// Test download selector validation
#[test]
fn test_download_needs_one_selector() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["download"]);
    assert!(!output.status.success(), "Download without selector should fail");
}

/// Test packaging a result directory and unpacking it again
#[test]
fn test_package_and_unpack() {
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let dataset = work.path().join("diag-prod-feedbeef");
    std::fs::create_dir_all(dataset.join("10.0.0.1").join("log")).unwrap();
    std::fs::write(
        dataset.join("cluster.json"),
        r#"{"cluster_id":"7000","cluster_type":"tidb-cluster","begin_time":"2024-01-01T00:00:00Z","end_time":"2024-01-01T01:00:00Z"}"#,
    )
    .unwrap();
    std::fs::write(dataset.join("10.0.0.1").join("log").join("tikv.log"), "line\n").unwrap();

    let package = work.path().join("out.diag");
    let output = diag(
        home.path(),
        &["package", dataset.to_str().unwrap(), "-o", package.to_str().unwrap()],
    );
    assert!(output.status.success(), "Package should succeed: {}", String::from_utf8_lossy(&output.stderr));
    assert!(package.exists(), "Package file should exist");

    let unpacked = work.path().join("unpacked");
    let output = diag(
        home.path(),
        &["--format", "json", "unpack", package.to_str().unwrap(), "-o", unpacked.to_str().unwrap()],
    );
    assert!(output.status.success(), "Unpack should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"cluster_id\": \"7000\""), "Should report the header");
    assert_eq!(
        std::fs::read_to_string(unpacked.join("10.0.0.1").join("log").join("tikv.log")).unwrap(),
        "line\n"
    );
}

/// Test history with no uploads yet
#[test]
fn test_history_empty() {
    let home = TempDir::new().unwrap();
    let output = diag(home.path(), &["history"]);
    assert!(output.status.success(), "History should succeed");
}
