//! CLI integration tests

use std::process::Command;

fn rsz(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "rsz-cli", "--"])
        .args(args)
        .env_remove("RSZ_CONFIG")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = rsz(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("right-sizing"), "Should show app description");
    assert!(stdout.contains("scan"), "Should show scan command");
    assert!(stdout.contains("strategies"), "Should show strategies command");
    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("--config"), "Should show config option");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = rsz(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("rsz"), "Should show binary name");
}

/// Test scan subcommand help
#[test]
fn test_scan_help() {
    let output = rsz(&["scan", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Scan help should succeed");
    for flag in [
        "--context",
        "--namespace",
        "--selector",
        "--strategy",
        "--set",
        "--history",
        "--step",
        "--timeout",
        "--resource",
        "--metrics-file",
    ] {
        assert!(stdout.contains(flag), "Should show {} option", flag);
    }
}

/// Test strategies listing in JSON
#[test]
fn test_strategies_json() {
    let output = rsz(&["strategies", "--format", "json"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Strategies should succeed");
    let rows: serde_json::Value = serde_json::from_str(&stdout).expect("Should print JSON");
    let names: Vec<&str> = rows
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    assert_eq!(names, vec!["percentile", "simple"]);
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = rsz(&["invalid-command"]);

    assert!(!output.status.success(), "Invalid command should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}

/// Test that a missing config file is a fatal error
#[test]
fn test_missing_config_file() {
    let output = rsz(&["scan", "--config", "/nonexistent/rsz.yaml"]);

    assert_eq!(output.status.code(), Some(1), "Missing config should exit 1");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "Should name the problem");
}

/// Test invalid resource type error handling
#[test]
fn test_invalid_resource() {
    let output = rsz(&["scan", "--resource", "gpu"]);

    assert!(!output.status.success(), "Unknown resource should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unknown resource type"),
        "Should show parse error"
    );
}
