mod common;

use common::{CommandOutput, TestContext};
use std::fs;

#[test]
fn test_help_and_version() {
    let ctx = TestContext::new();

    // Test --help
    let output: CommandOutput = ctx.run(&["--help"]);
    output
        .assert_success()
        .assert_stdout_contains("Checks for a newer release")
        .assert_stdout_contains("Usage: updraft");

    // Test version
    let output = ctx.run(&["version"]);
    output.assert_success().assert_stdout_contains("updraft v");
}

#[test]
fn test_config_set_get_unset() {
    let ctx = TestContext::new();

    ctx.run(&["config", "set", "network-timeout-secs=7"]).assert_success();
    ctx.run(&["config", "set", "endpoints=http://a/u.json,http://b/u.json"])
        .assert_success();

    ctx.run(&["config", "get", "network-timeout-secs"])
        .assert_success()
        .assert_stdout_contains("7");
    ctx.run(&["config", "get", "endpoints"])
        .assert_success()
        .assert_stdout_contains("http://a/u.json,http://b/u.json");

    let stored = fs::read_to_string(&ctx.config_path).expect("config file was not written");
    assert!(stored.contains("\"network_timeout_secs\": 7"));
    // Overrides from the environment must not leak into the stored file
    assert!(!stored.contains(ctx.workspace_root.to_str().unwrap()));

    ctx.run(&["config", "unset", "network-timeout-secs"]).assert_success();
    ctx.run(&["config", "get", "network-timeout-secs"])
        .assert_success()
        .assert_stdout_contains("30");
}

#[test]
fn test_config_rejects_unknown_key_and_bad_value() {
    let ctx = TestContext::new();

    ctx.run(&["config", "set", "colour=blue"])
        .assert_code(2)
        .assert_stderr_contains("not a valid configuration setting");
    ctx.run(&["config", "set", "chunk-size=huge"]).assert_code(2);
    ctx.run(&["config", "set", "chunk-size"])
        .assert_code(2)
        .assert_stderr_contains("key=value");
}

#[test]
fn test_config_show_formats() {
    let ctx = TestContext::new();

    ctx.run(&["config", "set", "stale-workspace-hours=48"]).assert_success();

    // Test JSON output
    let output = ctx.run(&["config", "show", "--format", "json"]);
    output.assert_success();
    let value: serde_json::Value =
        serde_json::from_str(&output.stdout).expect("Output was not valid JSON");
    assert_eq!(value["stale_workspace_hours"], 48);

    // Test YAML output
    let output = ctx.run(&["config", "show", "--format", "yaml"]);
    output.assert_success();
    let _: serde_yaml::Value =
        serde_yaml::from_str(&output.stdout).expect("Output was not valid YAML");
    output.assert_stdout_contains("chunk_size:");

    // Test plain output
    ctx.run(&["config", "show", "--format", "plain"])
        .assert_success()
        .assert_stdout_contains("stale_workspace_hours: 48");
}

#[test]
fn test_update_without_pids_is_config_error() {
    let ctx = TestContext::new();

    ctx.run(&[
        "update",
        "--endpoint",
        "http://127.0.0.1:1/update.json",
        "--local-version",
        "1.0",
    ])
    .assert_code(2)
    .assert_stderr_contains("--pids");
    assert!(ctx.workspaces().is_empty());
}

#[test]
fn test_missing_endpoints_is_config_error() {
    let ctx = TestContext::new();

    ctx.run(&["update", "--pids", "1234", "--local-version", "1.0"])
        .assert_code(2)
        .assert_stderr_contains("no metadata endpoints");
    ctx.run(&["check", "--local-version", "1.0"]).assert_code(2);
}

#[test]
fn test_invalid_local_version_is_config_error() {
    let ctx = TestContext::new();

    ctx.run(&[
        "check",
        "--endpoint",
        "http://127.0.0.1:1/update.json",
        "--local-version",
        "v1.0",
    ])
    .assert_code(2)
    .assert_stderr_contains("invalid --local-version");
}

#[test]
fn test_corrupt_config_file_is_config_error() {
    let ctx = TestContext::new();
    fs::write(&ctx.config_path, "{ \"endpoints\": [").unwrap();

    ctx.run(&["check", "--endpoint", "http://127.0.0.1:1/update.json", "--local-version", "1.0"])
        .assert_code(2)
        .assert_stderr_contains("Could not parse config file");
    ctx.run(&[
        "update",
        "--endpoint",
        "http://127.0.0.1:1/update.json",
        "--pids",
        "999999",
        "--local-version",
        "1.0",
    ])
    .assert_code(2);
    assert!(ctx.workspaces().is_empty());
}
