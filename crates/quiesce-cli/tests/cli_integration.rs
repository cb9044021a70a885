use assert_cmd::Command;
use predicates::prelude::*;

fn quiesce(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("quiesce").unwrap();
    cmd.arg("--config").arg(config).env_remove("QUIESCE_USE_LEGACY_SYNC");
    cmd
}

fn write_config(dir: &std::path::Path, json: &str) -> std::path::PathBuf {
    let path = dir.join("config.json");
    std::fs::write(&path, json).unwrap();
    path
}

#[test]
fn test_help_exits_zero() {
    Command::cargo_bin("quiesce")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("probe"));
}

#[test]
fn test_config_prints_effective_settings() {
    let dir = std::env::temp_dir().join(format!("quiesce-cli-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = write_config(&dir, r#"{"use_legacy_sync": true, "settle_timeout_ms": 250}"#);

    let assert = quiesce(&path).arg("config").assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert_eq!(output["strategy"], "legacy");
    assert_eq!(output["config"]["settle_timeout_ms"], 250);
    assert_eq!(output["config"]["poll_interval_ms"], 50);
}

#[test]
fn test_missing_config_file_is_an_error() {
    Command::cargo_bin("quiesce")
        .unwrap()
        .args(["--config", "/nonexistent/quiesce/config.json", "config"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Config error"));
}

#[test]
fn test_probe_settles_after_release() {
    let dir = std::env::temp_dir().join(format!("quiesce-cli-probe-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = write_config(&dir, r#"{"sweep_interval_ms": 0}"#);

    let assert = quiesce(&path)
        .args(["probe", "--busy-ms", "100", "--timeout-ms", "2000"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert_eq!(output["settled"], true);
    assert_eq!(output["strategy"], "current");
    assert!(output["settle_wait_ms"].as_u64().unwrap() >= 90);
}

#[test]
fn test_probe_timeout_exits_one_with_report() {
    let dir = std::env::temp_dir().join(format!("quiesce-cli-timeout-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = write_config(&dir, r#"{"sweep_interval_ms": 0}"#);

    let assert = quiesce(&path)
        .args(["--legacy", "probe", "--kind", "animation", "--busy-ms", "400", "--timeout-ms", "50"])
        .assert()
        .code(1);
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    assert_eq!(output["settled"], false);
    assert_eq!(output["strategy"], "legacy");
    assert_eq!(output["report"]["tokens"][0]["kind"], "animation");
}
