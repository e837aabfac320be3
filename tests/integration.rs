use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Port 1 refuses connections, so any sync fails fast without network.
    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[harvest]
page_size = 100
polite_min_ms = 0
polite_max_ms = 0

[http]
timeout_secs = 5
max_retries = 0

[sources.dob_permits]
base_url = "http://127.0.0.1:1"
dataset_id = "ipu4-2q9a"
kind = "dob_permits"

[sources.pluto]
base_url = "http://127.0.0.1:1"
dataset_id = "64uk-42ks"
kind = "pluto"
canonical_table = "tax_lots"
{}
"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/harvest.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, success1) = run_harvest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_harvest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_lists_tables() {
    let (_tmp, config_path) = setup_test_env("");

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("dob_permits"));
    assert!(stdout.contains("stg_dob_permits -> dob_permits"));
    assert!(stdout.contains("stg_pluto -> tax_lots"));
}

#[test]
fn test_runs_empty() {
    let (_tmp, config_path) = setup_test_env("");

    run_harvest(&config_path, &["init"]);
    let (stdout, _, success) = run_harvest(&config_path, &["runs"]);
    assert!(success);
    assert!(stdout.contains("No runs recorded."));
}

#[test]
fn test_sync_unknown_source_fails() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, stderr, success) = run_harvest(&config_path, &["sync", "acris"]);
    assert!(!success);
    assert!(stderr.contains("Unknown source"), "stderr: {}", stderr);
    assert!(stderr.contains("dob_permits"), "stderr: {}", stderr);
}

#[test]
fn test_sync_rejects_bad_since() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, stderr, success) = run_harvest(&config_path, &["sync", "dob_permits", "--since", "yesterday"]);
    assert!(!success);
    assert!(stderr.contains("--since"), "stderr: {}", stderr);
}

#[test]
fn test_unreachable_source_records_failed_run() {
    let (_tmp, config_path) = setup_test_env("");

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["sync", "dob_permits"]);
    assert!(!success, "sync against a closed port should fail");
    assert!(stderr.contains("schema unavailable"), "stderr: {}", stderr);

    let (stdout, _, success) = run_harvest(&config_path, &["runs", "--source", "dob_permits"]);
    assert!(success);
    assert!(stdout.contains("failed"), "runs: {}", stdout);
    assert!(stdout.contains("error:"), "runs: {}", stdout);
}

#[test]
fn test_sync_all_reports_each_failure() {
    let (_tmp, config_path) = setup_test_env("");

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["sync", "all"]);
    assert!(!success);
    assert!(stderr.contains("sync dob_permits failed"), "stderr: {}", stderr);
    assert!(stderr.contains("sync pluto failed"), "stderr: {}", stderr);
    assert!(stderr.contains("2 source(s) failed"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config_path) = setup_test_env("staging_table = \"tax_lots\"\n");

    let (_, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("must differ"), "stderr: {}", stderr);
}
