use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn vcon_sync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vcon-sync"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("exports");
    fs::create_dir_all(files_dir.join("2024/06/15")).unwrap();
    fs::write(
        files_dir.join("2024/06/15/call-1.vcon.json"),
        r#"{
  "vcon": "0.3.0",
  "uuid": "0190b2f2-0000-7000-8000-000000000001",
  "subject": "billing",
  "parties": [{"tel": "+15551230000"}, {"mailto": "agent@example.com"}],
  "dialog": [{"type": "text", "start": "2024-06-15T10:00:00Z", "parties": [0, 1],
              "body": "I was charged twice.", "encoding": "none"}],
  "attachments": [{"type": "tags", "body": ["customer:acme"]}]
}"#,
    )
    .unwrap();
    fs::write(
        files_dir.join("2024/06/15/call-2.json"),
        r#"{
  "vcon": "0.1.0",
  "uuid": "0190b2f2-0000-7000-8000-000000000002",
  "analysis": [{"type": "summary", "vendor": "acme", "body": "refund issued", "encoding": "text"}]
}"#,
    )
    .unwrap();
    fs::write(
        files_dir.join("call-3.json"),
        r#"{"vcon": "0.2.0", "uuid": "0190b2f2-0000-7000-8000-000000000003"}"#,
    )
    .unwrap();
    fs::write(files_dir.join("notes.txt"), "not a vCon").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/vcons.sqlite"

[dedup]
snapshot_path = "{root}/data/dedup.json"

[ingest]
batch_size = 2
concurrency = 2
retry_delay_ms = 10
"#,
        root = root.display()
    );

    let config_path = config_dir.join("vcon-sync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vcon_sync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = vcon_sync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vcon-sync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn exports_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("exports")
        .display()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vcon_sync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_vcon_sync(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_vcon_sync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sync_local_directory() {
    let (_tmp, config_path) = setup_test_env();
    let dir = exports_dir(&config_path);

    let (stdout, stderr, success) = run_vcon_sync(&config_path, &["sync", &dir]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("candidates: 3"), "stdout: {}", stdout);
    assert!(stdout.contains("succeeded: 3"), "stdout: {}", stdout);
    assert!(stdout.contains("migrated: 3"), "stdout: {}", stdout);
    assert!(stdout.contains("failed: 0"));
    assert!(stdout.trim_end().ends_with("ok"));

    let (stdout, _, success) = run_vcon_sync(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("vCons:        3"), "stdout: {}", stdout);
    assert!(stdout.contains("Tagged:       1 / 3"), "stdout: {}", stdout);
}

#[test]
fn test_rerun_skips_everything() {
    let (_tmp, config_path) = setup_test_env();
    let dir = exports_dir(&config_path);

    let (_, _, success) = run_vcon_sync(&config_path, &["sync", &dir]);
    assert!(success);

    let (stdout, stderr, success) = run_vcon_sync(&config_path, &["sync", &dir]);
    assert!(success, "rerun failed: {}", stderr);
    assert!(stdout.contains("succeeded: 0"), "stdout: {}", stdout);
    assert!(stdout.contains("skipped: 3"), "stdout: {}", stdout);
}

#[test]
fn test_rerun_without_dedup_skips_on_write() {
    let (_tmp, config_path) = setup_test_env();
    let dir = exports_dir(&config_path);

    run_vcon_sync(&config_path, &["sync", &dir]);
    let (stdout, _, success) = run_vcon_sync(&config_path, &["sync", &dir, "--no-dedup"]);
    assert!(success);
    assert!(stdout.contains("skipped: 3"), "stdout: {}", stdout);
    assert!(stdout.contains("failed: 0"));
}

#[test]
fn test_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();
    let dir = exports_dir(&config_path);

    let (stdout, stderr, success) = run_vcon_sync(&config_path, &["sync", &dir, "--dry-run"]);
    assert!(success, "dry-run failed: {}", stderr);
    assert!(stdout.contains("succeeded: 3"), "stdout: {}", stdout);

    let (stdout, _, _) = run_vcon_sync(&config_path, &["stats"]);
    assert!(stdout.contains("vCons:        0"), "stdout: {}", stdout);

    let (stdout, _, _) = run_vcon_sync(&config_path, &["sync", &dir]);
    assert!(stdout.contains("succeeded: 3"), "stdout: {}", stdout);
}

#[test]
fn test_malformed_record_does_not_abort_run() {
    let (tmp, config_path) = setup_test_env();
    fs::write(tmp.path().join("exports/broken.json"), "{ not json").unwrap();
    let dir = exports_dir(&config_path);

    let (stdout, stderr, success) = run_vcon_sync(&config_path, &["sync", &dir]);
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("succeeded: 3"), "stdout: {}", stdout);
    assert!(stdout.contains("failed: 1"));
    assert!(stdout.contains("parse errors:"));
    assert!(stdout.contains("broken:"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_vcon_sync(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_sync_without_source_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_vcon_sync(&config_path, &["sync"]);
    assert!(!success);
    assert!(stderr.contains("No source to sync"));
}
