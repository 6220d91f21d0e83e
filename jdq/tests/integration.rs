//! Integration tests for jdq CLI.

use std::process::Command;

use jobdata::{Config, FinishDetails, JobEvent, JobStatus, Store};
use tempfile::TempDir;

fn jdq_cmd(root: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jdq"));
    cmd.env("JOBDATA_DIR", root);
    cmd.env_remove("RUST_LOG");
    cmd
}

fn init_history(root: &std::path::Path) {
    let output = jdq_cmd(root)
        .args(["--expid", "t001", "init"])
        .output()
        .expect("failed to run jdq init");
    assert!(output.status.success(), "jdq init failed: {:?}", output);
}

/// Record one finished and one submitted job, then release the file.
fn seed_history(root: &std::path::Path) {
    let config = Config::with_root(root).with_settle_secs(0);
    let mut store = Store::open(config, "t001").unwrap();

    let sim = JobEvent::new("t001_SIM", 1_700_000_000, JobStatus::Submitted)
        .with_job_id(4242)
        .with_platform("MN5");
    store.write_submit_time(&sim).unwrap();
    store
        .write_start_time(
            &JobEvent::new("t001_SIM", 1_700_000_100, JobStatus::Running).with_job_id(4242),
        )
        .unwrap();
    store
        .write_finish_time(
            &JobEvent::new("t001_SIM", 1_700_000_400, JobStatus::Completed).with_job_id(4242),
            &FinishDetails::default(),
            None,
        )
        .unwrap();

    store
        .write_submit_time(&JobEvent::new("t001_POST", 1_700_000_500, JobStatus::Submitted))
        .unwrap();
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_init() {
    let tmp = TempDir::new().unwrap();
    init_history(tmp.path());

    assert!(tmp.path().join("job_data_t001.duckdb").exists());
}

#[test]
fn test_init_twice() {
    let tmp = TempDir::new().unwrap();
    init_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "init"])
        .output()
        .expect("failed to run jdq init");
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("already present"), "unexpected output: {}", text);
    assert!(text.contains("Schema version: 15"));
}

#[test]
fn test_uninitialized_fails() {
    let tmp = TempDir::new().unwrap();

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "sql", "SELECT 1"])
        .output()
        .expect("failed to run jdq sql");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not initialized"), "unexpected stderr: {}", stderr);
    assert!(!tmp.path().join("job_data_t001.duckdb").exists());
}

#[test]
fn test_sql_query() {
    let tmp = TempDir::new().unwrap();
    seed_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args([
            "--expid",
            "t001",
            "sql",
            "SELECT job_name, status FROM job_data ORDER BY id",
        ])
        .output()
        .expect("failed to run jdq sql");

    assert!(output.status.success(), "{:?}", output);
    let text = stdout(&output);
    assert!(text.contains("t001_SIM"));
    assert!(text.contains("COMPLETED"));
    assert!(text.contains("t001_POST"));
    assert!(text.contains("(2 rows)"));
}

#[test]
fn test_sql_no_results() {
    let tmp = TempDir::new().unwrap();
    init_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "sql", "SELECT * FROM job_data"])
        .output()
        .expect("failed to run jdq sql");

    assert!(output.status.success());
    assert!(stdout(&output).contains("No results."));
}

#[test]
fn test_run_shows_current_run() {
    let tmp = TempDir::new().unwrap();
    init_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "run"])
        .output()
        .expect("failed to run jdq run");

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Run:"));
    assert!(text.contains("in progress"));
    assert!(text.contains("Chunks:     0 NA"));
}

#[test]
fn test_history_json() {
    let tmp = TempDir::new().unwrap();
    seed_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "history", "t001_SIM", "--format", "json"])
        .output()
        .expect("failed to run jdq history");

    assert!(output.status.success(), "{:?}", output);
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "t001_SIM");
    assert_eq!(entries[0]["platform"], "MN5");
    assert_eq!(entries[0]["run_time"], "0:05:00");
}

#[test]
fn test_history_json_unknown_job() {
    let tmp = TempDir::new().unwrap();
    init_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "history", "MISSING", "--format", "json"])
        .output()
        .expect("failed to run jdq history");

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}

#[test]
fn test_history_bad_format() {
    let tmp = TempDir::new().unwrap();
    init_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "history", "t001_SIM", "--format", "xml"])
        .output()
        .expect("failed to run jdq history");

    assert!(!output.status.success());
}

#[test]
fn test_last_row() {
    let tmp = TempDir::new().unwrap();
    seed_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "last", "t001_SIM"])
        .output()
        .expect("failed to run jdq last");

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Status:    COMPLETED"));
    assert!(text.contains("Job ID:    4242"));
}

#[test]
fn test_run_jobs_filters_unfinished() {
    let tmp = TempDir::new().unwrap();
    seed_history(tmp.path());

    let finished = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "run-jobs"])
        .output()
        .expect("failed to run jdq run-jobs");
    assert!(finished.status.success());
    let text = stdout(&finished);
    assert!(text.contains("COMPLETED"));
    assert!(!text.contains("SUBMITTED"));

    let all = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "run-jobs", "--all"])
        .output()
        .expect("failed to run jdq run-jobs");
    assert!(all.status.success());
    assert!(stdout(&all).contains("SUBMITTED"));
}

#[test]
fn test_reconcile_without_wrappers() {
    let tmp = TempDir::new().unwrap();
    seed_history(tmp.path());

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t001", "reconcile"])
        .output()
        .expect("failed to run jdq reconcile");

    assert!(output.status.success(), "{:?}", output);
    let text = stdout(&output);
    assert!(text.contains("Wrappers:      0"));
}

#[test]
fn test_reconcile_uninitialized_fails() {
    let tmp = TempDir::new().unwrap();

    let output = jdq_cmd(tmp.path())
        .args(["--expid", "t002", "reconcile"])
        .output()
        .expect("failed to run jdq reconcile");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not initialized"), "unexpected stderr: {}", stderr);
    assert!(!tmp.path().join("job_data_t002.duckdb").exists());
}
