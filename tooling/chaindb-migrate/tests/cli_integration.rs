use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
    time::{SystemTime, UNIX_EPOCH},
};

use chaindb_migrate::{backend::RocksDBBackend, testing::SyntheticChain};

fn unique_test_path(suffix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("chaindb-migrate-cli-{suffix}-{nanos}"))
}

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_chaindb-migrate"))
        .args(args)
        .output()
        .expect("failed to execute chaindb-migrate binary")
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8(output.stdout.clone())
        .expect("stdout should be utf-8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line should be valid JSON"))
        .collect()
}

fn seed_source(path: &Path, len: u64) {
    let store = RocksDBBackend::open(path).expect("source store should open");
    SyntheticChain::new(len)
        .write_to(&store)
        .expect("seeding the source store should succeed");
}

fn run_and_expect_clap_validation_error(args: &[&str], expected_flag: &str) {
    let output = run(args);

    assert!(
        !output.status.success(),
        "command should fail clap validation"
    );

    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf-8");
    assert!(stderr.contains(expected_flag));
    assert!(stderr.contains("range") || stderr.contains("..="));
}

#[test]
fn help_command_succeeds_and_lists_core_flags() {
    let output = run(&["migrate", "--help"]);

    assert!(output.status.success(), "--help should succeed");

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    for flag in [
        "--source",
        "--dest",
        "--tip-hash",
        "--workers",
        "--batch-records",
        "--batch-interval-ms",
        "--resume",
        "--json",
        "--report-file",
    ] {
        assert!(stdout.contains(flag), "help should list {flag}");
    }
}

#[test]
fn clap_validation_failure_reports_workers_error() {
    run_and_expect_clap_validation_error(
        &["migrate", "--source", "s", "--dest", "d", "--workers", "0"],
        "workers",
    );
}

#[test]
fn emits_json_failure_payload_for_runtime_error() {
    let source = unique_test_path("missing-source");
    let dest = unique_test_path("missing-dest");

    let output = run(&[
        "migrate",
        "--source",
        source.to_string_lossy().as_ref(),
        "--dest",
        dest.to_string_lossy().as_ref(),
        "--json",
    ]);

    assert!(
        !output.status.success(),
        "command should fail for a non-existent source store"
    );

    let payload = json_lines(&output)
        .pop()
        .expect("stdout should carry the error report");
    assert_eq!(payload["schema_version"], 1);
    assert_eq!(payload["status"], "failed");
    assert_eq!(payload["phase"], "migration");
    assert_eq!(payload["error_type"], "store_io_error");
    assert!(payload.get("error").is_some());
    assert!(payload.get("elapsed_ms").is_some());

    let _ = fs::remove_dir_all(&source);
    let _ = fs::remove_dir_all(&dest);
    if let Some(parent) = dest.parent() {
        let _ = fs::remove_dir_all(parent.join("vm"));
    }
}

#[test]
fn migrates_then_verifies_a_rocksdb_store() {
    let root = unique_test_path("roundtrip");
    let source = root.join("source");
    let dest = root.join("node/ethdb");
    let report_file = root.join("reports/migration.jsonl");
    seed_source(&source, 150);

    let output = run(&[
        "migrate",
        "--source",
        source.to_string_lossy().as_ref(),
        "--dest",
        dest.to_string_lossy().as_ref(),
        "--workers",
        "3",
        "--batch-records",
        "100",
        "--verify",
        "exhaustive",
        "--json",
        "--report-file",
        report_file.to_string_lossy().as_ref(),
    ]);
    assert!(
        output.status.success(),
        "migration should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload = json_lines(&output)
        .pop()
        .expect("stdout should carry the migration report");
    assert_eq!(payload["status"], "completed");
    assert_eq!(payload["phase"], "migration");
    assert_eq!(payload["tip"]["height"], 149);
    assert_eq!(payload["tip_source"], "last_block_marker");
    assert_eq!(payload["blocks"], 150);
    assert_eq!(payload["verification"]["violation_count"], 0);
    assert!(
        fs::read_to_string(&report_file)
            .expect("report file should be written")
            .contains("\"completed\"")
    );
    assert!(root.join("node/vm").exists(), "metadata defaults to a sibling vm store");

    let output = run(&[
        "verify",
        "--store",
        dest.to_string_lossy().as_ref(),
        "--metadata",
        root.join("node/vm").to_string_lossy().as_ref(),
        "--exhaustive",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "verification should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload = json_lines(&output)
        .pop()
        .expect("stdout should carry the verification report");
    assert_eq!(payload["status"], "verified");
    assert_eq!(payload["checked_heights"], 150);
    assert_eq!(payload["violation_count"], 0);

    let output = run(&["inspect", "--store", dest.to_string_lossy().as_ref(), "--json"]);
    assert!(output.status.success(), "inspection should succeed");
    let payload = json_lines(&output)
        .pop()
        .expect("stdout should carry the inspection report");
    assert_eq!(payload["by_class"]["total_difficulty"], 150);
    assert_eq!(payload["highest_canonical_height"], 149);

    let _ = fs::remove_dir_all(&root);
}
