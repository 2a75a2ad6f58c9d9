//! Binary-level checks for the gridtest CLI.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_record(dir: &Path, job_id: &str, json: &str) {
    std::fs::write(dir.join(format!("{job_id}.json")), json).unwrap();
}

fn sample_db(dir: &Path) {
    write_record(dir, "pkg-t1", r#"{"state": "done", "cputime_used": 0.5}"#);
    write_record(
        dir,
        "pkg-t2",
        r#"{"state": "failed", "exception": "Exception: boom"}"#,
    );
    write_record(dir, "pkg-t3", r#"{"state": "blocked"}"#);
}

#[test]
fn report_fails_on_missing_db() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("gridtest")
        .unwrap()
        .current_dir(dir.path())
        .args(["report", "no-such-dir"])
        .assert()
        .failure();
}

#[test]
fn report_writes_junit_and_text_files() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    std::fs::create_dir(&db).unwrap();
    sample_db(&db);

    Command::cargo_bin("gridtest")
        .unwrap()
        .current_dir(dir.path())
        .args(["report", "db", "--output", "out/junit.xml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Failed jobs:"));

    let xml = std::fs::read_to_string(dir.path().join("out/junit.xml")).unwrap();
    assert!(xml.contains("<testcase name=\"pkg-t1\""));
    assert!(xml.contains("Exception: boom"));
    // Triage lists land in the default output directory.
    assert!(dir.path().join("test-results/failed_1.txt").exists());
    assert!(dir.path().join("test-results/success_1.txt").exists());
}

#[test]
fn report_exit_code_honors_fail_if_failed() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    std::fs::create_dir(&db).unwrap();
    sample_db(&db);

    Command::cargo_bin("gridtest")
        .unwrap()
        .current_dir(dir.path())
        .args(["report", "db", "--output", "out/junit.xml", "--fail-if-failed"])
        .assert()
        .code(2);
}

#[test]
fn shard_prints_only_accepted_names() {
    let dir = tempfile::tempdir().unwrap();
    // One worker accepts everything.
    Command::cargo_bin("gridtest")
        .unwrap()
        .current_dir(dir.path())
        .args(["shard", "--index", "0", "--count", "1", "check_a", "check_b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("check_a").and(predicate::str::contains("check_b")));
}

#[test]
fn compare_flags_duplicate_testcases() {
    let dir = tempfile::tempdir().unwrap();
    let xml = r#"<?xml version="1.0"?>
<testsuites><testsuite name="s"><testcase name="pkg-t1"/></testsuite></testsuites>"#;
    std::fs::write(dir.path().join("a.xml"), xml).unwrap();
    std::fs::write(dir.path().join("b.xml"), xml).unwrap();

    Command::cargo_bin("gridtest")
        .unwrap()
        .current_dir(dir.path())
        .args(["compare", "a.xml", "b.xml"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("found 1 duplicates"));

    Command::cargo_bin("gridtest")
        .unwrap()
        .current_dir(dir.path())
        .args(["compare", "a.xml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("found 0 duplicates"));
}
