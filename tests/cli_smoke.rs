mod common;

use std::path::Path;
use std::process::{Command, Output};

use common::write_cohort;
use tempfile::tempdir;

fn snsb(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_snsb"))
        .args(args)
        .arg("--root")
        .arg(root)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn stdout_json(out: &Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).unwrap()
}

#[test]
fn split_is_reproducible_and_balanced() {
    let dir = tempdir().unwrap();
    write_cohort(dir.path(), 5);

    let first = snsb(dir.path(), &["split", "--source-ratio", "0.2"]);
    assert!(first.status.success());
    let v = stdout_json(&first);
    assert_eq!(v["source_ids"].as_array().unwrap().len(), 2);
    assert_eq!(v["source_per_group"], 1);
    assert_eq!(v["source_normal"], 1);
    assert_eq!(v["source_impaired"], 1);
    assert_eq!(v["test_count"], 10);

    let second = snsb(dir.path(), &["split", "--source-ratio", "0.2"]);
    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn split_rejects_ratio_above_one() {
    let dir = tempdir().unwrap();
    write_cohort(dir.path(), 2);

    let out = snsb(dir.path(), &["split", "--source-ratio", "1.5"]);
    assert!(!out.status.success());
}

#[test]
fn validate_reports_missing_documents() {
    let dir = tempdir().unwrap();
    write_cohort(dir.path(), 3);

    let ok = snsb(dir.path(), &["validate"]);
    assert!(ok.status.success());
    let v = stdout_json(&ok);
    assert_eq!(v["subjects"], 6);
    assert!(v["missing_reports"].as_array().unwrap().is_empty());

    std::fs::remove_file(dir.path().join("data/processed/SNSB/reports/eng/I001.md")).unwrap();
    std::fs::write(dir.path().join("data/processed/SNSB/scores/X999.md"), "orphan").unwrap();

    let bad = snsb(dir.path(), &["validate"]);
    assert!(!bad.status.success());
    let v = stdout_json(&bad);
    assert_eq!(v["missing_reports"], serde_json::json!(["I001"]));
    assert_eq!(v["orphan_documents"], serde_json::json!(["score:X999"]));
}

#[test]
fn run_rejects_odd_shot_count() {
    let dir = tempdir().unwrap();
    write_cohort(dir.path(), 2);

    let out = snsb(
        dir.path(),
        &["run", "--strategy", "fewshot", "--num-examples", "3"],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("InvalidShotCount"));
    assert!(!dir.path().join("data/payloads").exists());
}
