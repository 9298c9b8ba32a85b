//! Integration tests for the `mixtune validate` command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

const JOB: &str = r#"
[job]
id = "xundoc"
base_model = "models/base"
data_dir = "data_mlx"
total_steps = 600

[weights]
precision = 2.0
vision = 1.5

[[phases]]
start = 0
end = 200
label = "precision core"
multipliers = { precision = 1.5 }

[[phases]]
start = 200
end = 600
"#;

fn write_job(temp_dir: &TempDir, content: &str) -> PathBuf {
    let path = temp_dir.path().join("job.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_validate_prints_phase_weights() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_job(&temp_dir, JOB);

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    cmd.arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("xundoc"))
        .stdout(predicate::str::contains("precision core"))
        .stdout(predicate::str::contains("precision=3"))
        .stdout(predicate::str::contains("Valid"));
}

#[test]
fn test_validate_json_output() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_job(&temp_dir, JOB);

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    let assert = cmd.arg("validate").arg(&path).arg("--json").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();

    let json: serde_json::Value =
        serde_json::from_str(&stdout).expect("validate JSON output should be valid JSON");
    assert_eq!(json["valid"], true);
    assert_eq!(json["total_steps"], 600);
    assert_eq!(json["phases"].as_array().unwrap().len(), 2);
    assert_eq!(json["phases"][0]["weights"]["precision"], 3.0);
    assert_eq!(json["phases"][1]["weights"]["precision"], 2.0);
}

#[test]
fn test_validate_rejects_gap_in_phases() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_job(&temp_dir, &JOB.replace("start = 200", "start = 250"));

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    cmd.arg("validate").arg(&path).assert().failure().stderr(predicate::str::contains("Invalid job"));
}

#[test]
fn test_validate_rejects_unknown_keys() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_job(&temp_dir, &JOB.replace("total_steps", "total_stepz"));

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    cmd.arg("validate").arg(&path).assert().failure();
}

#[test]
fn test_validate_missing_file() {
    let temp_dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    cmd.arg("validate")
        .arg(temp_dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load job file"));
}

#[test]
fn test_validate_check_paths() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_job(&temp_dir, JOB);

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    cmd.arg("validate")
        .arg(&path)
        .arg("--check-paths")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not available"));

    std::fs::create_dir_all(temp_dir.path().join("models/base")).unwrap();
    std::fs::create_dir_all(temp_dir.path().join("data_mlx")).unwrap();
    std::fs::write(temp_dir.path().join("data_mlx/train.jsonl"), "{}\n").unwrap();

    let mut cmd = Command::cargo_bin("mixtune-cli").unwrap();
    cmd.arg("validate").arg(&path).arg("--check-paths").assert().success();
}
