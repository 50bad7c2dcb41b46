//! CLI exit-code contract: 0 on success, 2 on analysis/validation
//! rejection, 1 on infrastructure failure.

use std::path::{Path, PathBuf};
use std::process::Command;

fn mlc() -> Command {
    Command::new(PathBuf::from(env!("CARGO_BIN_EXE_mlc")))
}

fn write_source(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn analyze_clean_program_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "clean.ml", "x = 1 + 2;\n");

    let output = mlc().arg("analyze").arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(0), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no findings"));
}

#[test]
fn analyze_findings_at_medium_exit_two() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "dunder.ml", "a = {}; a.__class__;\n");

    let output = mlc().arg("analyze").arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("forbidden_attribute"), "{}", stdout);
}

#[test]
fn analyze_json_format() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "taint.ml", "eval_like(network.get(u));\n");

    let output = mlc()
        .args(["analyze", "--format", "json"])
        .arg(&input)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let records = parsed.as_array().unwrap();
    assert!(records
        .iter()
        .any(|r| r["category"] == "taint_flow" && r["cwe"] == "CWE-20"));
}

#[test]
fn analyze_parse_error_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "broken.ml", "x = ;\n");

    let output = mlc().arg("analyze").arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("expected expression"), "{}", stderr);
}

#[test]
fn missing_input_is_infrastructure_failure() {
    let output = mlc().arg("analyze").arg("/no/such/file.ml").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn transpile_writes_program_map_and_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "prog.ml", "x = 1;\nprint(x);\n");
    let out_dir = dir.path().join("build");

    let output = mlc()
        .arg("transpile")
        .arg(&input)
        .arg("--output")
        .arg(&out_dir)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{:?}", output);

    assert!(out_dir.join("prog.py").exists());
    assert!(out_dir.join("prog.py.map").exists());
    assert!(out_dir.join("ml_runtime.py").exists());

    let python = std::fs::read_to_string(out_dir.join("prog.py")).unwrap();
    assert!(python.contains("_ml.bi_print(x)"));
}

#[test]
fn transpile_rejects_critical_findings() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(dir.path(), "bad.ml", "eval_like(network.get(u));\n");

    let output = mlc().arg("transpile").arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("taint_flow"), "{}", stderr);
}

#[test]
fn check_validates_against_policy() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_source(
        dir.path(),
        "caps.ml",
        r#"capability FileRead {
    resource "data/*.csv";
    allow read;
}
"#,
    );
    let policy_ok = write_source(
        dir.path(),
        "grant.toml",
        r#"name = "ok"
[[capability]]
type = "file"
resources = ["data/**"]
operations = ["read"]
"#,
    );
    let policy_narrow = write_source(
        dir.path(),
        "narrow.toml",
        r#"name = "narrow"
[[capability]]
type = "file"
resources = ["data/a.csv"]
operations = ["read"]
"#,
    );

    let output = mlc()
        .arg("check")
        .arg(&input)
        .arg("--policy")
        .arg(&policy_ok)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{:?}", output);

    let output = mlc()
        .arg("check")
        .arg(&input)
        .arg("--policy")
        .arg(&policy_narrow)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn config_abort_threshold_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    // A high (not critical) finding: dunder access.
    let input = write_source(dir.path(), "dunder.ml", "a = {}; a.__class__;\n");

    // Default threshold (critical): transpile succeeds.
    let out_dir = dir.path().join("build");
    let output = mlc()
        .arg("transpile")
        .arg(&input)
        .arg("--output")
        .arg(&out_dir)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{:?}", output);

    // Lowered threshold via ml.toml: rejected.
    std::fs::write(
        dir.path().join("ml.toml"),
        "[analysis]\nabort_threshold = \"high\"\n",
    )
    .unwrap();
    let output = mlc()
        .arg("transpile")
        .arg(&input)
        .arg("--output")
        .arg(&out_dir)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
