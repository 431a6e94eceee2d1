//! End-to-end tests for scriptpad CLI commands.
//!
//! `check` runs entirely in process. `run` and `compile` need the
//! scriptpad-worker binary next to the CLI (build the workspace first).

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A temporary directory holding one script.
struct TestScript {
    temp_dir: TempDir,
    script_path: PathBuf,
}

impl TestScript {
    fn new(filename: &str, source: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let script_path = temp_dir.path().join(filename);
        fs::write(&script_path, source).expect("Failed to write script");

        Self {
            temp_dir,
            script_path,
        }
    }

    fn path(&self) -> &PathBuf {
        &self.script_path
    }

    fn add_file(&self, filename: &str, source: &str) -> PathBuf {
        let path = self.temp_dir.path().join(filename);
        fs::write(&path, source).expect("Failed to write file");
        path
    }
}

fn scriptpad() -> Command {
    Command::cargo_bin("scriptpad").unwrap()
}

// =============================================================================
// check
// =============================================================================

#[test]
fn test_check_nonexistent_script() {
    scriptpad()
        .args(["check", "/nonexistent/script.pad"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read script"));
}

#[test]
fn test_check_valid_script() {
    let script = TestScript::new("ok.pad", "int x = 40;\nx + 2\n");

    scriptpad()
        .arg("check")
        .arg(script.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No errors"));
}

#[test]
fn test_check_reports_syntax_error() {
    let script = TestScript::new("broken.pad", "int x = ;\n");

    scriptpad()
        .arg("check")
        .arg(script.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("PS1001"))
        .stderr(predicate::str::contains("compilation error(s)"));
}

#[test]
fn test_check_rejects_deep_nesting() {
    let source = format!("{}1{}\n", "(".repeat(100_000), ")".repeat(100_000));
    let script = TestScript::new("deep.pad", &source);

    scriptpad()
        .arg("check")
        .arg(script.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("PS1007"))
        .stderr(predicate::str::contains("nested too deeply"));
}

#[test]
fn test_check_warning_is_not_fatal() {
    let script = TestScript::new("warn.pad", "int unused = 1;\n");

    scriptpad()
        .arg("check")
        .arg(script.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("PS3001"));
}

#[test]
fn test_check_with_reference_and_import() {
    let script = TestScript::new("main.pad", "max(answer, 1)\n");
    let library = script.add_file("lib.pad", "int answer = 42;\n");

    scriptpad()
        .arg("check")
        .arg(script.path())
        .arg("--reference")
        .arg(&library)
        .args(["--import", "Math"])
        .assert()
        .success();
}

#[test]
fn test_check_unknown_import_warns() {
    let script = TestScript::new("main.pad", "1\n");

    scriptpad()
        .arg("check")
        .arg(script.path())
        .args(["--import", "Nope"])
        .assert()
        .success()
        .stderr(predicate::str::contains("PS3003"));
}

// =============================================================================
// run / compile
// =============================================================================

#[test]
#[ignore = "Requires scriptpad-worker binary"]
fn test_run_prints_value() {
    let script = TestScript::new("sum.pad", "1 + 1\n");

    scriptpad()
        .arg("run")
        .arg(script.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
}

#[test]
#[ignore = "Requires scriptpad-worker binary"]
fn test_run_prints_output_in_order() {
    let script = TestScript::new(
        "output.pad",
        "println(\"first\");\nprintln(\"second\");\n",
    );

    let output = scriptpad().arg("run").arg(script.path()).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.find("first").expect("first line");
    let second = stdout.find("second").expect("second line");
    assert!(first < second);
}

#[test]
#[ignore = "Requires scriptpad-worker binary"]
fn test_run_exception_fails() {
    let script = TestScript::new("throw.pad", "throw \"boom\";\n");

    scriptpad()
        .arg("run")
        .arg(script.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("boom"));
}

#[test]
#[ignore = "Requires scriptpad-worker binary"]
fn test_run_compile_error_fails() {
    let script = TestScript::new("broken.pad", "int x = ;\n");

    scriptpad()
        .arg("run")
        .arg(script.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("PS1001"));
}

#[test]
#[ignore = "Requires scriptpad-worker binary"]
fn test_compile_writes_artifact() {
    let script = TestScript::new("prog.pad", "Math.pow(2, 10)\n");

    scriptpad()
        .arg("compile")
        .arg(script.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Compiled"));

    assert!(script.path().with_extension("padc").exists());
}

#[test]
fn test_run_with_missing_worker() {
    let script = TestScript::new("sum.pad", "1 + 1\n");

    scriptpad()
        .arg("run")
        .arg(script.path())
        .args(["--worker", "/nonexistent/scriptpad-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unable to create worker process"));
}
