//! End-to-end tests for lodestar CLI commands.
//!
//! These tests run the binary against scenario files written to a
//! temporary directory.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A scenario file in a temporary directory.
struct TestScenario {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl TestScenario {
    fn new(source: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("scenario.json");
        fs::write(&path, source).expect("Failed to write scenario");

        Self {
            _temp_dir: temp_dir,
            path,
        }
    }

    fn path(&self) -> &str {
        self.path.to_str().expect("utf-8 temp path")
    }
}

fn lodestar() -> Command {
    Command::cargo_bin("lodestar").expect("Failed to find lodestar binary")
}

/// Two cells; the second runs, then the file is re-read with a new cell.
fn run_and_reparse_scenario() -> String {
    r#"{
  "notebook": "file:///work/demo.py",
  "cells": [
    {"id": "setup", "source": "x = 41"},
    {"id": "show", "source": "print(x + 1)"}
  ],
  "steps": [
    {"step": "kernel", "operation": {"cell_id": "show", "run_id": "r1", "status": "queued", "timestamp": 10.0}},
    {"step": "kernel", "operation": {"cell_id": "show", "run_id": "r1", "status": "running", "timestamp": 10.1,
      "console": [{"channel": "stdout", "mimetype": "text/plain", "data": "42\n"}]}},
    {"step": "kernel", "operation": {"cell_id": "show", "run_id": "r1", "status": "idle", "timestamp": 10.2}},
    {"step": "wait", "ms": 30},
    {"step": "replace_all", "cells": [
      {"source": "x = 41"},
      {"source": "y = 0"},
      {"source": "print(x + 1)"}
    ]}
  ]
}"#
    .to_string()
}

fn report(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be a JSON report")
}

// =============================================================================
// lodestar replay Tests
// =============================================================================

#[test]
fn test_replay_nonexistent_script() {
    lodestar()
        .args(["replay", "/nonexistent/scenario.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read scenario"));
}

#[test]
fn test_replay_restores_identity_after_reparse() {
    let scenario = TestScenario::new(&run_and_reparse_scenario());

    let output = lodestar()
        .args(["replay", scenario.path(), "--finalize-delay-ms", "5"])
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = report(&output);
    let cells = report["cells"].as_array().unwrap();
    assert_eq!(cells.len(), 3);
    assert_eq!(cells[0]["id"], "setup");
    assert_eq!(cells[2]["id"], "show");
    assert!(cells[1]["id"].is_string(), "new cell gets a fresh identity");
    assert_ne!(cells[1]["id"], "setup");

    let outputs = cells[2]["outputs"].as_array().unwrap();
    assert_eq!(outputs[0]["items"][0]["data"], "42\n");

    assert_eq!(report["deleted_cells"], serde_json::json!([]));
    assert_eq!(report["executions"][0]["ended"], true);
    assert_eq!(report["executions"][0]["started_at_ms"], 10_100);
}

#[test]
fn test_replay_reports_stale_and_deleted_cells() {
    let scenario = TestScenario::new(
        r#"{
  "cells": [
    {"id": "a", "source": "a = 1"},
    {"id": "b", "source": "b = a"},
    {"id": "c", "source": "c = b"}
  ],
  "steps": [
    {"step": "edit", "index": 2, "source": "c = b * 2"},
    {"step": "delete", "index": 0}
  ]
}"#,
    );

    let output = lodestar()
        .args(["replay", scenario.path()])
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());

    let report = report(&output);
    assert_eq!(report["deleted_cells"], serde_json::json!(["a"]));
    assert_eq!(report["stale_cells"], serde_json::json!([1]));
    assert_eq!(report["cells"][1]["stale_marker"], true);
}

#[test]
fn test_replay_desync_fails_loudly() {
    let scenario = TestScenario::new(
        r#"{
  "cells": [{"id": "a", "source": "a = 1"}],
  "steps": [{"step": "kernel", "operation": {"cell_id": "ghost", "status": "queued"}}]
}"#,
    );

    lodestar()
        .args(["replay", scenario.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not resolve"));
}

// =============================================================================
// lodestar check Tests
// =============================================================================

#[test]
fn test_check_valid_scenario() {
    let scenario = TestScenario::new(&run_and_reparse_scenario());

    lodestar()
        .args(["check", scenario.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 cells, 5 steps OK"));
}

#[test]
fn test_check_out_of_range_step() {
    let scenario = TestScenario::new(
        r#"{"cells": [{"source": "x"}], "steps": [{"step": "move", "from": 3, "to": 0}]}"#,
    );

    lodestar()
        .args(["check", scenario.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Step 1 (move)"));
}

#[test]
fn test_check_malformed_json() {
    let scenario = TestScenario::new("{ not json");

    lodestar()
        .args(["check", scenario.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid scenario"));
}
