//! Integration tests for the adapter-tune CLI.


use std::fs;
use std::path::Path;

use adapter_tune_rs::checkpoint::FINAL_ADAPTER_FILE;
use adapter_tune_rs::strategy::FORCE_CPU_ENV;
use adapter_tune_rs::FinetuneConfig;
use assert_cmd::Command;
use fixtures::workspace;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper function to run the adapter-tune CLI with given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("adapter-tune").expect("Failed to find adapter-tune binary");
    cmd.args(args).env(FORCE_CPU_ENV, "1");
    cmd
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp paths are UTF-8")
}

#[test]
fn test_help_lists_subcommands() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_init_writes_loadable_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("config.yaml");

    run_cli(&["init", path_arg(&output)])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Configuration written to"));

    let config = FinetuneConfig::from_file(&output).expect("generated config should parse");
    config.validate().expect("generated config should validate");
    assert_eq!(config.training.batch_size, 64);
    assert_eq!(config.training.micro_batch_size, 4);
}

#[test]
fn test_init_accelerator_preset() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("tpu.yaml");

    run_cli(&["init", path_arg(&output), "--preset", "stablelm-3b-accelerator"])
        .assert()
        .success();

    let content = fs::read_to_string(&output).unwrap();
    assert!(content.contains("accelerator: true"));
    assert!(content.contains("32-true"));
}

#[test]
fn test_init_unknown_preset_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("config.yaml");

    run_cli(&["init", path_arg(&output), "--preset", "gpt-5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset"));
    assert!(!output.exists());
}

#[test]
fn test_validate_reports_derived_schedule() {
    let ws = workspace();
    let config_path = ws.write_config(&ws.config());

    run_cli(&["validate", path_arg(&config_path)])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Configuration is valid"))
        .stdout(predicate::str::contains("Precision: 32-true"))
        .stdout(predicate::str::contains("Iterations: 4 (2 optimizer steps, accumulation 2)"));
}

#[test]
fn test_validate_rejects_uneven_batch() {
    let ws = workspace();
    let mut config = ws.config();
    config.training.batch_size = 6;
    config.training.micro_batch_size = 4;
    let config_path = ws.write_config(&config);

    run_cli(&["validate", path_arg(&config_path)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("micro_batch_size"));
}

#[test]
fn test_validate_missing_file_fails() {
    run_cli(&["validate", "/nonexistent/config.yaml"]).assert().failure();
}

#[test]
fn test_validate_with_eval_runs_a_pass() {
    let ws = workspace();
    let config_path = ws.write_config(&ws.config());

    run_cli(&["validate", path_arg(&config_path), "--eval"])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Validation loss:"));
}

#[test]
fn test_train_writes_final_adapter() {
    let ws = workspace();
    let config_path = ws.write_config(&ws.config());
    let out_dir = ws.root().join("cli-run");

    run_cli(&["train", path_arg(&config_path), "--out-dir", path_arg(&out_dir)])
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Trained 4 iterations (2 optimizer steps)"))
        .stdout(predicate::str::contains(FINAL_ADAPTER_FILE));

    assert!(out_dir.join(FINAL_ADAPTER_FILE).is_file());
    assert!(out_dir.join("iter-000003-ckpt.safetensors").is_file());
}

#[test]
fn test_train_rejects_indivisible_devices() {
    let ws = workspace();
    let config_path = ws.write_config(&ws.config());

    run_cli(&["train", path_arg(&config_path), "--devices", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("devices"));
}
