//! Binary-level tests for `doomlinux`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn doomlinux() -> Command {
    let mut cmd = Command::cargo_bin("doomlinux").expect("doomlinux binary");
    cmd.env_remove("DOOMLINUX_TEST_MODE")
        .env_remove("DOOMLINUX_ROOT")
        .env_remove("RUST_LOG");
    cmd
}

fn create_temp_root() -> TempDir {
    let td = tempfile::tempdir().expect("tempdir");
    let script = td.path().join("scripts").join("install-trenchbroom.sh");
    fs::create_dir_all(script.parent().unwrap()).unwrap();
    fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
    td
}

#[test]
fn smoke_build_via_env_then_convert_and_lint() {
    let temp = create_temp_root();

    doomlinux()
        .current_dir(temp.path())
        .env("DOOMLINUX_TEST_MODE", "smoke")
        .arg("build")
        .assert()
        .success()
        .stdout(predicate::str::contains("[doomlinux:smoke]"))
        .stdout(predicate::str::contains("DoomLinux.iso"));

    assert!(temp.path().join("DoomLinux.iso").is_file());
    assert!(temp.path().join("tests/artifacts/smoke-summary.txt").is_file());
    assert!(!temp.path().join(".doomlinux.lock").exists());

    doomlinux()
        .current_dir(temp.path())
        .args(["logs", "convert", "tests/artifacts/smoke-summary.txt"])
        .assert()
        .success();
    assert!(temp.path().join("tests/artifacts/smoke-summary.csv").is_file());
    assert!(temp.path().join("tests/artifacts/smoke-summary.tex").is_file());

    doomlinux()
        .current_dir(temp.path())
        .args(["logs", "lint", "tests/artifacts/smoke-summary.txt"])
        .assert()
        .success();

    doomlinux()
        .current_dir(temp.path())
        .args(["--mode", "smoke", "validate"])
        .assert()
        .success();
}

#[test]
fn root_flag_and_default_summary_path() {
    let temp = create_temp_root();
    let root = temp.path().to_str().unwrap();

    doomlinux()
        .args(["build", "--mode", "smoke", "--root", root])
        .assert()
        .success();

    doomlinux()
        .args(["logs", "lint", "--mode", "smoke", "--root", root])
        .assert()
        .success()
        .stdout(predicate::str::contains("smoke-summary.txt ok"));
}

#[test]
fn lint_without_celebration_exits_20() {
    let temp = create_temp_root();
    let log = temp.path().join("summary.txt");
    fs::write(&log, "## Stages\n✅ rootfs | t | ok\n\n## Result\n").unwrap();

    doomlinux()
        .current_dir(temp.path())
        .args(["logs", "lint", "summary.txt"])
        .assert()
        .code(20)
        .stderr(predicate::str::contains("✨"));
}

#[test]
fn verbose_json_tracing_goes_to_stderr() {
    let temp = create_temp_root();

    let output = doomlinux()
        .current_dir(temp.path())
        .args(["--log-json", "-v", "build", "--mode", "smoke"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[doomlinux:smoke]"))
        .stdout(predicate::str::contains("\"level\"").not())
        .get_output()
        .stderr
        .clone();

    let stderr = String::from_utf8(output).unwrap();
    assert!(stderr.contains("\"level\":\"INFO\""));
    assert!(stderr.contains("stage complete"));
    for line in stderr.lines().filter(|l| !l.is_empty()) {
        assert!(line.starts_with('{'), "not a JSON line: {line}");
    }
}

#[test]
fn quiet_by_default() {
    let temp = create_temp_root();

    doomlinux()
        .current_dir(temp.path())
        .args(["build", "--mode", "smoke"])
        .assert()
        .success()
        .stderr(predicate::str::contains("stage complete").not());
}

#[test]
fn missing_installer_fails_rootfs_stage() {
    let temp = tempfile::tempdir().unwrap();

    doomlinux()
        .current_dir(temp.path())
        .args(["build", "--mode", "smoke"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("rootfs stage failed"));

    assert!(!temp.path().join("DoomLinux.iso").exists());
    assert!(!temp.path().join("tests/artifacts/smoke-summary.txt").exists());
    let log = fs::read_to_string(temp.path().join("tests/artifacts/smoke-build.log")).unwrap();
    assert!(log.contains("❌ rootfs |"));
}

#[test]
fn validate_on_empty_root_exits_21() {
    let temp = create_temp_root();

    doomlinux()
        .current_dir(temp.path())
        .arg("validate")
        .assert()
        .code(21);
}

#[test]
fn bad_config_exits_2() {
    let temp = create_temp_root();
    fs::write(temp.path().join("DoomLinux.toml"), "[distro]\nbogus = 1\n").unwrap();

    doomlinux()
        .current_dir(temp.path())
        .args(["build", "--mode", "smoke"])
        .assert()
        .code(2);
}

#[test]
fn clean_removes_artifacts() {
    let temp = create_temp_root();

    doomlinux()
        .current_dir(temp.path())
        .args(["build", "--mode", "smoke"])
        .assert()
        .success();

    doomlinux()
        .current_dir(temp.path())
        .arg("clean")
        .assert()
        .success();

    for name in ["rootfs", "staging", "iso", "DoomLinux.iso"] {
        assert!(!temp.path().join(name).exists(), "{name} survived clean");
    }
}

#[test]
fn unknown_mode_is_usage_error() {
    doomlinux()
        .args(["build", "--mode", "turbo"])
        .assert()
        .code(2);
}
