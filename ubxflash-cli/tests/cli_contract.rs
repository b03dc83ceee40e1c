//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

/// A command isolated from the user's environment and config files.
fn cli_cmd(dir: &tempfile::TempDir) -> assert_cmd::Command {
    cli_cmd_with_config(dir, "")
}

fn cli_cmd_with_config(dir: &tempfile::TempDir, content: &str) -> assert_cmd::Command {
    let config = dir
        .path()
        .join("ubxflash-test.toml");
    fs::write(&config, content).expect("config should be written");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("ubxflash");
    cmd.current_dir(dir.path())
        .env_remove("UBXFLASH_PORT")
        .env_remove("UBXFLASH_BAUD")
        .env("NO_COLOR", "1")
        .arg("--config")
        .arg(&config);
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ubxflash"))
        .stdout(predicate::str::contains("--erase-only"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ubxflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn missing_image_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-p", "/dev/ttyACM0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No firmware image given"));
}

#[test]
fn unknown_flag_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["--frobnicate", "fw.bin"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn malformed_baud_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-b", "9600:fast", "fw.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid baud rate"));
}

#[test]
fn malformed_switch_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-s", "maybe", "fw.bin"])
        .assert()
        .code(1);
}

#[test]
fn missing_image_file_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-p", "/nonexistent/ttyUBX", "not_there.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Firmware image not found: not_there.bin"))
        .stderr(predicate::str::contains("Failed to open port").not());
}

#[test]
fn missing_fis_file_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-q", "-p", "/nonexistent/ttyUBX", "-E", "1", "-F", "none.fis"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("FIS not found"));
}

#[test]
fn invalid_image_exits_two_before_opening_port() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir
        .path()
        .join("junk.bin");
    fs::write(&image, [0x5Au8; 64]).expect("image should be written");

    cli_cmd(&dir)
        .args(["-p", "/nonexistent/ttyUBX"])
        .arg(&image)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to load firmware image"))
        .stderr(predicate::str::contains("Failed to open port").not());
}

#[test]
fn unopenable_port_exits_two() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-q", "-p", "/nonexistent/ttyUBX", "-E", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to open port /nonexistent/ttyUBX"));
}

#[test]
fn bus_bridge_port_exits_two() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-q", "-p", "I2C0", "-E", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not supported"));
}

#[test]
fn summary_lists_effective_settings() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(&dir)
        .args(["-p", "/nonexistent/ttyUBX", "-b", "38400:9600", "-R", "0", "-E", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("38400 (safeboot 9600, update 9600)"))
        .stderr(predicate::str::contains("Reset"));
}

#[test]
fn config_file_supplies_port() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd_with_config(&dir, "[connection]\nport = \"/nonexistent/ttyFromConfig\"\n")
        .args(["-q", "-E", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("/nonexistent/ttyFromConfig"));
}
