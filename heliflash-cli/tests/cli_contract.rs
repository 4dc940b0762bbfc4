//! Integration tests for core CLI contract behavior.

use predicates::prelude::*;

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("heliflash")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("heliflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("heliflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn missing_required_json_dictionary_fails() {
    let mut cmd = cli_cmd();
    cmd.args(["/dev/null", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("json"));
}

#[test]
fn missing_transport_device_fails() {
    let mut cmd = cli_cmd();
    cmd.args(["-j", "missing.json", "list"])
        .assert()
        .failure();
}

#[test]
fn unreadable_dictionary_path_reports_user_error() {
    let mut cmd = cli_cmd();
    cmd.args(["/dev/null", "-j", "/tmp/not_exists_for_contract_test.json", "list"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn flash_with_unknown_unit_is_a_usage_error() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let json_path = dir.path().join("dict.json");
    std::fs::write(
        &json_path,
        r#"{"version":2,"packages":[{"name":"pkg","units":[]}]}"#,
    )
    .expect("write dictionary fixture");

    let mut cmd = cli_cmd();
    cmd.args(["/dev/null", "-j", json_path.to_str().unwrap(), "flash", "-u", "NOPE", "-x", "fw.hex"])
        .assert()
        .failure();
}
