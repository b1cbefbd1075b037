use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn shepherd_client_fails_cleanly_without_a_server() {
    Command::cargo_bin("daemonshepherd")
        .unwrap()
        .args(["--socket", "/nonexistent/control.sock", "list"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("control socket not available"));
}

#[test]
fn shepherd_supervisor_mode_requires_the_daemons_flag() {
    Command::cargo_bin("daemonshepherd")
        .unwrap()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--daemons"));
}

#[test]
fn shepherd_exits_one_on_a_broken_spec_file() {
    let dir = tempfile::tempdir().unwrap();
    let spec = dir.path().join("daemons.yaml");
    std::fs::write(&spec, "daemons:\n  broken:\n    cwd: /tmp\n").unwrap();

    Command::cargo_bin("daemonshepherd")
        .unwrap()
        .arg("--daemons")
        .arg(&spec)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("start_command"));
}

#[test]
fn hailerter_client_requires_a_socket() {
    Command::cargo_bin("hailerter")
        .unwrap()
        .arg("list")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--socket"));
}

#[test]
fn hailerter_client_fails_cleanly_without_a_server() {
    Command::cargo_bin("hailerter")
        .unwrap()
        .args(["--socket", "/nonexistent/control.sock", "list"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("control socket not available"));
}

#[test]
fn hailerter_client_validates_the_location_argument() {
    Command::cargo_bin("hailerter")
        .unwrap()
        .args(["--socket", "/tmp/ignored.sock", "forget", "cpu", "not-json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid location"));

    Command::cargo_bin("hailerter")
        .unwrap()
        .args(["--socket", "/tmp/ignored.sock", "forget", "cpu", "[1,2]"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("JSON object"));
}

#[test]
fn hailerter_rejects_nonpositive_mute_durations() {
    Command::cargo_bin("hailerter")
        .unwrap()
        .args(["--socket", "/tmp/ignored.sock", "mute", "cpu", "{}", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("positive"));
}

#[test]
fn duration_suffixes_are_accepted_by_the_cli() {
    // A bad suffix is rejected before any socket I/O happens.
    Command::cargo_bin("hailerter")
        .unwrap()
        .args(["--socket", "/tmp/ignored.sock", "mute", "cpu", "{}", "10d"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid duration"));
}
