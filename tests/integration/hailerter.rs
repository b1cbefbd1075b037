use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

fn hailerter() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hailerter"))
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    check()
}

/// Runs the tracker over a fixed set of input lines and returns the emitted
/// notification lines.
fn run_scenario(args: &[&str], lines: &[Value]) -> Vec<Value> {
    let mut child = hailerter()
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn hailerter");

    {
        let stdin = child.stdin.as_mut().expect("stdin piped");
        for line in lines {
            writeln!(stdin, "{line}").expect("write input line");
        }
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().expect("wait for hailerter");
    assert!(output.status.success(), "hailerter should exit cleanly");

    String::from_utf8(output.stdout)
        .expect("utf-8 output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("notification is JSON"))
        .collect()
}

fn error_message(time: i64) -> Value {
    json!({
        "time": time,
        "aspect": "cpu",
        "location": {"host": "h1"},
        "state": "high",
        "severity": "error"
    })
}

fn ok_message(time: i64) -> Value {
    json!({
        "time": time,
        "aspect": "cpu",
        "location": {"host": "h1"},
        "state": "ok",
        "severity": "expected"
    })
}

#[test]
fn first_error_is_reported() {
    let out = run_scenario(&[], &[error_message(100)]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["time"], 100);
    assert_eq!(out[0]["aspect"], "cpu");
    assert_eq!(out[0]["location"], json!({"host": "h1"}));
    assert_eq!(out[0]["info"]["status"], "degraded");
    assert_eq!(out[0]["info"]["state"], "high");
    assert_eq!(out[0]["info"]["severity"], "error");
    assert_eq!(out[0]["previous"], Value::Null);
}

#[test]
fn first_error_is_skipped_with_the_flag() {
    let out = run_scenario(&["--skip-initial-error"], &[error_message(100)]);
    assert!(out.is_empty());
}

#[test]
fn recovery_follows_a_degradation() {
    let out = run_scenario(&[], &[error_message(100), ok_message(160)]);
    assert_eq!(out.len(), 2);
    assert_eq!(out[1]["info"]["status"], "ok");
    assert_eq!(out[1]["previous"]["status"], "degraded");
}

#[test]
fn identical_errors_collapse_to_one_notification() {
    let out = run_scenario(&[], &[error_message(100), error_message(130)]);
    assert_eq!(out.len(), 1);
}

#[test]
fn flapping_is_detected_within_the_window() {
    let out = run_scenario(
        &["--flapping-window", "4", "--flapping-threshold", "0.5"],
        &[
            error_message(1),
            ok_message(2),
            error_message(3),
            ok_message(4),
        ],
    );
    let last = out.last().expect("at least the flapping line");
    assert_eq!(last["info"]["status"], "flapping");
    assert_eq!(last["info"]["window"], 4);
    assert_eq!(last["info"]["changes"], 3);
}

#[test]
fn malformed_json_closes_the_input() {
    let mut child = hailerter()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn hailerter");

    {
        let stdin = child.stdin.as_mut().unwrap();
        writeln!(stdin, "{{broken").unwrap();
        // Valid input after the poisoned line must be ignored.
        writeln!(stdin, "{}", error_message(100)).unwrap();
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty(), "no notification after poison");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("malformed input line"));
}

#[test]
fn missing_stream_is_detected_by_the_sweep() {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    let mut child = hailerter()
        .args(["--default-interval", "1", "--missing", "1"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn hailerter");

    let mut stdin = child.stdin.take().unwrap();
    let mut reader = BufReader::new(child.stdout.take().unwrap());

    writeln!(stdin, "{}", error_message(now)).unwrap();
    stdin.flush().unwrap();

    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let degraded: Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(degraded["info"]["status"], "degraded");

    // The deadline is one interval after the message; the alarm sweep fires
    // within a couple of seconds of wall clock.
    line.clear();
    reader.read_line(&mut line).unwrap();
    let missing: Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(missing["info"]["status"], "missing");
    assert_eq!(missing["info"]["last_seen"], now);
    assert_eq!(missing["previous"]["status"], "degraded");

    drop(stdin);
    let status = child.wait().unwrap();
    assert!(status.success());
}

#[test]
fn control_socket_drives_the_tracker() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("hailerter.sock");

    let mut child = hailerter()
        .arg("--socket")
        .arg(&socket)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn hailerter");

    let mut stdin = child.stdin.take().unwrap();
    let mut reader = BufReader::new(child.stdout.take().unwrap());

    assert!(
        wait_until(Duration::from_secs(10), || socket.exists()),
        "control socket should appear"
    );

    writeln!(stdin, "{}", error_message(100)).unwrap();
    stdin.flush().unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert!(line.contains("degraded"));

    // list shows the degraded flow.
    let list = client_output(&socket, &["list"]);
    assert!(list.contains("degraded"), "list output: {list}");

    // Mute, then check the triple listing.
    client_ok(&socket, &["mute", "cpu", r#"{"host":"h1"}"#, "10m"]);
    let muted = client_output(&socket, &["list-muted"]);
    assert!(muted.contains("muted until"), "list-muted output: {muted}");

    // While muted, a recovery is silent; after unmute the next degradation
    // notifies again.
    writeln!(stdin, "{}", ok_message(160)).unwrap();
    stdin.flush().unwrap();
    // The muted decision still updates the stored info; wait for it so the
    // unmute cannot overtake the input line.
    assert!(wait_until(Duration::from_secs(10), || {
        client_output(&socket, &["list"]).contains(r#""status":"ok""#)
    }));
    client_ok(&socket, &["unmute", "cpu", r#"{"host":"h1"}"#]);
    writeln!(stdin, "{}", error_message(220)).unwrap();
    stdin.flush().unwrap();

    line.clear();
    reader.read_line(&mut line).unwrap();
    let next: Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(next["time"], 220);
    assert_eq!(next["info"]["status"], "degraded");
    // The muted recovery still advanced the stored info chain.
    assert_eq!(next["previous"]["status"], "ok");

    drop(stdin);
    let status = child.wait().unwrap();
    assert!(status.success());
    assert!(!socket.exists(), "socket unlinked on exit");
}

fn client_output(socket: &Path, args: &[&str]) -> String {
    let output = hailerter()
        .arg("--socket")
        .arg(socket)
        .args(args)
        .output()
        .expect("run client");
    assert!(
        output.status.success(),
        "client {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn client_ok(socket: &Path, args: &[&str]) {
    client_output(socket, args);
}
