use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn daemonshepherd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_daemonshepherd"))
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    check()
}

fn process_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// A running supervisor that is terminated when the test ends.
struct Shepherd {
    child: Child,
    socket: PathBuf,
}

impl Shepherd {
    fn spawn(dir: &TempDir, spec_yaml: &str) -> Self {
        let spec_path = dir.path().join("daemons.yaml");
        fs::write(&spec_path, spec_yaml).unwrap();
        let socket = dir.path().join("control.sock");

        let child = daemonshepherd()
            .arg("--daemons")
            .arg(&spec_path)
            .arg("--socket")
            .arg(&socket)
            .arg("--silent")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemonshepherd");

        let shepherd = Self { child, socket };
        assert!(
            wait_until(Duration::from_secs(10), || shepherd.socket.exists()),
            "control socket should appear"
        );
        shepherd
    }

    fn client(&self, args: &[&str]) -> std::process::Output {
        daemonshepherd()
            .arg("--socket")
            .arg(&self.socket)
            .args(args)
            .output()
            .expect("run client")
    }

    fn client_stdout(&self, args: &[&str]) -> String {
        let output = self.client(args);
        assert!(
            output.status.success(),
            "client {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn terminate(mut self) -> i32 {
        let pid = self.child.id() as i32;
        let _ = Command::new("kill").arg(pid.to_string()).status();
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match self.child.try_wait().unwrap() {
                Some(status) => return status.code().unwrap_or(-1),
                None if Instant::now() > deadline => {
                    self.child.kill().unwrap();
                    self.child.wait().unwrap();
                    panic!("supervisor did not exit on SIGTERM");
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl Drop for Shepherd {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let pid = self.child.id() as i32;
            let _ = Command::new("kill").arg(pid.to_string()).status();
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.child.try_wait().ok().flatten().is_some() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[test]
fn lifecycle_start_stop_and_admin_commands() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("alpha.pid");
    let ping_path = dir.path().join("ping.txt");

    let spec = format!(
        r#"
daemons:
  alpha:
    start_command: "echo $$ > {pid} && exec sleep 60"
    commands:
      ping:
        command: "touch {ping}"
"#,
        pid = pid_path.display(),
        ping = ping_path.display()
    );

    let shepherd = Shepherd::spawn(&dir, &spec);
    assert!(
        wait_until(Duration::from_secs(10), || pid_path.exists()),
        "daemon should start and write its pid"
    );
    let pid = read_pid(&pid_path).unwrap();
    assert!(process_alive(pid));

    let list = shepherd.client_stdout(&["list"]);
    assert!(list.contains("alpha: running"), "list output: {list}");

    // Declared commands are listed and runnable.
    let commands = shepherd.client_stdout(&["list-commands", "alpha"]);
    assert_eq!(commands.trim(), "ping");
    shepherd.client_stdout(&["command", "alpha", "ping"]);
    assert!(ping_path.exists());

    // Stop kills the process and reports it stopped.
    shepherd.client_stdout(&["stop", "alpha"]);
    assert!(
        wait_until(Duration::from_secs(10), || !process_alive(pid)),
        "stopped daemon should die"
    );
    let list = shepherd.client_stdout(&["list"]);
    assert!(list.contains("alpha: stopped"), "list output: {list}");

    // Start brings up a fresh process.
    fs::remove_file(&pid_path).unwrap();
    shepherd.client_stdout(&["start", "alpha"]);
    assert!(
        wait_until(Duration::from_secs(10), || pid_path.exists()),
        "daemon should start again"
    );
    let new_pid = read_pid(&pid_path).unwrap();
    assert_ne!(new_pid, pid);
    assert!(process_alive(new_pid));

    // Unknown daemons are control-protocol errors with exit code 1.
    let output = shepherd.client(&["stop", "ghost"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ghost"), "stderr: {stderr}");

    // Orderly shutdown: children die, the socket is unlinked, exit is 0.
    let socket = shepherd.socket.clone();
    let code = shepherd.terminate();
    assert_eq!(code, 0);
    assert!(!process_alive(new_pid), "children die on shutdown");
    assert!(!socket.exists(), "socket unlinked on shutdown");
}

#[test]
fn crashing_daemon_backs_off_and_keeps_restarting() {
    let dir = tempfile::tempdir().unwrap();
    let count_path = dir.path().join("count");

    let spec = format!(
        r#"
daemons:
  crashy:
    start_command: "echo x >> {count} ; exit 1"
    restart: [0, 2]
"#,
        count = count_path.display()
    );

    let runs = |path: &Path| -> usize {
        fs::read_to_string(path)
            .map(|content| content.lines().count())
            .unwrap_or(0)
    };

    let shepherd = Shepherd::spawn(&dir, &spec);

    // First run plus the zero-delay restart come quickly.
    assert!(
        wait_until(Duration::from_secs(5), || runs(&count_path) >= 2),
        "immediate restart should have happened"
    );
    // The next runs are spaced by the two-second tail.
    assert!(
        wait_until(Duration::from_secs(8), || runs(&count_path) >= 3),
        "backoff restart should have happened"
    );

    shepherd.terminate();
}

#[test]
fn cancel_restart_leaves_the_daemon_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let count_path = dir.path().join("count");

    let spec = format!(
        r#"
daemons:
  crashy:
    start_command: "echo x >> {count} ; exit 1"
    restart: [0, 3600]
"#,
        count = count_path.display()
    );

    let runs = |path: &Path| -> usize {
        fs::read_to_string(path)
            .map(|content| content.lines().count())
            .unwrap_or(0)
    };

    let shepherd = Shepherd::spawn(&dir, &spec);

    // Two quick runs, then an hour-long wait.
    assert!(wait_until(Duration::from_secs(5), || runs(&count_path) >= 2));
    assert!(wait_until(Duration::from_secs(5), || {
        shepherd.client_stdout(&["list"]).contains("restart at")
    }));

    shepherd.client_stdout(&["cancel-restart", "crashy"]);
    let list = shepherd.client_stdout(&["list"]);
    assert!(
        list.contains("crashy: stopped") && !list.contains("restart at"),
        "list output: {list}"
    );

    shepherd.terminate();
}

#[test]
fn reload_restarts_only_the_changed_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let a_pid_path = dir.path().join("a.pid");
    let b_pid_path = dir.path().join("b.pid");
    let spec_path = dir.path().join("daemons.yaml");

    let spec = |b_sleep: u32| {
        format!(
            r#"
daemons:
  stable:
    start_command: "echo $$ > {a} && exec sleep 60"
  mutable:
    start_command: "echo $$ > {b} && exec sleep {b_sleep}"
"#,
            a = a_pid_path.display(),
            b = b_pid_path.display(),
        )
    };

    let shepherd = Shepherd::spawn(&dir, &spec(60));
    assert!(wait_until(Duration::from_secs(10), || {
        a_pid_path.exists() && b_pid_path.exists()
    }));
    let a_pid = read_pid(&a_pid_path).unwrap();
    let b_pid = read_pid(&b_pid_path).unwrap();

    // Change only the mutable daemon's command and reload.
    fs::write(&spec_path, spec(61)).unwrap();
    fs::remove_file(&b_pid_path).unwrap();
    shepherd.client_stdout(&["reload"]);

    assert!(
        wait_until(Duration::from_secs(10), || b_pid_path.exists()),
        "changed daemon should restart"
    );
    let new_b_pid = read_pid(&b_pid_path).unwrap();
    assert_ne!(new_b_pid, b_pid, "changed daemon gets a new pid");
    assert!(!process_alive(b_pid), "old instance is gone");

    // The untouched daemon kept its process.
    assert_eq!(read_pid(&a_pid_path).unwrap(), a_pid);
    assert!(process_alive(a_pid));

    shepherd.terminate();
}

#[test]
fn captured_output_reaches_the_supervisor_log() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("shepherd.log");
    let spec_path = dir.path().join("daemons.yaml");
    let socket = dir.path().join("control.sock");

    fs::write(
        &spec_path,
        r#"
daemons:
  chatty:
    start_command: "echo hello-from-chatty; exec sleep 60"
    stdout: log
"#,
    )
    .unwrap();

    let mut child = daemonshepherd()
        .arg("--daemons")
        .arg(&spec_path)
        .arg("--socket")
        .arg(&socket)
        .arg("--logging")
        .arg(&log_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        fs::read_to_string(&log_path)
            .map(|log| log.contains("hello-from-chatty"))
            .unwrap_or(false)
    }));

    let pid = child.id() as i32;
    let _ = Command::new("kill").arg(pid.to_string()).status();
    let deadline = Instant::now() + Duration::from_secs(10);
    while child.try_wait().unwrap().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if child.try_wait().unwrap().is_none() {
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
