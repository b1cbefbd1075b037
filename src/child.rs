//! # Child process handle
//!
//! Encapsulates one supervised process: launch parameters, the live pid, the
//! captured output pipe, and the administrative commands declared for it.
//! The supervisor owns one handle per daemon entry and drives it from its
//! event loop.
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::{
    AdminCommandSpec, CommandLine, DaemonSpec, SignalSpec, StdoutMode,
};
use crate::constants::{
    ENV_DAEMON_PID, HOOK_BEFORE_START, STOP_GRACE, STOP_POLL_INTERVAL,
};
use crate::control::LineBuffer;
use crate::error::ChildError;
use crate::poller;
use crate::privilege::{self, Credentials};

/// Why a child left its process table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with a status code.
    Exited(i32),
    /// Death by signal.
    Signaled(i32),
}

impl ExitReason {
    /// The environment variable and value `after-crash` receives.
    pub fn hook_env(&self) -> (&'static str, String) {
        match self {
            ExitReason::Exited(code) => {
                (crate::constants::ENV_DAEMON_EXIT_CODE, code.to_string())
            }
            ExitReason::Signaled(signal) => {
                (crate::constants::ENV_DAEMON_SIGNAL, signal.to_string())
            }
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exit code {code}"),
            ExitReason::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Read end of a captured stdout/stderr pipe with its partial-line buffer.
struct OutputPipe {
    fd: OwnedFd,
    buf: LineBuffer,
}

/// One supervised process.
pub struct ChildHandle {
    name: String,
    spec: DaemonSpec,
    spec_hash: String,
    pid: Option<Pid>,
    pipe: Option<OutputPipe>,
    started_at: Option<Instant>,
}

impl ChildHandle {
    /// Wraps a declared spec. Nothing is spawned yet.
    pub fn new(name: &str, spec: DaemonSpec) -> Self {
        let spec_hash = spec.compute_hash();
        Self {
            name: name.to_string(),
            spec,
            spec_hash,
            pid: None,
            pipe: None,
            started_at: None,
        }
    }

    /// Daemon name from the spec file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared spec.
    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    /// Structural identity of the declared spec; live state never counts.
    pub fn spec_hash(&self) -> &str {
        &self.spec_hash
    }

    /// Whether a freshly loaded spec is structurally identical to ours.
    pub fn spec_matches(&self, other: &DaemonSpec) -> bool {
        self.spec_hash == other.compute_hash()
    }

    /// Live pid, if the child is running.
    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    /// Whether the child is currently running.
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// How long the current incarnation has been up.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|at| at.elapsed())
    }

    /// Descriptor of the captured output pipe, for the poll set.
    pub fn pipe_fd(&self) -> Option<RawFd> {
        self.pipe.as_ref().map(|pipe| pipe.fd.as_raw_fd())
    }

    /// Launches the child. Runs `before-start` first when declared; a
    /// non-zero exit aborts the attempt and counts as a death.
    pub fn start(&mut self) -> Result<(), ChildError> {
        if self.pid.is_some() {
            debug!(daemon = %self.name, "start requested but child already running");
            return Ok(());
        }

        if self.spec.commands.contains_key(HOOK_BEFORE_START) {
            self.run_hook(HOOK_BEFORE_START, &[])?;
        }

        let command_line =
            self.spec.start_command.as_ref().ok_or_else(|| {
                ChildError::SpawnError {
                    daemon: self.name.clone(),
                    source: io::Error::new(
                        ErrorKind::InvalidInput,
                        "no start_command",
                    ),
                }
            })?;

        let mut cmd = build_command(command_line, self.spec.argv0.as_deref())
            .map_err(|source| ChildError::SpawnError {
                daemon: self.name.clone(),
                source,
            })?;

        if let Some(environment) = &self.spec.environment {
            cmd.env_clear().envs(environment);
        }
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }

        self.apply_credentials(&mut cmd)?;
        cmd.process_group(0);
        cmd.stdin(Stdio::null());

        let pipe = match self.spec.stdout_mode() {
            StdoutMode::Console => None,
            StdoutMode::Devnull => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
                None
            }
            StdoutMode::Log => {
                let (rx, tx) = nix::unistd::pipe().map_err(|errno| {
                    ChildError::SpawnError {
                        daemon: self.name.clone(),
                        source: errno.into(),
                    }
                })?;
                poller::set_nonblocking(rx.as_raw_fd()).map_err(|source| {
                    ChildError::SpawnError {
                        daemon: self.name.clone(),
                        source,
                    }
                })?;
                poller::set_cloexec(rx.as_raw_fd()).map_err(|source| {
                    ChildError::SpawnError {
                        daemon: self.name.clone(),
                        source,
                    }
                })?;
                let tx_err = tx.try_clone().map_err(|source| {
                    ChildError::SpawnError {
                        daemon: self.name.clone(),
                        source,
                    }
                })?;
                cmd.stdout(Stdio::from(tx)).stderr(Stdio::from(tx_err));
                Some(OutputPipe {
                    fd: rx,
                    buf: LineBuffer::new(),
                })
            }
        };

        let child = cmd.spawn().map_err(|source| ChildError::SpawnError {
            daemon: self.name.clone(),
            source,
        })?;

        self.pid = Some(Pid::from_raw(child.id() as i32));
        self.pipe = pipe;
        self.started_at = Some(Instant::now());
        info!(daemon = %self.name, pid = child.id(), "daemon started");

        // The Child value is dropped here on purpose: reaping happens through
        // waitpid in the supervisor loop, and the stdio handles were either
        // inherited or moved into the spawn.
        Ok(())
    }

    /// Applies the stop procedure: `commands.stop` wins over the top-level
    /// `stop` field, a declared command wins over a declared signal, and the
    /// default is SIGTERM to the whole process group. Survivors of the grace
    /// period are force-killed.
    pub fn stop(&mut self) -> Result<(), ChildError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        info!(daemon = %self.name, pid = pid.as_raw(), "stopping daemon");

        let stop_command = self.spec.resolved_command("stop");
        match stop_command {
            Some(resolved) if resolved.command.is_some() => {
                if let Err(err) = self.spawn_admin("stop", &resolved, &[]) {
                    warn!(daemon = %self.name, "stop command failed: {err}");
                }
            }
            Some(resolved) if resolved.signal.is_some() => {
                self.deliver_signal(
                    resolved.signal.as_ref(),
                    resolved.process_group.unwrap_or(false),
                )?;
            }
            _ => match &self.spec.stop {
                Some(stop) if stop.command.is_some() => {
                    let resolved = AdminCommandSpec {
                        command: stop.command.clone(),
                        user: self.spec.user.clone(),
                        group: self.spec.group.clone(),
                        cwd: self.spec.cwd.clone(),
                        environment: self.spec.environment.clone(),
                        argv0: self.spec.argv0.clone(),
                        ..AdminCommandSpec::default()
                    };
                    if let Err(err) = self.spawn_admin("stop", &resolved, &[]) {
                        warn!(daemon = %self.name, "stop command failed: {err}");
                    }
                }
                Some(stop) => {
                    self.deliver_signal(
                        stop.signal.as_ref(),
                        stop.process_group.unwrap_or(false),
                    )?;
                }
                None => self.deliver_signal(None, true)?,
            },
        }

        let reaped = self.await_exit(pid, STOP_GRACE);
        if !reaped {
            warn!(
                daemon = %self.name,
                "daemon survived the stop grace, sending SIGKILL"
            );
            match killpg(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    return Err(ChildError::StopError {
                        daemon: self.name.clone(),
                        source: errno.into(),
                    });
                }
            }
            self.await_exit(pid, STOP_GRACE);
        }

        self.drain_pipe_to_log();
        self.pid = None;
        self.started_at = None;
        Ok(())
    }

    /// Runs a declared administrative command, waiting for it to finish.
    /// `DAEMON_PID` is exported (empty when the daemon is not running).
    pub fn run_command(&self, name: &str) -> Result<(), ChildError> {
        let resolved =
            self.spec
                .resolved_command(name)
                .ok_or_else(|| ChildError::UnknownCommand {
                    daemon: self.name.clone(),
                    command: name.to_string(),
                })?;

        if resolved.command.is_some() {
            return self.spawn_admin(name, &resolved, &[]);
        }

        if resolved.signal.is_some() {
            let Some(_) = self.pid else {
                return Err(ChildError::CommandError {
                    daemon: self.name.clone(),
                    command: name.to_string(),
                    source: io::Error::new(
                        ErrorKind::NotConnected,
                        "daemon not running",
                    ),
                });
            };
            return self
                .deliver_signal(
                    resolved.signal.as_ref(),
                    resolved.process_group.unwrap_or(false),
                )
                .map_err(|err| match err {
                    ChildError::StopError { daemon, source } => {
                        ChildError::CommandError {
                            daemon,
                            command: name.to_string(),
                            source,
                        }
                    }
                    other => other,
                });
        }

        Err(ChildError::UnknownCommand {
            daemon: self.name.clone(),
            command: name.to_string(),
        })
    }

    /// Runs a lifecycle hook (`before-start`, `after-crash`) with extra
    /// environment entries. A missing hook is a no-op.
    pub fn run_hook(
        &self,
        hook: &str,
        extra_env: &[(&str, String)],
    ) -> Result<(), ChildError> {
        let Some(resolved) = self.spec.resolved_command(hook) else {
            return Ok(());
        };
        if resolved.command.is_none() {
            return Ok(());
        }
        debug!(daemon = %self.name, hook, "running lifecycle hook");
        self.spawn_admin(hook, &resolved, extra_env).map_err(|err| match err {
            ChildError::CommandFailed {
                daemon,
                command,
                status,
            } => ChildError::HookFailed {
                daemon,
                hook: command,
                status,
            },
            other => other,
        })
    }

    /// Records an exit observed by the reaper.
    pub fn note_exited(&mut self, reason: ExitReason) {
        info!(daemon = %self.name, "daemon exited ({reason})");
        self.pid = None;
        self.started_at = None;
    }

    /// Drains complete lines from the captured pipe. Returns the lines and
    /// whether the pipe reached EOF (and was closed).
    pub fn read_pipe_lines(&mut self) -> (Vec<String>, bool) {
        let Some(pipe) = self.pipe.as_mut() else {
            return (Vec::new(), false);
        };

        let mut lines = Vec::new();
        let mut eof = false;
        let mut chunk = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::read(
                    pipe.fd.as_raw_fd(),
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            match n {
                0 => {
                    eof = true;
                    break;
                }
                n if n > 0 => pipe.buf.extend(&chunk[..n as usize]),
                _ => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        ErrorKind::WouldBlock => break,
                        ErrorKind::Interrupted => continue,
                        _ => {
                            warn!(
                                daemon = %self.name,
                                "output pipe read failed: {err}"
                            );
                            eof = true;
                            break;
                        }
                    }
                }
            }
        }

        while let Some(line) = pipe.buf.next_line() {
            lines.push(line);
        }
        if eof {
            if let Some(rest) = pipe.buf.take_remainder() {
                lines.push(rest);
            }
            self.pipe = None;
        }

        (lines, eof)
    }

    /// Emits captured output lines through the logger.
    pub fn log_output_lines(&self, lines: &[String]) {
        for line in lines {
            info!(daemon = %self.name, "{line}");
        }
    }

    fn drain_pipe_to_log(&mut self) {
        loop {
            let (lines, eof) = self.read_pipe_lines();
            self.log_output_lines(&lines);
            if eof || self.pipe.is_none() {
                break;
            }
            if lines.is_empty() {
                // Non-blocking pipe with nothing buffered; the write ends are
                // closed once the child is gone, so one more pass suffices.
                break;
            }
        }
        self.pipe = None;
    }

    fn apply_credentials(&self, cmd: &mut Command) -> Result<(), ChildError> {
        if self.spec.user.is_none() && self.spec.group.is_none() {
            return Ok(());
        }
        if !privilege::running_privileged() {
            debug!(
                daemon = %self.name,
                "credentials declared but supervisor is unprivileged; ignoring"
            );
            return Ok(());
        }
        let creds = Credentials::resolve(
            self.spec.user.as_deref(),
            self.spec.group.as_ref(),
        )?;
        creds.apply_to_command(cmd);
        Ok(())
    }

    fn deliver_signal(
        &self,
        signal: Option<&SignalSpec>,
        process_group: bool,
    ) -> Result<(), ChildError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = signal
            .and_then(SignalSpec::resolve)
            .unwrap_or(Signal::SIGTERM);

        let result = if process_group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ChildError::StopError {
                daemon: self.name.clone(),
                source: errno.into(),
            }),
        }
    }

    /// Reaps the child with WNOHANG polling until it exits or the grace runs
    /// out. Returns whether the child was reaped.
    fn await_exit(&self, pid: Pid, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(STOP_POLL_INTERVAL);
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    return true;
                }
                Ok(_) => std::thread::sleep(STOP_POLL_INTERVAL),
                Err(Errno::ECHILD) => return true,
                Err(errno) => {
                    warn!(daemon = %self.name, "waitpid failed: {errno}");
                    return true;
                }
            }
        }
    }

    fn spawn_admin(
        &self,
        name: &str,
        resolved: &AdminCommandSpec,
        extra_env: &[(&str, String)],
    ) -> Result<(), ChildError> {
        let command_line = resolved.command.as_ref().ok_or_else(|| {
            ChildError::UnknownCommand {
                daemon: self.name.clone(),
                command: name.to_string(),
            }
        })?;

        let mut cmd = build_command(command_line, resolved.argv0.as_deref())
            .map_err(|source| ChildError::CommandError {
                daemon: self.name.clone(),
                command: name.to_string(),
                source,
            })?;

        if let Some(environment) = &resolved.environment {
            cmd.env_clear().envs(environment);
        }
        let daemon_pid = self
            .pid
            .map(|pid| pid.as_raw().to_string())
            .unwrap_or_default();
        cmd.env(ENV_DAEMON_PID, daemon_pid);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        if let Some(cwd) = &resolved.cwd {
            cmd.current_dir(cwd);
        }

        if (resolved.user.is_some() || resolved.group.is_some())
            && privilege::running_privileged()
        {
            let creds = Credentials::resolve(
                resolved.user.as_deref(),
                resolved.group.as_ref(),
            )?;
            creds.apply_to_command(&mut cmd);
        }

        cmd.stdin(Stdio::null());

        let mut child =
            cmd.spawn().map_err(|source| ChildError::CommandError {
                daemon: self.name.clone(),
                command: name.to_string(),
                source,
            })?;

        let status = child.wait().map_err(|source| ChildError::CommandError {
            daemon: self.name.clone(),
            command: name.to_string(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            let code = status.code().unwrap_or_else(|| {
                use std::os::unix::process::ExitStatusExt;
                status.signal().map(|s| 128 + s).unwrap_or(-1)
            });
            Err(ChildError::CommandFailed {
                daemon: self.name.clone(),
                command: name.to_string(),
                status: code,
            })
        }
    }
}

/// Builds the base command for a launch: a string goes through `sh -c`, a
/// list is exec'd directly, and `argv0` renames the zeroth argument either
/// way.
fn build_command(line: &CommandLine, argv0: Option<&str>) -> io::Result<Command> {
    let mut cmd = match line {
        CommandLine::Shell(script) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
        CommandLine::Argv(argv) => {
            let program = argv.first().ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, "empty argv")
            })?;
            let mut cmd = Command::new(program);
            cmd.args(&argv[1..]);
            cmd
        }
    };
    if let Some(argv0) = argv0 {
        cmd.arg0(argv0);
    }
    Ok(cmd)
}
