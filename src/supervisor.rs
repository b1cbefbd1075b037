//! # Supervisor
//!
//! The daemonshepherd controller: a single-threaded poll loop binding the
//! child handles, the restart queue, the control socket, and the self-pipe.
//! Child exits, reloads, and shutdown arrive as signal flags; everything
//! else is descriptor readiness.
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::child::{ChildHandle, ExitReason};
use crate::config::load_spec;
use crate::constants::{HOOK_AFTER_CRASH, POLL_TICK, RESERVED_COMMANDS};
use crate::control::ControlListener;
use crate::error::SupervisorError;
use crate::poller::{self, Signals};
use crate::restart::{DaemonState, RestartQueue};

/// One control request, tagged by its `command` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request {
    Reload,
    List,
    Start {
        daemon: String,
    },
    Stop {
        daemon: String,
    },
    Restart {
        daemon: String,
    },
    CancelRestart {
        daemon: String,
    },
    #[serde(rename = "list-commands")]
    ListCommands {
        daemon: String,
    },
    AdminCommand {
        daemon: String,
        admin_command: String,
    },
}

fn reply_ok() -> Value {
    json!({"status": "ok"})
}

fn reply_error(reason: impl std::fmt::Display) -> Value {
    json!({"status": "error", "reason": reason.to_string()})
}

/// Daemon supervisor owning the whole runtime state.
pub struct Supervisor {
    spec_path: PathBuf,
    children: HashMap<String, ChildHandle>,
    restarts: RestartQueue,
    control: Option<ControlListener>,
    signals: Signals,
    shutdown: bool,
}

impl Supervisor {
    /// Loads the spec file, installs signal handlers, binds the control
    /// socket when requested, and schedules the initial starts. Errors here
    /// are startup failures (exit 1).
    pub fn new(
        spec_path: &Path,
        socket: Option<&Path>,
    ) -> Result<Self, SupervisorError> {
        let spec = load_spec(spec_path)?;

        poller::ignore_sigpipe()?;
        let signals = Signals::install(&[
            Signal::SIGCHLD,
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGTERM,
        ])?;

        let control = match socket {
            Some(path) => Some(ControlListener::bind(path)?),
            None => None,
        };

        let mut supervisor = Self {
            spec_path: spec_path.to_path_buf(),
            children: HashMap::new(),
            restarts: RestartQueue::new(),
            control,
            signals,
            shutdown: false,
        };

        let now = Instant::now();
        for (name, daemon_spec) in &spec.daemons {
            supervisor.restarts.register(
                name,
                daemon_spec.restart_backoff(),
                daemon_spec.start_priority(),
            );
            supervisor
                .children
                .insert(name.clone(), ChildHandle::new(name, daemon_spec.clone()));
            supervisor.restarts.request_start(name, now);
        }

        Ok(supervisor)
    }

    /// Runs the event loop until an orderly shutdown is requested.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        info!(spec = %self.spec_path.display(), "supervisor started");
        while !self.shutdown {
            self.step(POLL_TICK)?;
        }
        self.shutdown_children();
        info!("supervisor shut down");
        Ok(())
    }

    /// One loop iteration: release due starts, wait for readiness, then
    /// consume signal flags and ready descriptors.
    pub fn step(&mut self, tick: Duration) -> Result<(), SupervisorError> {
        let now = Instant::now();
        self.start_due(now);

        let timeout = match self.restarts.next_due() {
            Some(due) => due.saturating_duration_since(now).min(tick),
            None => tick,
        };

        let mut fds: Vec<RawFd> = vec![self.signals.fd()];
        if let Some(control) = &self.control {
            fds.push(control.listener_fd());
            fds.extend(control.conn_fds());
        }
        for handle in self.children.values() {
            if let Some(fd) = handle.pipe_fd() {
                fds.push(fd);
            }
        }

        let ready = poller::wait_readable(&fds, timeout)?;

        self.signals.drain();
        if self.signals.take(Signal::SIGCHLD) {
            self.reap_children();
        }
        if self.signals.take(Signal::SIGHUP) {
            self.reload();
        }
        if self.signals.take(Signal::SIGINT) || self.signals.take(Signal::SIGTERM) {
            info!("termination requested");
            self.shutdown = true;
            return Ok(());
        }

        for fd in ready {
            if fd == self.signals.fd() {
                continue;
            }
            if self.handle_child_pipe(fd) {
                continue;
            }
            self.handle_control_fd(fd);
        }

        Ok(())
    }

    /// Whether the loop has been asked to stop.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    /// Live pid of a daemon, for tests and diagnostics.
    pub fn child_pid(&self, name: &str) -> Option<i32> {
        self.children.get(name).and_then(ChildHandle::pid)
    }

    fn start_due(&mut self, now: Instant) {
        for name in self.restarts.due_daemons(now) {
            let Some(handle) = self.children.get_mut(&name) else {
                continue;
            };
            match handle.start() {
                Ok(()) => self.restarts.note_started(&name),
                Err(err) => {
                    // A failed start counts as an immediate death.
                    warn!(daemon = name.as_str(), "start attempt failed: {err}");
                    self.restarts.note_died(&name, now, None);
                }
            }
        }
    }

    fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.handle_exit(pid, ExitReason::Exited(code));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.handle_exit(pid, ExitReason::Signaled(signal as i32));
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    warn!("waitpid failed: {errno}");
                    break;
                }
            }
        }
    }

    fn handle_exit(&mut self, pid: Pid, reason: ExitReason) {
        let Some(name) = self
            .children
            .values()
            .find(|handle| handle.pid() == Some(pid.as_raw()))
            .map(|handle| handle.name().to_string())
        else {
            // Not one of ours (e.g. an already-waited admin command).
            debug!(pid = pid.as_raw(), "reaped unknown child");
            return;
        };

        let handle = match self.children.get_mut(&name) {
            Some(handle) => handle,
            None => return,
        };

        let uptime = handle.uptime();
        handle.note_exited(reason);

        if let Err(err) = handle.run_hook(HOOK_AFTER_CRASH, &[reason.hook_env()]) {
            warn!(daemon = name.as_str(), "after-crash hook failed: {err}");
        }

        if self.restarts.state(&name) == Some(DaemonState::Running) {
            self.restarts.note_died(&name, Instant::now(), uptime);
        }
    }

    /// Reads a ready child pipe. Returns false when the descriptor belongs
    /// to something else.
    fn handle_child_pipe(&mut self, fd: RawFd) -> bool {
        let Some(name) = self
            .children
            .values()
            .find(|handle| handle.pipe_fd() == Some(fd))
            .map(|handle| handle.name().to_string())
        else {
            return false;
        };

        if let Some(handle) = self.children.get_mut(&name) {
            let (lines, eof) = handle.read_pipe_lines();
            handle.log_output_lines(&lines);
            if eof {
                debug!(daemon = name.as_str(), "output pipe closed");
            }
        }
        true
    }

    fn handle_control_fd(&mut self, fd: RawFd) {
        // The listener is taken out for the duration of the dispatch so the
        // handler may borrow the supervisor mutably.
        let Some(mut control) = self.control.take() else {
            return;
        };

        if fd == control.listener_fd() {
            control.accept_ready();
        } else if control.owns(fd) {
            control.read_ready(fd, &mut |line| self.dispatch_line(line));
        }

        self.control = Some(control);
    }

    /// Parses and executes one control request line, producing the reply.
    pub fn dispatch_line(&mut self, line: &str) -> Value {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => return reply_error(format!("bad request: {err}")),
        };
        match self.handle_request(request) {
            Ok(reply) => reply,
            Err(err) => reply_error(err),
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<Value, SupervisorError> {
        match request {
            Request::Reload => {
                self.reload();
                Ok(reply_ok())
            }
            Request::List => Ok(json!({"result": self.list_daemons()})),
            Request::Start { daemon } => {
                self.require_daemon(&daemon)?;
                if self.children[&daemon].is_running() {
                    return Ok(reply_ok());
                }
                self.restarts.request_restart(&daemon, Instant::now());
                self.start_due(Instant::now());
                Ok(reply_ok())
            }
            Request::Stop { daemon } => {
                self.require_daemon(&daemon)?;
                self.restarts.cancel(&daemon);
                if let Some(handle) = self.children.get_mut(&daemon) {
                    handle.stop()?;
                }
                Ok(reply_ok())
            }
            Request::Restart { daemon } => {
                self.require_daemon(&daemon)?;
                if let Some(handle) = self.children.get_mut(&daemon)
                    && handle.is_running()
                {
                    handle.stop()?;
                }
                self.restarts.request_restart(&daemon, Instant::now());
                self.start_due(Instant::now());
                Ok(reply_ok())
            }
            Request::CancelRestart { daemon } => {
                self.require_daemon(&daemon)?;
                if self.restarts.state(&daemon) == Some(DaemonState::Waiting) {
                    self.restarts.cancel(&daemon);
                }
                Ok(reply_ok())
            }
            Request::ListCommands { daemon } => {
                self.require_daemon(&daemon)?;
                Ok(json!({"result": self.children[&daemon].spec().listable_commands()}))
            }
            Request::AdminCommand {
                daemon,
                admin_command,
            } => {
                self.require_daemon(&daemon)?;
                if RESERVED_COMMANDS.contains(&admin_command.as_str()) {
                    return Err(SupervisorError::Child(
                        crate::error::ChildError::UnknownCommand {
                            daemon,
                            command: admin_command,
                        },
                    ));
                }
                self.children[&daemon].run_command(&admin_command)?;
                Ok(reply_ok())
            }
        }
    }

    fn require_daemon(&self, daemon: &str) -> Result<(), SupervisorError> {
        if self.children.contains_key(daemon) {
            Ok(())
        } else {
            Err(SupervisorError::UnknownDaemon {
                daemon: daemon.to_string(),
            })
        }
    }

    fn list_daemons(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.children.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let handle = &self.children[name];
                json!({
                    "daemon": name,
                    "pid": handle.pid(),
                    "running": handle.is_running(),
                    "restart_at": self.restart_at_epoch(name),
                })
            })
            .collect()
    }

    fn restart_at_epoch(&self, name: &str) -> Option<i64> {
        let due = self.restarts.restart_at(name)?;
        let delta = due.saturating_duration_since(Instant::now());
        let at = SystemTime::now() + delta;
        Some(at.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
    }

    /// Re-reads the spec file and applies the structural diff: removed
    /// daemons stop, added daemons start, changed daemons restart. Unchanged
    /// daemons are untouched even mid-backoff. A broken file keeps the
    /// previous spec. The released starts complete before this returns.
    pub fn reload(&mut self) {
        info!(spec = %self.spec_path.display(), "reloading spec file");
        let spec = match load_spec(&self.spec_path) {
            Ok(spec) => spec,
            Err(err) => {
                error!("reload failed, keeping previous spec: {err}");
                return;
            }
        };

        let now = Instant::now();

        let removed: Vec<String> = self
            .children
            .keys()
            .filter(|name| !spec.daemons.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            info!(daemon = name.as_str(), "daemon removed by reload");
            if let Some(mut handle) = self.children.remove(&name)
                && let Err(err) = handle.stop()
            {
                warn!(daemon = name.as_str(), "stop during reload failed: {err}");
            }
            self.restarts.remove(&name);
        }

        for (name, daemon_spec) in &spec.daemons {
            match self.children.get_mut(name) {
                Some(handle) if handle.spec_matches(daemon_spec) => {}
                Some(handle) => {
                    info!(daemon = name.as_str(), "spec changed, restarting daemon");
                    if let Err(err) = handle.stop() {
                        warn!(
                            daemon = name.as_str(),
                            "stop during reload failed: {err}"
                        );
                    }
                    *handle = ChildHandle::new(name, daemon_spec.clone());
                    self.restarts.register(
                        name,
                        daemon_spec.restart_backoff(),
                        daemon_spec.start_priority(),
                    );
                    self.restarts.request_start(name, now);
                }
                None => {
                    info!(daemon = name.as_str(), "daemon added by reload");
                    self.children
                        .insert(name.clone(), ChildHandle::new(name, daemon_spec.clone()));
                    self.restarts.register(
                        name,
                        daemon_spec.restart_backoff(),
                        daemon_spec.start_priority(),
                    );
                    self.restarts.request_start(name, now);
                }
            }
        }

        // Finish the diff before any further control request is read.
        self.start_due(now);
    }

    fn shutdown_children(&mut self) {
        // Stop in reverse start order.
        let mut order: Vec<(i32, String)> = self
            .children
            .values()
            .map(|handle| (handle.spec().start_priority(), handle.name().to_string()))
            .collect();
        order.sort();
        for (_priority, name) in order.into_iter().rev() {
            self.restarts.cancel(&name);
            if let Some(handle) = self.children.get_mut(&name)
                && let Err(err) = handle.stop()
            {
                warn!(daemon = name.as_str(), "stop during shutdown failed: {err}");
            }
        }
        if let Some(mut control) = self.control.take() {
            control.close_conns();
        }
    }
}
