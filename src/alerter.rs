//! # hailerter main loop
//!
//! Reads JSON lines from standard input, dispatches them to the tracker,
//! serves the control socket, and sweeps the timeout queue once per second,
//! driven by SIGALRM. Notifications go to standard output, one per line;
//! a broken output pipe is an orderly exit.
use std::io::{self, ErrorKind, Write};
use std::os::fd::RawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::Signal;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::constants::POLL_TICK;
use crate::control::{ControlListener, LineBuffer};
use crate::error::AlerterError;
use crate::message::{Message, Notification};
use crate::poller::{self, Signals};
use crate::tracker::{StateTracker, TrackerOptions};

const STDIN_FD: RawFd = 0;

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// The hailerter program state: tracker, control socket, stdin buffering.
pub struct Alerter {
    tracker: StateTracker,
    control: Option<ControlListener>,
    signals: Signals,
    stdin_buf: LineBuffer,
    stdin_open: bool,
}

impl Alerter {
    /// Sets up signals, the optional control socket, and non-blocking stdin.
    pub fn new(
        options: TrackerOptions,
        socket: Option<&Path>,
    ) -> Result<Self, AlerterError> {
        poller::ignore_sigpipe()?;
        let signals = Signals::install(&[
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGALRM,
        ])?;

        let control = match socket {
            Some(path) => Some(ControlListener::bind(path)?),
            None => None,
        };

        poller::set_nonblocking(STDIN_FD)?;

        Ok(Self {
            tracker: StateTracker::new(options),
            control,
            signals,
            stdin_buf: LineBuffer::new(),
            stdin_open: true,
        })
    }

    /// Runs until stdin closes, the consumer goes away, or a termination
    /// signal arrives.
    pub fn run(&mut self) -> Result<(), AlerterError> {
        info!("hailerter started");
        // One-second sweep cadence; the handler only sets a flag.
        unsafe {
            libc::alarm(1);
        }

        loop {
            let mut fds: Vec<RawFd> = vec![self.signals.fd()];
            if self.stdin_open {
                fds.push(STDIN_FD);
            }
            if let Some(control) = &self.control {
                fds.push(control.listener_fd());
                fds.extend(control.conn_fds());
            }

            let ready = poller::wait_readable(&fds, POLL_TICK)?;

            self.signals.drain();
            if self.signals.take(Signal::SIGALRM) {
                let notifications = self.tracker.sweep(now_epoch());
                if !self.emit(&notifications)? {
                    return Ok(());
                }
                unsafe {
                    libc::alarm(1);
                }
            }
            if self.signals.take(Signal::SIGHUP)
                || self.signals.take(Signal::SIGINT)
                || self.signals.take(Signal::SIGTERM)
            {
                info!("termination requested");
                return Ok(());
            }

            for fd in ready {
                if fd == self.signals.fd() {
                    continue;
                }
                if fd == STDIN_FD {
                    if !self.read_stdin()? {
                        return Ok(());
                    }
                    continue;
                }
                self.handle_control_fd(fd);
            }

            if !self.stdin_open {
                info!("standard input closed; exiting");
                return Ok(());
            }
        }
    }

    /// Reads whatever stdin has, processing every complete line in order.
    /// Returns false when the consumer on stdout went away.
    fn read_stdin(&mut self) -> Result<bool, AlerterError> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = unsafe {
                libc::read(
                    STDIN_FD,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            match n {
                0 => {
                    self.stdin_open = false;
                    break;
                }
                n if n > 0 => self.stdin_buf.extend(&chunk[..n as usize]),
                _ => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        ErrorKind::WouldBlock => break,
                        ErrorKind::Interrupted => continue,
                        _ => {
                            error!("stdin read failed: {err}");
                            self.stdin_open = false;
                            break;
                        }
                    }
                }
            }
        }

        while let Some(line) = self.stdin_buf.next_line() {
            if !self.handle_line(&line)? {
                return Ok(false);
            }
            if !self.stdin_open {
                // A malformed line closed the input mid-buffer.
                return Ok(true);
            }
        }
        if !self.stdin_open
            && let Some(rest) = self.stdin_buf.take_remainder()
            && !self.handle_line(&rest)?
        {
            return Ok(false);
        }

        Ok(true)
    }

    /// Processes one input line. All resulting notifications are written
    /// before the next line is read.
    fn handle_line(&mut self, line: &str) -> Result<bool, AlerterError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                // Broken JSON poisons the stream; stop reading it.
                error!("malformed input line ({err}): {trimmed}");
                self.stdin_open = false;
                return Ok(true);
            }
        };

        let Some(message) = Message::from_value(&value) else {
            debug!("dropping input line with unexpected shape");
            return Ok(true);
        };

        let notifications = self.tracker.process_message(&message, now_epoch());
        self.emit(&notifications)
    }

    fn handle_control_fd(&mut self, fd: RawFd) {
        let Some(mut control) = self.control.take() else {
            return;
        };

        if fd == control.listener_fd() {
            control.accept_ready();
        } else if control.owns(fd) {
            let tracker = &mut self.tracker;
            control.read_ready(fd, &mut |line| match serde_json::from_str(line) {
                Ok(request) => tracker.control(&request, now_epoch()),
                Err(_) => serde_json::json!({"error": "bad request"}),
            });
        }

        self.control = Some(control);
    }

    /// Writes notification lines to stdout. Returns false on EPIPE, which
    /// means the consumer is gone and the program should exit cleanly.
    fn emit(&mut self, notifications: &[Notification]) -> Result<bool, AlerterError> {
        if notifications.is_empty() {
            return Ok(true);
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        for notification in notifications {
            let line = serde_json::to_string(notification)
                .map_err(|err| io::Error::other(err.to_string()))?;
            if let Err(err) = writeln!(out, "{line}") {
                if err.kind() == ErrorKind::BrokenPipe {
                    info!("standard output closed; exiting");
                    return Ok(false);
                }
                return Err(err.into());
            }
        }
        match out.flush() {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                info!("standard output closed; exiting");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
