//! Logging setup for the toolbox binaries.
//!
//! daemonshepherd picks a destination from its CLI shorthands; hailerter
//! always logs to standard error. Verbosity follows `RUST_LOG` with an
//! `info` default.
use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::unix::net::UnixDatagram,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Where a program's log output goes.
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Write human-readable lines to standard error.
    Stderr,
    /// Append lines to a file.
    File(PathBuf),
    /// Send each line to the local syslog daemon.
    Syslog,
    /// Drop all output.
    Silent,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber for the chosen target. `tag` names the
/// program in syslog lines.
pub fn init(target: &LogTarget, tag: &'static str) -> io::Result<()> {
    match target {
        LogTarget::Silent => {}
        LogTarget::Stderr => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(io::stderr)
                .try_init();
        }
        LogTarget::File(path) => {
            let file = open_log_file(path)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(move || file.try_clone().unwrap())
                .with_ansi(false)
                .try_init();
        }
        LogTarget::Syslog => {
            let writer = SyslogMakeWriter::connect(tag)?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .without_time()
                .try_init();
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

// daemon facility, info severity
const SYSLOG_PRIORITY: u8 = 3 * 8 + 6;

/// Per-event writer that ships one datagram to `/dev/log` on drop.
pub struct SyslogLine {
    socket: Arc<UnixDatagram>,
    tag: &'static str,
    buf: Vec<u8>,
}

impl Write for SyslogLine {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        let message = String::from_utf8_lossy(&self.buf);
        let message = message.trim_end_matches('\n');
        if message.is_empty() {
            return;
        }
        let pid = std::process::id();
        let frame = format!("<{SYSLOG_PRIORITY}>{}[{pid}]: {message}", self.tag);
        let _ = self.socket.send(frame.as_bytes());
    }
}

/// `MakeWriter` backed by a datagram socket connected to `/dev/log`.
#[derive(Clone)]
pub struct SyslogMakeWriter {
    socket: Arc<UnixDatagram>,
    tag: &'static str,
}

impl SyslogMakeWriter {
    fn connect(tag: &'static str) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect("/dev/log")?;
        Ok(Self {
            socket: Arc::new(socket),
            tag,
        })
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine {
            socket: Arc::clone(&self.socket),
            tag: self.tag,
            buf: Vec::new(),
        }
    }
}
