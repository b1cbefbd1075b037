//! Administrative control sockets.
//!
//! Both programs expose the same channel shape: a Unix stream socket bound to
//! a file-system path, one JSON request line and one JSON reply line per
//! connection. The server side is non-blocking and driven by the owning
//! event loop; the client side is a short blocking exchange.
use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    os::fd::{AsRawFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::ControlError;

/// Accumulates bytes from a non-blocking descriptor and hands out complete
/// lines. Partial lines stay buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete line, without its newline.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Returns any buffered partial line, consuming the buffer. Used when a
    /// descriptor reaches EOF with no trailing newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

struct ControlConn {
    stream: UnixStream,
    buf: LineBuffer,
}

/// Server side of the control channel. Owns the listener, the bound path,
/// and all accepted connections awaiting their single request.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
    conns: HashMap<RawFd, ControlConn>,
}

impl ControlListener {
    /// Binds the control socket, replacing a stale socket file if present.
    pub fn bind(path: &Path) -> Result<Self, ControlError> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            conns: HashMap::new(),
        })
    }

    /// Descriptor of the listening socket, for the poll set.
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Descriptors of accepted connections, for the poll set.
    pub fn conn_fds(&self) -> Vec<RawFd> {
        self.conns.keys().copied().collect()
    }

    /// Accepts every pending connection.
    pub fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!("failed to mark control connection non-blocking: {err}");
                        continue;
                    }
                    self.conns.insert(
                        stream.as_raw_fd(),
                        ControlConn {
                            stream,
                            buf: LineBuffer::new(),
                        },
                    );
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("control listener accept failed: {err}");
                    break;
                }
            }
        }
    }

    /// Whether the descriptor belongs to one of the accepted connections.
    pub fn owns(&self, fd: RawFd) -> bool {
        self.conns.contains_key(&fd)
    }

    /// Reads from a ready connection. Once a full request line is buffered,
    /// hands it to `dispatch`, writes the reply, and closes the connection.
    /// A client that disconnects mid-line is dropped silently.
    pub fn read_ready(&mut self, fd: RawFd, dispatch: &mut dyn FnMut(&str) -> Value) {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return;
        };

        let mut chunk = [0u8; 4096];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("control client disconnected before sending a request");
                    return;
                }
                Ok(n) => conn.buf.extend(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("control connection read failed: {err}");
                    return;
                }
            }
        }

        match conn.buf.next_line() {
            Some(line) => {
                let reply = dispatch(line.trim());
                if let Err(err) = write_reply(&mut conn.stream, &reply) {
                    debug!("failed to write control reply: {err}");
                }
            }
            // No full request yet; keep the connection and wait for more.
            None => {
                self.conns.insert(fd, conn);
            }
        }
    }

    /// Drops every pending connection without replying.
    pub fn close_conns(&mut self) {
        self.conns.clear();
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn write_reply(stream: &mut UnixStream, reply: &Value) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(reply)?;
    stream.set_nonblocking(false)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Sends one request to a control socket and waits for the reply.
pub fn send_request(path: &Path, request: &Value) -> Result<Value, ControlError> {
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    let payload = serde_json::to_vec(request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Extracts the error reason from a reply, covering both wire dialects:
/// `{"status":"error","reason":…}` and `{"error":…}`.
pub fn error_reason(reply: &Value) -> Option<String> {
    if reply.get("status").and_then(Value::as_str) == Some("error") {
        return Some(
            reply
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        );
    }
    reply
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
}
