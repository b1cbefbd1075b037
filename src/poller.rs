//! Poll multiplexer and signal plumbing.
//!
//! Both event loops block in exactly one place: `wait_readable`. Signal
//! handlers never touch program state; they set an atomic flag and write one
//! byte to a self-pipe whose read end sits in the poll set, so a signal
//! arriving mid-wait wakes the loop immediately.
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

const MAX_SIGNAL: usize = 32;

static PENDING: [AtomicBool; MAX_SIGNAL] =
    [const { AtomicBool::new(false) }; MAX_SIGNAL];
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn note_signal(signum: libc::c_int) {
    // Only async-signal-safe operations are allowed here.
    if let Ok(index) = usize::try_from(signum)
        && index < MAX_SIGNAL
    {
        PENDING[index].store(true, Ordering::SeqCst);
    }
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Self-pipe backed signal receiver. Install once per process.
pub struct Signals {
    rx: OwnedFd,
    _tx: OwnedFd,
}

impl Signals {
    /// Installs flag-setting handlers for the given signals and returns the
    /// wake-up descriptor holder.
    pub fn install(signals: &[Signal]) -> io::Result<Self> {
        let (rx, tx) = pipe()?;
        set_nonblocking(rx.as_raw_fd())?;
        set_nonblocking(tx.as_raw_fd())?;
        set_cloexec(rx.as_raw_fd())?;
        set_cloexec(tx.as_raw_fd())?;
        WAKE_FD.store(tx.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(note_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in signals {
            unsafe {
                sigaction(*signal, &action)?;
            }
        }

        Ok(Self { rx, _tx: tx })
    }

    /// The read end of the self-pipe, for the poll set.
    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Empties the self-pipe. Call once per loop iteration before checking
    /// the individual flags.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Consumes the pending flag for a signal.
    pub fn take(&self, signal: Signal) -> bool {
        PENDING[signal as usize].swap(false, Ordering::SeqCst)
    }
}

/// Ignores SIGPIPE so broken-pipe writes surface as `EPIPE` errors.
pub fn ignore_sigpipe() -> io::Result<()> {
    let action =
        SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGPIPE, &action)?;
    }
    Ok(())
}

/// Marks a descriptor non-blocking.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Marks a descriptor close-on-exec so children never inherit it.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Waits until one of `fds` is readable or the timeout elapses. Returns the
/// descriptors that are readable, hung up, or in error. An interrupted wait
/// returns an empty set so the caller re-examines its flags.
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<RawFd>> {
    // SAFETY: callers keep every registered descriptor open across the call.
    let mut poll_fds: Vec<PollFd> = fds
        .iter()
        .map(|&fd| {
            PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)
        })
        .collect();

    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);

    match poll(&mut poll_fds, poll_timeout) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => {
            let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            Ok(poll_fds
                .iter()
                .zip(fds)
                .filter(|(poll_fd, _)| {
                    poll_fd
                        .revents()
                        .is_some_and(|revents| revents.intersects(ready))
                })
                .map(|(_, &fd)| fd)
                .collect())
        }
        Err(Errno::EINTR) => Ok(Vec::new()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_reports_readable_ends() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let fds = [b.as_raw_fd()];

        let ready = wait_readable(&fds, Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty(), "nothing written yet");

        a.write_all(b"x").unwrap();
        let ready = wait_readable(&fds, Duration::from_millis(1000)).unwrap();
        assert_eq!(ready, vec![b.as_raw_fd()]);
    }

    #[test]
    fn wait_times_out_quickly_when_idle() {
        let (_a, b) = UnixStream::pair().unwrap();
        let started = std::time::Instant::now();
        let ready =
            wait_readable(&[b.as_raw_fd()], Duration::from_millis(20)).unwrap();
        assert!(ready.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn nonblocking_flag_round_trip() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        let flags = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
    }
}
