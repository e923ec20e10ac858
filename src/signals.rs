//! Signal delivery into the event loop.
//!
//! Handlers only forward the signal number as one byte over a connected
//! socket pair; the dispatcher reads those bytes as ordinary readiness.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::warn;

/// Write end used by the signal handler; -1 until handlers are installed.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: libc::c_int) {
    // SAFETY: only async-signal-safe calls; errno is restored before return.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(
                fd,
                (&byte as *const u8).cast(),
                1,
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            );
        }
        *errno = saved;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalFlags {
    /// Run the timer tick after this batch of events.
    pub timeout: bool,
    /// Leave the event loop.
    pub stop: bool,
}

#[derive(Debug)]
pub struct SignalPipe {
    reader: UnixStream,
    writer: Arc<UnixStream>,
}

impl SignalPipe {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            writer: Arc::new(writer),
        })
    }

    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Handle for injecting signal bytes from ordinary code.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            writer: Arc::clone(&self.writer),
        }
    }

    /// Route SIGALRM and SIGTERM into this pipe and ignore SIGPIPE.
    ///
    /// Process-wide: the most recently installed pipe receives the signals.
    pub fn install_handlers(&self) -> io::Result<()> {
        SIGNAL_WRITE_FD.store(self.writer.as_raw_fd(), Ordering::Relaxed);
        set_handler(libc::SIGPIPE, libc::SIG_IGN)?;
        let handler = forward_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        set_handler(libc::SIGALRM, handler)?;
        set_handler(libc::SIGTERM, handler)?;
        Ok(())
    }

    /// Read every queued signal byte.
    pub fn drain(&self) -> SignalFlags {
        let mut flags = SignalFlags::default();
        let mut buf = [0u8; 1024];
        let mut reader: &UnixStream = &self.reader;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match libc::c_int::from(byte) {
                            libc::SIGALRM => flags.timeout = true,
                            libc::SIGTERM => flags.stop = true,
                            _ => {}
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "signal pipe read failed");
                    break;
                }
            }
        }
        flags
    }
}

/// No `SA_RESTART`: a blocked `epoll_wait` returns EINTR and the loop
/// re-checks its flags.
fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: a zeroed sigaction is a valid starting value; the handler only
    // performs async-signal-safe work.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = 0;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Notifier {
    writer: Arc<UnixStream>,
}

impl Notifier {
    /// Queue `sig` as if its handler had run. A full pipe drops the byte.
    pub fn notify(&self, sig: libc::c_int) -> io::Result<()> {
        let mut writer: &UnixStream = &self.writer;
        match writer.write(&[sig as u8]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Source of the periodic timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    /// `alarm(2)` with this many seconds; delivered as SIGALRM.
    Signal(u32),
    /// Ticks are injected through a [`Notifier`].
    Manual,
}

impl Alarm {
    pub fn arm(self) {
        if let Alarm::Signal(secs) = self {
            // SAFETY: alarm(2) has no memory-safety preconditions.
            unsafe {
                libc::alarm(secs);
            }
        }
    }
}
