//! Readiness registration helpers over Linux epoll.
//!
//! Connections are always registered one-shot: after an event fires the
//! descriptor stays silent until [`Poller::rearm`] is called, which is what lets
//! exactly one thread own a connection between notifications.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Edge-triggered delivers once per state change and must be drained;
/// level-triggered re-delivers while the condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    Level,
    Edge,
}

impl TriggerMode {
    fn flags(self) -> u32 {
        match self {
            TriggerMode::Level => 0,
            TriggerMode::Edge => libc::EPOLLET as u32,
        }
    }
}

/// Which readiness a one-shot re-arm waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn flags(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

/// One readiness notification, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Peer hangup, local hangup or error.
    pub hangup: bool,
}

impl Event {
    fn from_raw(raw: libc::epoll_event) -> Self {
        let flags = raw.events;
        let data = raw.u64;
        let hangup_mask = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
        Self {
            fd: data as RawFd,
            readable: flags & libc::EPOLLIN as u32 != 0,
            writable: flags & libc::EPOLLOUT as u32 != 0,
            hangup: flags & hangup_mask != 0,
        }
    }
}

/// Reusable buffer of raw events filled by [`Poller::wait`].
pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(|raw| Event::from_raw(*raw))
    }
}

/// An epoll instance. `epoll_ctl` is thread-safe, so workers re-arm through a
/// shared reference while the dispatcher waits.
#[derive(Debug)]
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: no pointers are passed; failure is reported through the return value.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 returned a fresh descriptor that nothing else owns.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    /// Register `fd` for read readiness and peer hangup, and switch it to
    /// non-blocking mode.
    pub fn add(&self, fd: RawFd, one_shot: bool, mode: TriggerMode) -> io::Result<()> {
        let mut events = libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32 | mode.flags();
        if one_shot {
            events |= libc::EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)?;
        set_nonblocking(fd)
    }

    /// Re-enable a one-shot registration for the given interest.
    pub fn rearm(&self, fd: RawFd, interest: Interest, mode: TriggerMode) -> io::Result<()> {
        let events = interest.flags()
            | libc::EPOLLONESHOT as u32
            | libc::EPOLLRDHUP as u32
            | mode.flags();
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: `epfd` is owned by `self`; EPOLL_CTL_DEL ignores the event
        // pointer, so null is accepted.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until at least one registered descriptor is ready, or until
    /// `timeout` elapses. `None` waits indefinitely.
    ///
    /// A signal arriving mid-wait surfaces as `ErrorKind::Interrupted`.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        // SAFETY: the kernel writes at most `raw.len()` entries into `raw`,
        // which is exclusively borrowed for the call.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.raw.as_mut_ptr(),
                events.raw.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            events.len = 0;
            return Err(io::Error::last_os_error());
        }
        events.len = n as usize;
        Ok(events.len)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: `event` is a live local the kernel only reads during the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL takes no argument; a bad `fd` yields EBADF, not UB.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFL takes an integer flag word; no memory is involved.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
