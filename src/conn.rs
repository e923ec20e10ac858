//! Per-socket connection state and the read / process / write phases.
//!
//! A [`Connection`] lives in a fixed slot indexed by its descriptor and is
//! reused for every socket the kernel hands that number out for. Each close
//! bumps the slot's generation, which is how work items and timers created
//! for an earlier socket recognise that they are stale.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::Socket;
use tracing::{debug, info, warn};

use crate::buffer::ReadBuffer;
use crate::config::READ_BUF_SIZE;
use crate::constants::{LOGIN_ERROR_PAGE, LOGIN_PAGE, REGISTER_ERROR_PAGE, WELCOME_PAGE};
use crate::context::ServerContext;
use crate::epoll::{Interest, TriggerMode};
use crate::metrics;
use crate::request::{Method, ParseOutcome, RequestParser};
use crate::resource::{FileOutcome, MappedFile, Route, open_resource, route};
use crate::response::{HttpCode, Output, WriteStatus};
use crate::users::Credentials;

#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    socket: Option<Socket>,
    peer: Option<SocketAddr>,
    generation: u64,
    mode: TriggerMode,
    read_buf: ReadBuffer,
    parser: RequestParser,
    output: Output,
}

impl Connection {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            socket: None,
            peer: None,
            generation: 0,
            mode: TriggerMode::Level,
            read_buf: ReadBuffer::new(READ_BUF_SIZE),
            parser: RequestParser::new(),
            output: Output::default(),
        }
    }

    /// Take ownership of an accepted socket and register it one-shot for
    /// reading. On failure the socket is closed and the slot stays free.
    pub fn open(
        &mut self,
        socket: Socket,
        peer: SocketAddr,
        mode: TriggerMode,
        ctx: &ServerContext,
    ) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        debug_assert_eq!(fd, self.fd, "socket placed in the wrong slot");
        ctx.poller.add(fd, true, mode)?;
        self.socket = Some(socket);
        self.peer = Some(peer);
        self.mode = mode;
        self.reset();
        ctx.conn_opened();
        Ok(())
    }

    /// Prepare for the next request on the same socket.
    pub fn reset(&mut self) {
        self.read_buf.clear();
        self.parser.reset();
        self.output.clear();
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Still the socket a work item or timer was created for.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_open() && self.generation == generation
    }

    /// Pull bytes off the socket: one `recv` when level-triggered, until
    /// would-block when edge-triggered. `false` means the peer closed, a hard
    /// error occurred or the request outgrew the buffer.
    pub fn read_once(&mut self) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        let mut reader: &Socket = socket;
        loop {
            if self.read_buf.is_full() {
                return false;
            }
            match reader.read(self.read_buf.spare_mut()) {
                Ok(0) => return false,
                Ok(n) => {
                    self.read_buf.commit(n);
                    if self.mode == TriggerMode::Level {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "recv failed");
                    return false;
                }
            }
        }
    }

    /// Parse what has been read and, once a request is complete, stage its
    /// response and re-arm for writing. Returns `false` if the connection was
    /// closed.
    pub fn process(&mut self, ctx: &ServerContext) -> bool {
        let (code, file) = match self.parser.parse(&mut self.read_buf) {
            ParseOutcome::Incomplete => {
                return self.rearm(Interest::Readable, ctx);
            }
            ParseOutcome::BadRequest => (HttpCode::BadRequest, None),
            ParseOutcome::Complete => {
                metrics::inc_requests();
                debug!(
                    fd = self.fd,
                    method = self.parser.method().as_str(),
                    target = self.parser.target(),
                    "request"
                );
                self.do_request(ctx)
            }
        };

        let keep_alive = self.parser.keep_alive();
        if let Err(err) = self.output.build(code, keep_alive, file) {
            warn!(fd = self.fd, ?err, "failed to build response");
            self.close(ctx);
            return false;
        }
        self.rearm(Interest::Writable, ctx)
    }

    fn do_request(&mut self, ctx: &ServerContext) -> (HttpCode, Option<MappedFile>) {
        let is_post = self.parser.method() == Method::Post;
        let page = match route(self.parser.target(), is_post) {
            Route::File(page) => page,
            Route::Login => {
                let creds = Credentials::from_form(self.parser.body(&self.read_buf));
                let page = match creds {
                    Some(creds) if ctx.users.login(&creds) => WELCOME_PAGE,
                    _ => LOGIN_ERROR_PAGE,
                };
                page.to_owned()
            }
            Route::Register => {
                let creds = Credentials::from_form(self.parser.body(&self.read_buf));
                let registered = creds.is_some_and(|creds| {
                    let db = ctx.db.acquire();
                    ctx.users.register(&creds, &db).is_ok()
                });
                let page = if registered { LOGIN_PAGE } else { REGISTER_ERROR_PAGE };
                page.to_owned()
            }
        };

        match open_resource(&ctx.doc_root, &page) {
            FileOutcome::Ready(file) => (HttpCode::FileRequest, Some(file)),
            FileOutcome::NotFound => (HttpCode::NoResource, None),
            FileOutcome::Forbidden => (HttpCode::ForbiddenRequest, None),
            FileOutcome::Directory => (HttpCode::BadRequest, None),
            FileOutcome::Unavailable => (HttpCode::InternalError, None),
        }
    }

    /// Send staged output. Returns `false` when the connection should be
    /// torn down: hard error, or a completed response without keep-alive.
    pub fn write(&mut self, ctx: &ServerContext) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        if self.output.remaining() == 0 {
            self.reset();
            return self.rearm(Interest::Readable, ctx);
        }

        let mut writer: &Socket = socket;
        match self.output.flush(&mut writer) {
            Ok(WriteStatus::WouldBlock) => self.rearm(Interest::Writable, ctx),
            Ok(WriteStatus::Flushed) => {
                metrics::inc_responses();
                let keep_alive = self.parser.keep_alive();
                self.reset();
                keep_alive && self.rearm(Interest::Readable, ctx)
            }
            Err(err) => {
                metrics::inc_write_failures();
                warn!(
                    fd = self.fd,
                    sent = self.output.sent(),
                    remaining = self.output.remaining(),
                    error = %err,
                    "write failed"
                );
                self.output.clear();
                false
            }
        }
    }

    /// Write bytes outside any response framing, ignoring would-block.
    pub fn send_raw(&self, bytes: &[u8]) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.send(bytes),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn rearm(&mut self, interest: Interest, ctx: &ServerContext) -> bool {
        if ctx.slots.eviction_requested(self.fd, self.generation) {
            debug!(fd = self.fd, "evicted while busy");
            self.close(ctx);
            return false;
        }
        match ctx.poller.rearm(self.fd, interest, self.mode) {
            Ok(()) => true,
            Err(err) => {
                warn!(fd = self.fd, error = %err, "epoll re-arm failed");
                self.close(ctx);
                false
            }
        }
    }

    /// Deregister and close the socket. Only the first call per socket has
    /// any effect; it returns `true`.
    pub fn close(&mut self, ctx: &ServerContext) -> bool {
        let Some(socket) = self.socket.take() else {
            return false;
        };
        if let Err(err) = ctx.poller.delete(self.fd) {
            debug!(fd = self.fd, error = %err, "epoll delete failed");
        }
        drop(socket);
        self.output.clear();
        self.peer = None;
        self.generation += 1;
        ctx.conn_closed();
        info!(fd = self.fd, "close fd");
        true
    }
}

/// Preallocated connection slots addressed by descriptor number.
///
/// Next to each slot sits an eviction mark: the dispatcher never waits on a
/// slot a worker holds, so it records `generation + 1` there instead and the
/// worker closes the connection rather than re-arming it. Zero means unmarked.
#[derive(Debug)]
pub struct ConnectionSlots {
    slots: Box<[Mutex<Connection>]>,
    evict: Box<[AtomicU64]>,
}

impl ConnectionSlots {
    pub fn new(max_fd: usize) -> Self {
        let slots = (0..max_fd)
            .map(|fd| Mutex::new(Connection::new(fd as RawFd)))
            .collect();
        let evict = (0..max_fd).map(|_| AtomicU64::new(0)).collect();
        Self { slots, evict }
    }

    pub fn get(&self, fd: RawFd) -> Option<&Mutex<Connection>> {
        usize::try_from(fd).ok().and_then(|idx| self.slots.get(idx))
    }

    /// Ask whoever holds the slot to close the socket of `generation`.
    pub fn request_eviction(&self, fd: RawFd, generation: u64) {
        if let Some(mark) = self.mark(fd) {
            mark.store(generation + 1, Ordering::Release);
        }
    }

    pub fn eviction_requested(&self, fd: RawFd, generation: u64) -> bool {
        self.mark(fd)
            .is_some_and(|mark| mark.load(Ordering::Acquire) == generation + 1)
    }

    fn mark(&self, fd: RawFd) -> Option<&AtomicU64> {
        usize::try_from(fd).ok().and_then(|idx| self.evict.get(idx))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionPool, MemoryStore};
    use crate::sync::lock;
    use socket2::{Domain, Type};
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn context(root: &std::path::Path) -> Arc<ServerContext> {
        let pool = ConnectionPool::new(Arc::new(MemoryStore::with_rows([("bob", "hi")])), 2);
        ServerContext::new(root.to_path_buf(), pool, 1024).unwrap()
    }

    /// A connected pair whose first half is wrapped as a socket2 socket.
    fn pair() -> (Socket, UnixStream) {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        (a, UnixStream::from(std::os::fd::OwnedFd::from(b)))
    }

    fn dummy_peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn serves_a_file_then_closes() {
        let root = tempfile::tempdir().unwrap();
        let page = root.path().join("judge.html");
        std::fs::write(&page, b"judge").unwrap();
        let ctx = context(root.path());

        let (socket, mut peer) = pair();
        let fd = socket.as_raw_fd();
        let slot = ctx.slots.get(fd).unwrap();
        let mut conn = lock(slot);
        conn.open(socket, dummy_peer(), TriggerMode::Level, &ctx).unwrap();
        assert_eq!(ctx.live_connections(), 1);

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(conn.read_once());
        assert!(conn.process(&ctx));
        assert!(!conn.write(&ctx), "no keep-alive means teardown");

        let generation = conn.generation();
        assert!(conn.close(&ctx));
        assert!(!conn.close(&ctx));
        assert_eq!(conn.generation(), generation + 1);
        assert_eq!(ctx.live_connections(), 0);
        drop(conn);

        let mut reply = String::new();
        std::io::Read::read_to_string(&mut peer, &mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("judge"));
    }

    #[test]
    fn marked_connection_closes_instead_of_rearming() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());
        let (socket, mut peer) = pair();
        let fd = socket.as_raw_fd();
        let mut conn = lock(ctx.slots.get(fd).unwrap());
        conn.open(socket, dummy_peer(), TriggerMode::Level, &ctx).unwrap();
        let generation = conn.generation();

        ctx.slots.request_eviction(fd, generation);
        assert!(ctx.slots.eviction_requested(fd, generation));
        peer.write_all(b"GET /missing.html HTTP/1.1\r\n\r\n").unwrap();
        assert!(conn.read_once());
        assert!(!conn.process(&ctx));
        assert!(!conn.is_open());
        assert_eq!(ctx.live_connections(), 0);

        // The mark does not carry over to the next socket on this slot.
        assert!(!ctx.slots.eviction_requested(fd, conn.generation()));
    }

    #[test]
    fn stale_generation_is_not_current() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());
        let (socket, _peer) = pair();
        let fd = socket.as_raw_fd();
        let mut conn = lock(ctx.slots.get(fd).unwrap());
        conn.open(socket, dummy_peer(), TriggerMode::Edge, &ctx).unwrap();
        let generation = conn.generation();
        assert!(conn.is_current(generation));
        conn.close(&ctx);
        assert!(!conn.is_current(generation));
        assert!(!conn.is_current(generation + 1));
    }
}
