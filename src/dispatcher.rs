//! The readiness loop: accepts connections, routes readiness to the worker
//! pool, and owns the idle-connection timer list.
//!
//! The dispatcher thread is the only mutator of the timer list and of the
//! per-descriptor client data. Workers touch connections only through their
//! slot mutex.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::{Config, LISTEN_BACKLOG, MAX_EVENT_NUMBER, TriggerModes};
use crate::constants::BUSY_MESSAGE;
use crate::context::ServerContext;
use crate::epoll::{Event, Events, TriggerMode};
use crate::error::ServerError;
use crate::metrics;
use crate::signals::{Alarm, Notifier, SignalPipe};
use crate::sync::{lock, try_lock};
use crate::timer::{TimerKey, TimerList};
use crate::worker_pool::{Completion, DispatchMode, Phase, QueueFull, WorkItem, WorkerPool};

/// Timer payload: which socket the timer was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerOwner {
    fd: RawFd,
    generation: u64,
}

/// Dispatcher-side bookkeeping for one descriptor.
#[derive(Debug, Clone, Copy, Default)]
struct ClientData {
    timer: Option<TimerKey>,
    generation: u64,
    peer: Option<SocketAddr>,
}

fn create_listener(port: u16, linger: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_linger(linger_timeout(linger))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket)
}

/// `None` closes immediately and discards unsent data.
fn linger_timeout(linger: bool) -> Option<Duration> {
    linger.then_some(Duration::from_secs(1))
}

pub struct Dispatcher {
    listener: Socket,
    listen_fd: RawFd,
    modes: TriggerModes,
    linger: bool,
    max_conn: usize,
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
    signals: SignalPipe,
    alarm: Alarm,
    idle_timeout: Duration,
    timers: TimerList<TimerOwner>,
    clients: Vec<ClientData>,
    events: Events,
    ready: Vec<Event>,
    timeout: bool,
    stop: bool,
}

impl Dispatcher {
    /// Bind the listening socket, register it and the signal pipe, and start
    /// the worker pool.
    pub fn bind(config: &Config, ctx: Arc<ServerContext>) -> Result<Self, ServerError> {
        config.validate()?;
        let modes = config.trigger_modes()?;

        let listener = create_listener(config.port, config.opt_linger)?;
        let listen_fd = listener.as_raw_fd();
        ctx.poller.add(listen_fd, false, modes.listen)?;

        let signals = SignalPipe::new()?;
        ctx.poller.add(signals.reader_fd(), false, TriggerMode::Level)?;

        let pool = WorkerPool::start(
            config.actor_model,
            config.threads,
            config.max_requests,
            Arc::clone(&ctx),
        )?;

        let slots = ctx.max_connections();
        let alarm_secs = u32::try_from(config.timeslot).unwrap_or(u32::MAX);
        Ok(Self {
            listener,
            listen_fd,
            modes,
            linger: config.opt_linger,
            max_conn: config.connection_limit().min(slots),
            ctx,
            pool,
            signals,
            alarm: Alarm::Signal(alarm_secs),
            idle_timeout: config.idle_timeout(),
            timers: TimerList::with_capacity(1024),
            clients: vec![ClientData::default(); slots],
            events: Events::with_capacity(MAX_EVENT_NUMBER),
            ready: Vec::with_capacity(MAX_EVENT_NUMBER),
            timeout: false,
            stop: false,
        })
    }

    /// Replace the tick source, e.g. with [`Alarm::Manual`].
    pub fn with_alarm(mut self, alarm: Alarm) -> Self {
        self.alarm = alarm;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "listener is not inet"))
    }

    pub fn notifier(&self) -> Notifier {
        self.signals.notifier()
    }

    pub fn install_signal_handlers(&self) -> io::Result<()> {
        self.signals.install_handlers()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Pending idle timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Run until a stop signal arrives.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            listen = ?self.modes.listen,
            conn = ?self.modes.conn,
            mode = ?self.pool.mode(),
            threads = self.pool.threads(),
            "tinyweb listening"
        );
        self.alarm.arm();

        while !self.stop {
            match self.ctx.poller.wait(&mut self.events, None) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "epoll failure");
                    return Err(e.into());
                }
            }

            let mut ready = std::mem::take(&mut self.ready);
            ready.clear();
            ready.extend(self.events.iter());
            for event in &ready {
                self.dispatch(*event);
            }
            self.ready = ready;

            if self.timeout {
                self.timeout = false;
                self.tick();
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let fd = event.fd;
        if fd == self.listen_fd {
            self.handle_accept();
        } else if fd == self.signals.reader_fd() {
            if event.readable {
                self.handle_signal();
            }
        } else if event.hangup {
            let generation = self.client(fd).map_or(0, |c| c.generation);
            self.evict(fd, generation);
        } else if event.readable {
            self.handle_read(fd);
        } else if event.writable {
            self.handle_write(fd);
        }
    }

    fn client(&self, fd: RawFd) -> Option<&ClientData> {
        usize::try_from(fd).ok().and_then(|idx| self.clients.get(idx))
    }

    fn client_mut(&mut self, fd: RawFd) -> Option<&mut ClientData> {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.clients.get_mut(idx))
    }

    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => match addr.as_socket() {
                    Some(peer) => self.accept_one(socket, peer),
                    None => warn!("accepted a non-inet peer"),
                },
                // Backlog drained.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept error");
                    break;
                }
            }
            if self.modes.listen == TriggerMode::Level {
                break;
            }
        }
    }

    fn accept_one(&mut self, socket: Socket, peer: SocketAddr) {
        let fd = socket.as_raw_fd();
        let ctx = Arc::clone(&self.ctx);
        let Some(slot) = ctx.slots.get(fd) else {
            reject_busy(socket, peer);
            return;
        };
        if ctx.live_connections() >= self.max_conn {
            reject_busy(socket, peer);
            return;
        }
        if let Err(e) = socket.set_linger(linger_timeout(self.linger)) {
            debug!(fd, error = %e, "set_linger failed");
        }

        // A timer left behind by the previous socket on this descriptor.
        let stale = self.client_mut(fd).and_then(|c| c.timer.take());
        if let Some(key) = stale {
            self.timers.remove(key);
        }

        let generation = {
            let mut conn = lock(slot);
            if let Err(e) = conn.open(socket, peer, self.modes.conn, &ctx) {
                warn!(fd, %peer, error = %e, "failed to register connection");
                return;
            }
            conn.generation()
        };

        let key = self.timers.insert(
            Instant::now() + self.idle_timeout,
            TimerOwner { fd, generation },
        );
        if let Some(client) = self.client_mut(fd) {
            *client = ClientData {
                timer: Some(key),
                generation,
                peer: Some(peer),
            };
        }
        metrics::inc_accepted();
        debug!(fd, %peer, "accepted");
    }

    fn handle_signal(&mut self) {
        let flags = self.signals.drain();
        self.timeout |= flags.timeout;
        self.stop |= flags.stop;
    }

    fn handle_read(&mut self, fd: RawFd) {
        let Some(client) = self.client(fd).copied() else {
            return;
        };
        if self.ctx.slots.eviction_requested(fd, client.generation) {
            self.evict(fd, client.generation);
            return;
        }
        match self.pool.mode() {
            DispatchMode::Reactor => {
                self.adjust_timer(fd);
                self.dispatch_and_wait(fd, client.generation, Phase::Read);
            }
            DispatchMode::Proactor => {
                let ok = match self.ctx.slots.get(fd) {
                    Some(slot) => {
                        let mut conn = lock(slot);
                        conn.is_current(client.generation) && conn.read_once()
                    }
                    None => false,
                };
                if !ok {
                    self.evict(fd, client.generation);
                    return;
                }
                if let Some(peer) = client.peer {
                    debug!(fd, %peer, "deal with the client");
                }
                self.adjust_timer(fd);
                let item = WorkItem {
                    fd,
                    generation: client.generation,
                    phase: Phase::Read,
                    done: None,
                };
                if let Err(QueueFull(item)) = self.pool.append(item) {
                    self.reject_queued(item.fd, item.generation);
                }
            }
        }
    }

    fn handle_write(&mut self, fd: RawFd) {
        let Some(client) = self.client(fd).copied() else {
            return;
        };
        if self.ctx.slots.eviction_requested(fd, client.generation) {
            self.evict(fd, client.generation);
            return;
        }
        match self.pool.mode() {
            DispatchMode::Reactor => {
                self.adjust_timer(fd);
                self.dispatch_and_wait(fd, client.generation, Phase::Write);
            }
            DispatchMode::Proactor => {
                let ok = match self.ctx.slots.get(fd) {
                    Some(slot) => {
                        let mut conn = lock(slot);
                        conn.is_current(client.generation) && conn.write(&self.ctx)
                    }
                    None => false,
                };
                if ok {
                    debug!(fd, "send data to the client");
                    self.adjust_timer(fd);
                } else {
                    self.evict(fd, client.generation);
                }
            }
        }
    }

    /// Hand a reactor item to the pool and wait for the worker to finish
    /// with the connection before touching timers or re-reading events.
    fn dispatch_and_wait(&mut self, fd: RawFd, generation: u64, phase: Phase) {
        let (done, completion) = mpsc::sync_channel(1);
        let item = WorkItem {
            fd,
            generation,
            phase,
            done: Some(done),
        };
        if let Err(QueueFull(item)) = self.pool.append(item) {
            self.reject_queued(item.fd, item.generation);
            return;
        }
        match completion.recv() {
            Ok(Completion::Done) | Ok(Completion::Stale) => {}
            Ok(Completion::Failed) => self.evict(fd, generation),
            Err(_) => {
                error!(fd, "worker dropped a work item");
                self.evict(fd, generation);
            }
        }
    }

    /// The queue is full: tell the client and drop the connection.
    fn reject_queued(&mut self, fd: RawFd, generation: u64) {
        warn!(fd, "work queue full");
        if let Some(slot) = self.ctx.slots.get(fd) {
            let conn = lock(slot);
            if conn.is_current(generation) {
                let _ = conn.send_raw(BUSY_MESSAGE.as_bytes());
            }
        }
        self.evict(fd, generation);
    }

    fn adjust_timer(&mut self, fd: RawFd) {
        let Some(key) = self.client(fd).and_then(|c| c.timer) else {
            return;
        };
        if self.timers.adjust(key, Instant::now() + self.idle_timeout) {
            debug!(fd, "adjust timer once");
        }
    }

    /// Close the connection and drop its timer. A second call for the same
    /// socket, or a call for a socket already replaced, does nothing.
    ///
    /// Never waits on a slot a worker holds: the connection is marked instead
    /// and retried on the next tick.
    fn evict(&mut self, fd: RawFd, generation: u64) {
        let timer = match self.client_mut(fd) {
            Some(client) if client.generation == generation => client.timer.take(),
            _ => None,
        };
        if let Some(key) = timer {
            self.timers.remove(key);
        }

        let ctx = Arc::clone(&self.ctx);
        let Some(slot) = ctx.slots.get(fd) else {
            return;
        };
        let closed = match try_lock(slot) {
            Some(mut conn) => conn.is_current(generation) && conn.close(&ctx),
            None => {
                self.defer_eviction(fd, generation);
                false
            }
        };
        if closed {
            metrics::inc_evicted();
        }
    }

    fn defer_eviction(&mut self, fd: RawFd, generation: u64) {
        let current = self
            .client(fd)
            .is_some_and(|client| client.generation == generation);
        if !current {
            return;
        }
        self.ctx.slots.request_eviction(fd, generation);
        let key = self
            .timers
            .insert(Instant::now(), TimerOwner { fd, generation });
        if let Some(client) = self.client_mut(fd) {
            client.timer = Some(key);
        }
        debug!(fd, "connection busy, eviction deferred");
    }

    /// Evict every connection whose idle timer has expired, then re-arm the
    /// alarm.
    fn tick(&mut self) {
        let mut expired = Vec::new();
        let fired = self
            .timers
            .tick(Instant::now(), |owner| expired.push(owner));

        for owner in expired {
            // The timer node is already gone; forget its key before evicting.
            if let Some(client) = self.client_mut(owner.fd) {
                if client.generation == owner.generation {
                    client.timer = None;
                }
            }
            self.evict(owner.fd, owner.generation);
        }
        info!(
            fired,
            pending = self.timers.len(),
            live = self.ctx.live_connections(),
            "timer tick"
        );
        self.alarm.arm();
    }
}

/// Connection limit reached: answer outside HTTP framing and close.
fn reject_busy(socket: Socket, peer: SocketAddr) {
    let mut writer: &Socket = &socket;
    let _ = writer.write(BUSY_MESSAGE.as_bytes());
    metrics::inc_rejected_busy();
    error!(%peer, "{BUSY_MESSAGE}");
}
