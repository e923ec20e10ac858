//! Fixed worker threads fed by a bounded FIFO queue.
//!
//! `append` never blocks: a full queue hands the item back so the dispatcher
//! can reject the connection. Workers wait on the queue's semaphore and drop
//! the queue lock before touching a connection.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::context::ServerContext;
use crate::metrics;
use crate::sync::{Semaphore, lock};

/// Who performs the socket I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DispatchMode {
    /// The dispatcher reads and writes; workers only parse and respond.
    Proactor,
    /// Workers perform the I/O themselves and report back.
    Reactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Write,
}

/// Reported to the dispatcher once a reactor work item is finished and the
/// connection is unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// The connection must be evicted.
    Failed,
    /// The connection was closed or replaced before the item ran.
    Stale,
}

#[derive(Debug)]
pub struct WorkItem {
    pub fd: RawFd,
    pub generation: u64,
    pub phase: Phase,
    pub done: Option<SyncSender<Completion>>,
}

/// Returned by [`WorkQueue::try_push`] with the rejected item.
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("work queue is full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

/// Bounded multi-producer, multi-consumer FIFO.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Semaphore,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    pub fn try_push(&self, item: T) -> Result<(), QueueFull<T>> {
        {
            let mut items = lock(&self.items);
            if items.len() >= self.capacity {
                return Err(QueueFull(item));
            }
            items.push_back(item);
        }
        self.ready.release();
        Ok(())
    }

    /// Block until an item is available, then take the oldest.
    pub fn pop(&self) -> T {
        loop {
            self.ready.acquire();
            if let Some(item) = lock(&self.items).pop_front() {
                return item;
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        if !self.ready.try_acquire() {
            return None;
        }
        lock(&self.items).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct WorkerPool {
    mode: DispatchMode,
    queue: Arc<WorkQueue<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers. They run for the life of the process.
    pub fn start(
        mode: DispatchMode,
        threads: usize,
        capacity: usize,
        ctx: Arc<ServerContext>,
    ) -> io::Result<Self> {
        let queue = Arc::new(WorkQueue::new(capacity));
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || run_worker(mode, &queue, &ctx))?;
            workers.push(handle);
        }
        info!(threads, capacity, ?mode, "worker pool started");
        Ok(Self {
            mode,
            queue,
            workers,
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn append(&self, item: WorkItem) -> Result<(), QueueFull<WorkItem>> {
        self.queue.try_push(item).inspect_err(|_| metrics::inc_queue_full())
    }
}

fn run_worker(mode: DispatchMode, queue: &WorkQueue<WorkItem>, ctx: &ServerContext) {
    loop {
        let mut item = queue.pop();
        let done = item.done.take();
        let completion = handle(mode, &item, ctx);
        // The connection lock is released inside `handle`.
        if let Some(done) = done {
            let _ = done.send(completion);
        }
    }
}

fn handle(mode: DispatchMode, item: &WorkItem, ctx: &ServerContext) -> Completion {
    let Some(slot) = ctx.slots.get(item.fd) else {
        return Completion::Stale;
    };
    let mut conn = lock(slot);
    if !conn.is_current(item.generation) {
        debug!(fd = item.fd, generation = item.generation, "stale work item");
        return Completion::Stale;
    }

    let ok = match (mode, item.phase) {
        (DispatchMode::Proactor, _) => conn.process(ctx),
        (DispatchMode::Reactor, Phase::Read) => conn.read_once() && conn.process(ctx),
        (DispatchMode::Reactor, Phase::Write) => conn.write(ctx),
    };
    if ok { Completion::Done } else { Completion::Failed }
}
