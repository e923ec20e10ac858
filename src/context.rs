//! State shared by the dispatcher and every worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::conn::ConnectionSlots;
use crate::db::ConnectionPool;
use crate::epoll::Poller;
use crate::error::ServerError;
use crate::users::UserTable;

pub struct ServerContext {
    pub doc_root: PathBuf,
    /// `epoll_ctl` is thread-safe; workers re-arm through this directly.
    pub poller: Poller,
    /// Mutex-guarded; every access is a single lookup or insert.
    pub users: UserTable,
    /// Blocks the calling worker while all handles are checked out.
    pub db: Arc<ConnectionPool>,
    /// One mutex per descriptor. One-shot registration keeps contention to
    /// the dispatcher/worker handoff.
    pub slots: ConnectionSlots,
    live: AtomicUsize,
}

impl ServerContext {
    pub fn new(
        doc_root: PathBuf,
        db: Arc<ConnectionPool>,
        max_fd: usize,
    ) -> Result<Arc<Self>, ServerError> {
        let users = UserTable::load(&db)?;
        Ok(Arc::new(Self {
            doc_root,
            poller: Poller::new()?,
            users,
            db,
            slots: ConnectionSlots::new(max_fd),
            live: AtomicUsize::new(0),
        }))
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Slot count, the upper bound for any configured connection limit.
    pub fn max_connections(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn conn_opened(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn conn_closed(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("doc_root", &self.doc_root)
            .field("live", &self.live_connections())
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}
