//! User-store collaborator and its bounded connection pool.
//!
//! The pool hands out [`PooledConnection`]s; dropping one puts its handle back
//! and wakes a blocked `acquire`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::DbError;
use crate::sync::{Semaphore, lock};

/// Storage backing the user table.
pub trait UserStore: Send + Sync {
    /// Every stored `(name, password)` row.
    fn select_users(&self) -> Result<Vec<(String, String)>, DbError>;

    /// Store one row; a name already present is a [`DbError::Duplicate`].
    fn insert_user(&self, name: &str, password: &str) -> Result<(), DbError>;
}

/// Rows kept in memory, optionally appended to a `name:password` file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, String>>,
    file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows<I, N, P>(rows: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<String>,
    {
        Self {
            rows: Mutex::new(
                rows.into_iter()
                    .map(|(n, p)| (n.into(), p.into()))
                    .collect(),
            ),
            file: None,
        }
    }

    /// Load rows from `path`, creating it if missing. Later inserts are
    /// appended to the same file.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let mut rows = HashMap::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, password) = line
                .split_once(':')
                .ok_or(DbError::MalformedRow { line: idx + 1 })?;
            rows.insert(name.to_owned(), password.to_owned());
        }
        info!(path = %path.display(), users = rows.len(), "user store loaded");
        Ok(Self {
            rows: Mutex::new(rows),
            file: Some(path.to_path_buf()),
        })
    }
}

impl UserStore for MemoryStore {
    fn select_users(&self) -> Result<Vec<(String, String)>, DbError> {
        Ok(lock(&self.rows)
            .iter()
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect())
    }

    fn insert_user(&self, name: &str, password: &str) -> Result<(), DbError> {
        let mut rows = lock(&self.rows);
        if rows.contains_key(name) {
            return Err(DbError::Duplicate(name.to_owned()));
        }
        if let Some(path) = &self.file {
            let mut file: File = OpenOptions::new().append(true).open(path)?;
            writeln!(file, "{name}:{password}")?;
        }
        rows.insert(name.to_owned(), password.to_owned());
        Ok(())
    }
}

/// One checked-out store handle.
#[derive(Clone)]
pub struct DbConnection {
    id: usize,
    store: Arc<dyn UserStore>,
}

impl DbConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn select_users(&self) -> Result<Vec<(String, String)>, DbError> {
        self.store.select_users()
    }

    pub fn insert_user(&self, name: &str, password: &str) -> Result<(), DbError> {
        self.store.insert_user(name, password)
    }
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection").field("id", &self.id).finish()
    }
}

/// Fixed set of handles; `acquire` blocks while all are checked out.
pub struct ConnectionPool {
    free: Mutex<Vec<DbConnection>>,
    reserve: Semaphore,
    size: usize,
}

impl ConnectionPool {
    pub fn new(store: Arc<dyn UserStore>, size: usize) -> Arc<Self> {
        let free = (0..size)
            .map(|id| DbConnection {
                id,
                store: Arc::clone(&store),
            })
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            reserve: Semaphore::new(size),
            size,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledConnection {
        // A permit guarantees a free handle.
        let conn = loop {
            self.reserve.acquire();
            if let Some(conn) = lock(&self.free).pop() {
                break conn;
            }
        };
        debug!(id = conn.id, "db connection acquired");
        PooledConnection {
            conn,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, conn: DbConnection) {
        debug!(id = conn.id, "db connection released");
        lock(&self.free).push(conn);
        self.reserve.release();
    }

    pub fn free_count(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Checked-out handle; returned to the pool on drop.
pub struct PooledConnection {
    conn: DbConnection,
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone());
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
