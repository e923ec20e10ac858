//! In-memory credential table and the form decoding that feeds it.
//!
//! Passwords are stored and compared as plain text. This is a known gap.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{info, warn};

use crate::db::{ConnectionPool, DbConnection};
use crate::error::DbError;
use crate::sync::lock;

/// `user=..&password=..` as posted by the login and register forms.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn from_form(body: &[u8]) -> Option<Self> {
        serde_urlencoded::from_bytes(body).ok()
    }
}

/// Username to password, seeded from the store at startup.
#[derive(Debug, Default)]
pub struct UserTable {
    users: Mutex<HashMap<String, String>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table through one pooled connection.
    pub fn load(pool: &std::sync::Arc<ConnectionPool>) -> Result<Self, DbError> {
        let conn = pool.acquire();
        let rows = conn.select_users()?;
        info!(users = rows.len(), "user table seeded");
        Ok(Self {
            users: Mutex::new(rows.into_iter().collect()),
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.users).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, user: &str) -> bool {
        lock(&self.users).contains_key(user)
    }

    pub fn login(&self, creds: &Credentials) -> bool {
        lock(&self.users)
            .get(&creds.user)
            .is_some_and(|stored| *stored == creds.password)
    }

    /// Insert through the store first; the table only changes if that
    /// succeeds. The lock is held across both so two registrations of the
    /// same name cannot interleave.
    pub fn register(&self, creds: &Credentials, db: &DbConnection) -> Result<(), DbError> {
        let mut users = lock(&self.users);
        if users.contains_key(&creds.user) {
            return Err(DbError::Duplicate(creds.user.clone()));
        }
        if let Err(err) = db.insert_user(&creds.user, &creds.password) {
            warn!(user = %creds.user, error = %err, "register failed");
            return Err(err);
        }
        users.insert(creds.user.clone(), creds.password.clone());
        Ok(())
    }
}
