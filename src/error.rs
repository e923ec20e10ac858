use std::io;

use thiserror::Error;

/// Fatal errors surfaced while building or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("failed to install log subscriber: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("work queue capacity must be at least 1")]
    QueueCapacity,

    #[error("database pool size must be at least 1")]
    PoolSize,

    #[error("timer slot must be at least 1 second")]
    Timeslot,

    #[error("trigger mode must be in 0..=3, got {0}")]
    TriggerMode(u8),

    #[error("connection slot count must be at least 1")]
    MaxFd,

    #[error("connection limit must be at least 1")]
    MaxConn,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("user {0} already exists")]
    Duplicate(String),

    #[error("malformed user row at line {line}")]
    MalformedRow { line: usize },

    #[error("store io error: {0}")]
    Io(#[from] io::Error),
}
