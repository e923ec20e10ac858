//! Server sizing and operational configuration.
//!
//! Fixed sizing lives in the constants below; everything an operator may want
//! to change is a [`Config`] flag (each also readable from the environment).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::epoll::TriggerMode;
use crate::error::ConfigError;
use crate::worker_pool::DispatchMode;

/// Default connection-slot count; also the live-connection limit.
pub const MAX_FD: usize = 65536;

/// Events drained per `epoll_wait`.
pub const MAX_EVENT_NUMBER: usize = 10000;

/// Timer tick interval in seconds. Idle connections expire after three slots.
pub const TIMESLOT: u64 = 5;

/// Per-connection receive buffer (bytes). A request must fit entirely.
pub const READ_BUF_SIZE: usize = 2048;

/// Per-connection response-head buffer (bytes).
pub const WRITE_BUF_SIZE: usize = 1024;

pub const LISTEN_BACKLOG: i32 = 5;

/// Bounded queue between log callers and the flush thread in async mode.
pub const LOG_QUEUE_CAPACITY: usize = 800;

const _: () = assert!(READ_BUF_SIZE > 0 && WRITE_BUF_SIZE > 0);

#[derive(Debug, Clone, Parser)]
#[command(
    name = "tinyweb",
    about = "Readiness-driven HTTP/1.1 server",
    args_override_self = true
)]
pub struct Config {
    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long, default_value_t = 9006, env = "TINYWEB_PORT")]
    pub port: u16,

    /// Trigger modes: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (listen + connection)
    #[arg(short = 'm', long, default_value_t = 0, env = "TINYWEB_TRIG_MODE")]
    pub trig_mode: u8,

    /// Linger up to 1s on close to drain unsent data
    #[arg(short = 'o', long, env = "TINYWEB_LINGER")]
    pub opt_linger: bool,

    /// Worker thread count
    #[arg(short, long, default_value_t = 8, env = "TINYWEB_THREADS")]
    pub threads: usize,

    /// Work queue capacity; appends beyond it are rejected
    #[arg(long, default_value_t = 10000, env = "TINYWEB_MAX_REQUESTS")]
    pub max_requests: usize,

    /// Database connection pool size
    #[arg(short, long, default_value_t = 8, env = "TINYWEB_SQL_NUM")]
    pub sql_num: usize,

    /// Queue log lines to a dedicated flush thread
    #[arg(short = 'l', long, env = "TINYWEB_ASYNC_LOG")]
    pub async_log: bool,

    /// Disable logging entirely
    #[arg(short = 'c', long, env = "TINYWEB_CLOSE_LOG")]
    pub close_log: bool,

    /// Dispatch discipline
    #[arg(short, long, value_enum, default_value_t = DispatchMode::Proactor, env = "TINYWEB_ACTOR_MODEL")]
    pub actor_model: DispatchMode,

    /// Document root
    #[arg(long, default_value = "./root", env = "TINYWEB_ROOT")]
    pub root: PathBuf,

    /// Seed file of `name:password` lines for the user store
    #[arg(long, env = "TINYWEB_USERS")]
    pub users: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "TINYWEB_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Connection slot count; descriptors at or above it are turned away
    #[arg(long, default_value_t = MAX_FD, env = "TINYWEB_MAX_FD")]
    pub max_fd: usize,

    /// Live-connection limit (defaults to the slot count)
    #[arg(long, env = "TINYWEB_MAX_CONN")]
    pub max_conn: Option<usize>,

    /// Timer tick interval in seconds
    #[arg(long, default_value_t = TIMESLOT, env = "TINYWEB_TIMESLOT")]
    pub timeslot: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["tinyweb"])
    }
}

/// Listening socket and accepted connections are configured independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerModes {
    pub listen: TriggerMode,
    pub conn: TriggerMode,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_requests == 0 {
            return Err(ConfigError::QueueCapacity);
        }
        if self.sql_num == 0 {
            return Err(ConfigError::PoolSize);
        }
        if self.timeslot == 0 {
            return Err(ConfigError::Timeslot);
        }
        if self.max_fd == 0 {
            return Err(ConfigError::MaxFd);
        }
        if self.max_conn == Some(0) {
            return Err(ConfigError::MaxConn);
        }
        self.trigger_modes().map(|_| ())
    }

    pub fn trigger_modes(&self) -> Result<TriggerModes, ConfigError> {
        use TriggerMode::{Edge, Level};
        let (listen, conn) = match self.trig_mode {
            0 => (Level, Level),
            1 => (Level, Edge),
            2 => (Edge, Level),
            3 => (Edge, Edge),
            other => return Err(ConfigError::TriggerMode(other)),
        };
        Ok(TriggerModes { listen, conn })
    }

    pub fn timeslot(&self) -> Duration {
        Duration::from_secs(self.timeslot)
    }

    /// Live connections allowed at once, never more than there are slots.
    pub fn connection_limit(&self) -> usize {
        self.max_conn.map_or(self.max_fd, |limit| limit.min(self.max_fd))
    }

    /// How long a connection may sit idle before the timer list evicts it.
    pub fn idle_timeout(&self) -> Duration {
        self.timeslot() * 3
    }
}
