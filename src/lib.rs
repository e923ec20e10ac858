//! Library crate for tinyweb: readiness-driven HTTP/1.1 server core.
//!
//! The **binary** (`main.rs`) wires configuration, logging, signal delivery and the
//! [`dispatcher::Dispatcher`]. Everything the dispatcher drives lives here so the
//! parser, timer list and worker pool stay testable without a listening socket.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod constants;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod epoll;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod resource;
pub mod response;
pub mod signals;
pub mod sync;
pub mod timer;
pub mod users;
pub mod worker_pool;
