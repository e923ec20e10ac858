use std::sync::Arc;

use clap::Parser;
use tracing::info;

use tinyweb::config::Config;
use tinyweb::context::ServerContext;
use tinyweb::db::{ConnectionPool, MemoryStore, UserStore};
use tinyweb::dispatcher::Dispatcher;
use tinyweb::error::ServerError;
use tinyweb::logging::{self, LogOptions};
use tinyweb::metrics;

fn main() -> Result<(), ServerError> {
    let config = Config::parse();
    config.validate()?;
    logging::init(&LogOptions::from(&config))?;

    let store: Arc<dyn UserStore> = match &config.users {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let db = ConnectionPool::new(store, config.sql_num);
    let ctx = ServerContext::new(config.root.clone(), db, config.max_fd)?;
    info!(
        root = %config.root.display(),
        users = ctx.users.len(),
        sql_num = config.sql_num,
        "tinyweb starting"
    );

    let mut dispatcher = Dispatcher::bind(&config, ctx)?;
    dispatcher.install_signal_handlers()?;
    metrics::spawn_reporter();

    dispatcher.run()
}
