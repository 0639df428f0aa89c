// Allow dead_code in the binary target - library-only helpers (the in-memory
// store, pattern compilation) are exercised by the lib and test targets.
#![allow(dead_code)]

mod body;
mod config;
mod matcher;
mod model;
mod pattern;
mod proxy;
mod scripting;
mod session;
mod store;
mod template;

use clap::Parser;
use config::{Cli, Mode};
use proxy::ProxyServer;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use store::PgStorage;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = match cli.mode {
        Mode::Debug => "debug",
        Mode::Release => "info",
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    proxy::error::install_panic_capture();

    let pool = PgPoolOptions::new().connect_lazy(&cli.dsn)?;
    let store = Arc::new(PgStorage::new(pool));

    let addr = config::parse_addr(&cli.proxy_addr)?;
    info!("starting yams proxy (mode: {:?})", cli.mode);
    debug!(
        "admin console expected at {} (managed separately)",
        cli.console_addr
    );

    let server = ProxyServer::new(store, cli.mode == Mode::Debug);
    server.run(addr).await
}
