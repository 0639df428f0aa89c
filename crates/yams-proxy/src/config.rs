//! Process configuration from flags and environment.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;

/// YAMS - programmable HTTP interception proxy
///
/// Selects a profile by Host header and a Lua-scripted route by method and
/// path, synthesising responses or reverse-proxying to the profile backend.
/// Configuration is read from the relational store on every request.
#[derive(Parser, Debug)]
#[command(name = "yams")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server mode; `debug` enables the verbose error page
    #[arg(long, value_enum, default_value = "release", env = "YAMS_MODE")]
    pub mode: Mode,

    /// Proxy bind address
    #[arg(long, default_value = ":8086", env = "YAMS_PROXY_ADDR")]
    pub proxy_addr: String,

    /// Admin console bind address (the console runs as a separate service)
    #[arg(long, default_value = ":8087", env = "YAMS_CONSOLE_ADDR")]
    pub console_addr: String,

    /// Persistence DSN
    #[arg(long = "dsn", default_value = "postgres://localhost", env = "DATABASE_URL")]
    pub dsn: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Release,
    Debug,
}

/// Resolve a `:8086`-style address (host part optional) to a socket addr.
pub fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {addr:?}: {e}"))
}
