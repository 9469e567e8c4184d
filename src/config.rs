//! Configuration loading from `.env` files.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Minimum length of `ids`/`authors`/`#e`/`#p` filter prefixes.
    pub min_prefix: usize,
    /// Per-REQ filter count cap (two extra are tolerated).
    pub max_filters: usize,
    /// Per-frame byte cap; larger frames terminate the connection.
    pub max_message_len: usize,
    /// Per-connection message rate in messages per second; 0 is unlimited.
    pub rate: f64,
    /// Token bucket depth for the per-connection limiter.
    pub burst: usize,
    /// Retained events per kind class.
    pub cache_capacity: usize,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        Ok(Self {
            bind_http: env::var("BIND_HTTP")?,
            bind_ws: env::var("BIND_WS")?,
            min_prefix: parse_var("MIN_PREFIX", 0)?,
            max_filters: parse_var("MAX_FILTERS", 50)?,
            max_message_len: parse_var("MAX_MESSAGE_LEN", 16384)?,
            rate: parse_var("RATE", 20.0)?,
            burst: parse_var("BURST", 10)?,
            cache_capacity: parse_var("CACHE_CAPACITY", 1000)?,
        })
    }
}

/// Read an optional variable, falling back to `default` when unset or empty.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(s) if !s.is_empty() => s
            .parse()
            .with_context(|| format!("invalid value for {name}: {s}")),
        _ => Ok(default),
    }
}
