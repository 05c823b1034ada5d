//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chatrelay_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_UPSTREAM_URL, LOG_MAX_BYTES, LOG_MAX_FILES, RECONNECT_DELAY_SECS,
    REPLAY_CAPACITY, SHUTDOWN_GRACE_SECS, SUBSCRIBER_QUEUE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API and subscriber WebSocket.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Upstream WebSocket endpoint. `None` disables the connector.
    /// Env: `UPSTREAM_URL` (empty string disables)
    /// Default: `wss://cytube.net/ws`
    pub upstream_url: Option<String>,

    /// Directory holding the chat log files.
    /// Env: `LOG_DIR`
    /// Default: `./logs`
    pub log_dir: PathBuf,

    /// Messages kept for replay to new subscribers.
    /// Env: `REPLAY_CAPACITY`
    /// Default: `100`
    pub replay_capacity: usize,

    /// Chat log size that triggers rotation.
    /// Env: `LOG_MAX_BYTES`
    /// Default: 10 MiB
    pub log_max_bytes: u64,

    /// Chat log files kept on disk.
    /// Env: `LOG_MAX_FILES`
    /// Default: `5`
    pub log_max_files: usize,

    /// Fixed wait between upstream reconnect attempts.
    /// Env: `RECONNECT_DELAY_SECS`
    /// Default: 5 s
    pub reconnect_delay: Duration,

    /// Live queue depth per subscriber (replay headroom is added on top).
    /// Env: `SUBSCRIBER_QUEUE`
    /// Default: `64`
    pub subscriber_queue: usize,

    /// How long shutdown waits for tasks to wind down.
    /// Env: `SHUTDOWN_GRACE_SECS`
    /// Default: 5 s
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            upstream_url: Some(DEFAULT_UPSTREAM_URL.to_string()),
            log_dir: PathBuf::from("./logs"),
            replay_capacity: REPLAY_CAPACITY,
            log_max_bytes: LOG_MAX_BYTES,
            log_max_files: LOG_MAX_FILES,
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            subscriber_queue: SUBSCRIBER_QUEUE,
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(url) = var("UPSTREAM_URL") {
            let url = url.trim();
            config.upstream_url = (!url.is_empty()).then(|| url.to_string());
        }

        if let Some(path) = var("LOG_DIR") {
            config.log_dir = PathBuf::from(path);
        }

        if let Some(n) = positive(&var, "REPLAY_CAPACITY") {
            config.replay_capacity = n;
        }

        if let Some(n) = positive(&var, "LOG_MAX_BYTES") {
            config.log_max_bytes = n;
        }

        if let Some(n) = positive(&var, "LOG_MAX_FILES") {
            config.log_max_files = n;
        }

        if let Some(secs) = positive(&var, "RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(secs);
        }

        if let Some(n) = positive(&var, "SUBSCRIBER_QUEUE") {
            config.subscriber_queue = n;
        }

        if let Some(secs) = positive(&var, "SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace = Duration::from_secs(secs);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Read a strictly positive integer, warning about anything else.
fn positive<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) if n > T::default() => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Expected a positive integer, using default");
            None
        }
    }
}
