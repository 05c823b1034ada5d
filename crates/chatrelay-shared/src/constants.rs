/// Application name
pub const APP_NAME: &str = "chatrelay";

/// Number of recent messages replayed to a newly joined subscriber
pub const REPLAY_CAPACITY: usize = 100;

/// Chat log size threshold that triggers rotation (10 MiB)
pub const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of chat log files kept on disk
pub const LOG_MAX_FILES: usize = 5;

/// Fixed delay between upstream reconnect attempts, in seconds
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// Live message queue depth per subscriber, on top of replay headroom
pub const SUBSCRIBER_QUEUE: usize = 64;

/// Time a subscriber write may take before the peer is considered stalled
pub const SUBSCRIBER_WRITE_TIMEOUT_SECS: u64 = 10;

/// Grace period for tasks to finish after a shutdown signal, in seconds
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default upstream chat endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "wss://cytube.net/ws";

/// Author recorded for upstream frames that carry no usable author
pub const UPSTREAM_AUTHOR: &str = "upstream";

/// Chat log filename parts: `chat-YYYY-MM-DD.log`
pub const LOG_FILE_PREFIX: &str = "chat-";
pub const LOG_FILE_SUFFIX: &str = ".log";
