use thiserror::Error;

/// The upstream endpoint could not be reached or dropped the connection.
///
/// Always retried by the connector; never fatal.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Upstream handshake failed: {0}")]
    Handshake(String),

    #[error("Upstream connection lost: {0}")]
    Lost(String),

    #[error("Upstream closed the connection")]
    Closed,
}

/// A frame could not be decoded as intended.
///
/// Upstream frames that hit one of these are still relayed with
/// best-effort fields; inbound subscriber frames are discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Frame is not JSON: {0}")]
    NotJson(String),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Delivery to one subscriber failed. The subscriber is dropped; nobody
/// else is affected.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Subscriber queue is full")]
    QueueFull,

    #[error("Subscriber queue is closed")]
    Closed,

    #[error("Subscriber write failed: {0}")]
    WriteFailed(String),

    #[error("Subscriber write timed out")]
    WriteTimeout,
}

/// Chat log write, rotate, delete or read failure.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log file name: {0}")]
    InvalidFileName(String),

    #[error("Log file not found: {0}")]
    NotFound(String),
}

/// The hub control loop is no longer running.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("Relay hub has stopped")]
    Stopped,
}
