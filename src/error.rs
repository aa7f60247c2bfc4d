//! Error types for the market stream client

use thiserror::Error;

/// Market stream client errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("WebSocket connection error: {0}")]
    Connect(String),

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("WebSocket send error: {0}")]
    Send(String),

    #[error("WebSocket receive error: {0}")]
    Receive(String),

    #[error("No inbound activity for {idle_ms}ms")]
    Stale { idle_ms: u64 },

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Login frame could not be sent: {0}")]
    Login(String),

    #[error("Subscription replay failed at entry {index}: {reason}")]
    ReplaySend { index: usize, reason: String },

    #[error("Malformed depth delta: {0}")]
    MalformedDelta(String),

    #[error("Topic {topic} is not registered as a {expected} handler")]
    HandlerMismatch { topic: String, expected: &'static str },

    #[error("Client is closed")]
    Closed,

    #[error("Max reconnection attempts exceeded ({attempts})")]
    ReconnectCapReached { attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl FeedError {
    /// Whether this failure is a link-level problem that warrants replacing the link.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FeedError::Connect(_)
                | FeedError::ConnectTimeout
                | FeedError::Send(_)
                | FeedError::Receive(_)
                | FeedError::Stale { .. }
                | FeedError::Login(_)
                | FeedError::ReplaySend { .. }
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Decode(err.to_string())
    }
}

impl From<prometheus::Error> for FeedError {
    fn from(err: prometheus::Error) -> Self {
        FeedError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
