//! Chatsync - real-time chat synchronization core
//!
//! This library keeps per-channel "latest message" and "unread" state
//! consistent across an unreliable websocket push channel and a periodic
//! REST pull fallback, while multiple UI surfaces subscribe to the same
//! channels concurrently.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod gateway;
pub mod persist;
pub mod poller;
pub mod protocol;
pub mod store;

#[cfg(test)]
mod tests;

/// Result type alias for chatsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for chatsync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Push transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Poll endpoint error
    #[error("Poll error: {0}")]
    Poll(String),

    /// Persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize the chatsync library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

/// Render the current UTC time as a fixed-width RFC 3339 string.
///
/// All timestamps the library generates use this format so that
/// lexicographic comparison agrees with chronological order.
pub(crate) fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
