//! Synchronization configuration
//!
//! Plain-data settings for the sync core: endpoints, poll cadence,
//! persistence debounce window, and reconnect backoff bounds.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Since-map value used for channels that have never produced any signal.
///
/// Fixed-width RFC 3339 with milliseconds so it compares lexicographically
/// below every real timestamp the library stores.
pub const FALLBACK_EPOCH: &str = "1970-01-01T00:00:00.000Z";

/// Configuration for the chat synchronization core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Websocket endpoint for the push channel
    pub ws_url: String,
    /// REST endpoint for the batched delta-summary poll (`POST /comments/check`)
    pub check_url: String,
    /// Interval between fallback polls
    pub poll_interval: Duration,
    /// Quiet window for debounced latest-message snapshot writes
    pub debounce_window: Duration,
    /// Initial reconnect backoff delay
    pub backoff_initial: Duration,
    /// Maximum reconnect backoff delay
    pub backoff_max: Duration,
    /// Directory holding the persisted read-marker and snapshot documents
    pub state_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://localhost/chat/ws".to_string(),
            check_url: "https://localhost/comments/check".to_string(),
            poll_interval: Duration::from_secs(20),
            debounce_window: Duration::from_millis(800),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            state_dir: PathBuf::from("."),
        }
    }
}
