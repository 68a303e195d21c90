//! Durable local state
//!
//! This module persists the two per-session documents across reloads:
//! - Read-marker map (written promptly; a "mark as read" is user-intentional)
//! - Latest-message snapshot map (debounced; purely a performance cache)
//!
//! Both are opaque JSON files. Corrupt or missing data degrades to an empty
//! map; read and write failures are logged and absorbed, never surfaced.

use crate::store::{ChannelId, LatestSnapshot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

const READ_MARKERS_FILE: &str = "chatsync_read_markers.json";
const LATEST_MESSAGES_FILE: &str = "chatsync_latest_messages.json";

/// State recovered from disk at startup
#[derive(Debug, Default)]
pub struct HydratedState {
    /// Per-channel last-read timestamps
    pub last_read: HashMap<ChannelId, String>,
    /// Per-channel latest-message snapshots
    pub latest_messages: HashMap<ChannelId, LatestSnapshot>,
}

/// Debounced durable read/write of read markers and latest-message snapshots
pub struct PersistenceAdapter {
    read_markers_path: PathBuf,
    latest_path: PathBuf,
    debounce_window: Duration,
    pending_latest: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceAdapter {
    /// Create an adapter persisting into `state_dir`
    pub fn new(state_dir: &Path, debounce_window: Duration) -> Self {
        Self {
            read_markers_path: state_dir.join(READ_MARKERS_FILE),
            latest_path: state_dir.join(LATEST_MESSAGES_FILE),
            debounce_window,
            pending_latest: Mutex::new(None),
        }
    }

    /// Read both documents from disk.
    ///
    /// Missing or corrupt files yield empty maps; this never fails.
    pub fn hydrate(&self) -> HydratedState {
        HydratedState {
            last_read: read_map(&self.read_markers_path),
            latest_messages: read_map(&self.latest_path),
        }
    }

    /// Write the read-marker map promptly.
    ///
    /// Read markers come from an explicit user action and should be durable
    /// right away, so they skip the debounce window.
    pub fn save_read_markers(&self, markers: HashMap<ChannelId, String>) {
        let path = self.read_markers_path.clone();
        tokio::spawn(async move {
            write_map(&path, &markers).await;
        });
    }

    /// Schedule a debounced write of the latest-message snapshot map.
    ///
    /// Rapid successive calls within the quiet window coalesce into one
    /// write; the last scheduled data wins. Data must already be merged
    /// and canonical when scheduled.
    pub fn schedule_save_latest(&self, snapshots: HashMap<ChannelId, LatestSnapshot>) {
        let path = self.latest_path.clone();
        let window = self.debounce_window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            write_map(&path, &snapshots).await;
        });

        let mut pending = self
            .pending_latest
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel any outstanding debounced write without flushing it.
    ///
    /// Used at teardown; the snapshot map is a cache and tolerates loss.
    pub fn cancel_pending(&self) {
        let mut pending = self
            .pending_latest
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }
}

impl Drop for PersistenceAdapter {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

fn read_map<V: DeserializeOwned>(path: &Path) -> HashMap<ChannelId, V> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
            }
            return HashMap::new();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(
                "Discarding corrupt persisted state {}: {}",
                path.display(),
                e
            );
            HashMap::new()
        }
    }
}

async fn write_map<V: Serialize>(path: &Path, map: &HashMap<ChannelId, V>) {
    let json = match serde_json::to_string(map) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Failed to serialize persisted state: {}", e);
            return;
        }
    };

    if let Err(e) = tokio::fs::write(path, json).await {
        tracing::warn!("Failed to write {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ts: &str) -> LatestSnapshot {
        LatestSnapshot {
            ts: Some(ts.to_string()),
            text: Some("hello".to_string()),
            author: Some("alice".to_string()),
            recent_authors: None,
        }
    }

    #[test]
    fn test_hydrate_missing_files_yields_empty_maps() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let adapter = PersistenceAdapter::new(dir.path(), Duration::from_millis(10));

        let hydrated = adapter.hydrate();
        assert!(hydrated.last_read.is_empty());
        assert!(hydrated.latest_messages.is_empty());
    }

    #[test]
    fn test_hydrate_corrupt_files_yields_empty_maps() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::write(dir.path().join(READ_MARKERS_FILE), "{not json")
            .expect("Failed to write");
        std::fs::write(dir.path().join(LATEST_MESSAGES_FILE), "[1,2,3]")
            .expect("Failed to write");

        let adapter = PersistenceAdapter::new(dir.path(), Duration::from_millis(10));
        let hydrated = adapter.hydrate();
        assert!(hydrated.last_read.is_empty());
        assert!(hydrated.latest_messages.is_empty());
    }

    #[tokio::test]
    async fn test_read_markers_round_trip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let adapter = PersistenceAdapter::new(dir.path(), Duration::from_millis(10));

        let mut markers = HashMap::new();
        markers.insert("general:global".to_string(), "2024-01-01T10:00:00.000Z".to_string());
        adapter.save_read_markers(markers);

        // Prompt write: only the spawn itself is asynchronous
        tokio::time::sleep(Duration::from_millis(100)).await;

        let hydrated = adapter.hydrate();
        assert_eq!(
            hydrated.last_read.get("general:global").map(String::as_str),
            Some("2024-01-01T10:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_debounced_latest_write_lands_after_quiet_window() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let adapter = PersistenceAdapter::new(dir.path(), Duration::from_millis(30));

        let mut snapshots = HashMap::new();
        snapshots.insert("c".to_string(), snapshot("2024-01-01T10:00:00.000Z"));
        adapter.schedule_save_latest(snapshots);

        // Before the window elapses nothing is on disk
        assert!(adapter.hydrate().latest_messages.is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let hydrated = adapter.hydrate();
        assert_eq!(
            hydrated.latest_messages.get("c").and_then(|s| s.ts.as_deref()),
            Some("2024-01-01T10:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_rapid_schedules_coalesce_last_write_wins() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let adapter = PersistenceAdapter::new(dir.path(), Duration::from_millis(30));

        let mut first = HashMap::new();
        first.insert("c".to_string(), snapshot("2024-01-01T09:00:00.000Z"));
        adapter.schedule_save_latest(first);

        let mut second = HashMap::new();
        second.insert("c".to_string(), snapshot("2024-01-01T10:00:00.000Z"));
        adapter.schedule_save_latest(second);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let hydrated = adapter.hydrate();
        assert_eq!(
            hydrated.latest_messages.get("c").and_then(|s| s.ts.as_deref()),
            Some("2024-01-01T10:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_drops_the_write() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let adapter = PersistenceAdapter::new(dir.path(), Duration::from_millis(30));

        let mut snapshots = HashMap::new();
        snapshots.insert("c".to_string(), snapshot("2024-01-01T10:00:00.000Z"));
        adapter.schedule_save_latest(snapshots);
        adapter.cancel_pending();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(adapter.hydrate().latest_messages.is_empty());
    }
}
