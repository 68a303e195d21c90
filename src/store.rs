//! Synchronization state store
//!
//! This module holds per-channel chat state including:
//! - Latest-message preview (timestamp, text, author, recent authors)
//! - Unread counts and last-read markers
//! - The registered channel list used to build poll since-maps
//! - A monotonic merge operation folding partial updates from push and poll

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Opaque channel key, e.g. `"general:global"` or `"event:<uuid>"`
pub type ChannelId = String;

/// A message author, used for avatar stacks and previews
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    /// Stable author identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Avatar image URL, if the author has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Per-channel synchronization state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Timestamp of the most recent known message (ISO 8601)
    pub latest_timestamp: Option<String>,
    /// Preview text of the most recent message, best-effort
    pub latest_text: Option<String>,
    /// Author name of the most recent message, best-effort
    pub latest_author: Option<String>,
    /// Small list of recent distinct senders
    pub recent_authors: Option<Vec<Author>>,
    /// Set only by an explicit "mark as read"
    pub last_read_timestamp: Option<String>,
    /// Number of unread messages
    pub unread_count: u32,
    /// New content exists but full content has not been fetched yet
    pub pending_refresh: bool,
}

impl ChannelState {
    /// Whether this channel has messages newer than the last-read marker
    pub fn has_unread(&self) -> bool {
        match (&self.latest_timestamp, &self.last_read_timestamp) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(latest), Some(read)) => latest.as_str() > read.as_str(),
        }
    }
}

/// A partial incoming update for one channel.
///
/// Both the push transport and the fallback poller produce these; missing
/// fields mean "no information", never "clear".
#[derive(Debug, Clone, Default)]
pub struct MessageCandidate {
    /// Timestamp of the update (ISO 8601)
    pub ts: String,
    /// Preview text, if the source carries one
    pub text: Option<String>,
    /// Author name, if the source carries one
    pub author: Option<String>,
    /// Recent distinct senders, if the source carries them
    pub recent_authors: Option<Vec<Author>>,
}

/// Persisted latest-message snapshot for one channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestSnapshot {
    /// Timestamp of the most recent known message
    pub ts: Option<String>,
    /// Preview text
    pub text: Option<String>,
    /// Author name
    pub author: Option<String>,
    /// Recent distinct senders
    pub recent_authors: Option<Vec<Author>>,
}

struct StoreInner {
    channels: HashMap<ChannelId, ChannelState>,
    registered: Vec<ChannelId>,
}

/// Single source of truth for per-channel chat state.
///
/// Constructed once per session and shared by reference between the
/// connection manager and the fallback poller (the only writers) and
/// arbitrary UI readers. All methods take `&self`; mutation is guarded by
/// an internal mutex.
pub struct SyncStateStore {
    inner: Mutex<StoreInner>,
}

impl SyncStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                channels: HashMap::new(),
                registered: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A poisoned lock only means a panic elsewhere; the state itself
        // is still coherent (every mutation completes under the guard).
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the store from persisted read markers and latest snapshots.
    ///
    /// Called once at startup before any producer runs.
    pub fn hydrate(
        &self,
        last_read: HashMap<ChannelId, String>,
        latest: HashMap<ChannelId, LatestSnapshot>,
    ) {
        let mut inner = self.lock();
        for (id, ts) in last_read {
            inner.channels.entry(id).or_default().last_read_timestamp = Some(ts);
        }
        for (id, snap) in latest {
            let state = inner.channels.entry(id).or_default();
            state.latest_timestamp = snap.ts;
            state.latest_text = snap.text;
            state.latest_author = snap.author;
            state.recent_authors = snap.recent_authors;
        }
    }

    /// Fold a partial update into a channel's state.
    ///
    /// The merge never decreases `latest_timestamp` and never erases
    /// `recent_authors`/`latest_text` the current state has but the
    /// candidate lacks. An older or equal candidate may still contribute
    /// `recent_authors` when the current state has none (the poller's
    /// author-only refresh path relies on this).
    ///
    /// Returns whether visible state changed, so callers can skip
    /// persistence scheduling and renders for no-op updates.
    pub fn merge_update(&self, channel_id: &str, candidate: MessageCandidate) -> bool {
        let mut inner = self.lock();
        let state = inner.channels.entry(channel_id.to_string()).or_default();

        let newer = match &state.latest_timestamp {
            None => true,
            Some(current) => candidate.ts.as_str() > current.as_str(),
        };

        let mut changed = false;
        if newer {
            state.latest_timestamp = Some(candidate.ts);
            if candidate.text.is_some() {
                state.latest_text = candidate.text;
            }
            if candidate.author.is_some() {
                state.latest_author = candidate.author;
            }
            if matches!(&candidate.recent_authors, Some(list) if !list.is_empty()) {
                state.recent_authors = candidate.recent_authors;
            }
            changed = true;
        } else if state.recent_authors.is_none() {
            // Stale candidate: only backfill authors, never touch the preview
            if let Some(list) = candidate.recent_authors {
                if !list.is_empty() {
                    state.recent_authors = Some(list);
                    changed = true;
                }
            }
        }

        if changed {
            tracing::debug!("Merged update into channel {}", channel_id);
        }
        changed
    }

    /// Set a channel's unread count absolutely; no-op if unchanged
    pub fn set_unread_count(&self, channel_id: &str, count: u32) -> bool {
        let mut inner = self.lock();
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        if state.unread_count == count {
            return false;
        }
        state.unread_count = count;
        true
    }

    /// Increment a channel's unread count by one.
    ///
    /// Used for push-delivered single-message events where no aggregate
    /// count is available. The bump is unconditional: it applies even when
    /// the accompanying timestamp loses the merge.
    pub fn bump_unread_count(&self, channel_id: &str) {
        let mut inner = self.lock();
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        state.unread_count = state.unread_count.saturating_add(1);
    }

    /// Mark a channel as read: set the read marker to now, zero the count
    pub fn mark_read(&self, channel_id: &str) {
        let now = crate::now_iso8601();
        let mut inner = self.lock();
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        state.last_read_timestamp = Some(now);
        state.unread_count = 0;
        tracing::debug!("Marked channel {} as read", channel_id);
    }

    /// Set or clear a channel's pending-refresh flag
    pub fn mark_pending_refresh(&self, channel_id: &str, pending: bool) {
        let mut inner = self.lock();
        let state = inner.channels.entry(channel_id.to_string()).or_default();
        state.pending_refresh = pending;
    }

    /// Whether a channel has messages newer than its last-read marker
    pub fn has_unread(&self, channel_id: &str) -> bool {
        let inner = self.lock();
        inner.channels.get(channel_id).is_some_and(ChannelState::has_unread)
    }

    /// Sum of unread counts over all channels
    pub fn total_unread(&self) -> u32 {
        let inner = self.lock();
        inner
            .channels
            .values()
            .fold(0u32, |acc, s| acc.saturating_add(s.unread_count))
    }

    /// Replace the known channel list used for since-maps.
    ///
    /// Historical channel state is never removed; a channel absent from the
    /// new list simply stops being polled.
    pub fn register_channels(&self, ids: Vec<ChannelId>) {
        let mut inner = self.lock();
        for id in &ids {
            inner.channels.entry(id.clone()).or_default();
        }
        inner.registered = ids;
    }

    /// The currently registered channel list
    pub fn registered_channels(&self) -> Vec<ChannelId> {
        self.lock().registered.clone()
    }

    /// A copy of one channel's state, if it exists
    pub fn snapshot(&self, channel_id: &str) -> Option<ChannelState> {
        self.lock().channels.get(channel_id).cloned()
    }

    /// All read markers, for persistence
    pub fn read_markers(&self) -> HashMap<ChannelId, String> {
        let inner = self.lock();
        inner
            .channels
            .iter()
            .filter_map(|(id, s)| {
                s.last_read_timestamp.clone().map(|ts| (id.clone(), ts))
            })
            .collect()
    }

    /// All latest-message snapshots, for persistence
    pub fn latest_snapshots(&self) -> HashMap<ChannelId, LatestSnapshot> {
        let inner = self.lock();
        inner
            .channels
            .iter()
            .filter(|(_, s)| s.latest_timestamp.is_some())
            .map(|(id, s)| {
                (
                    id.clone(),
                    LatestSnapshot {
                        ts: s.latest_timestamp.clone(),
                        text: s.latest_text.clone(),
                        author: s.latest_author.clone(),
                        recent_authors: s.recent_authors.clone(),
                    },
                )
            })
            .collect()
    }
}

impl Default for SyncStateStore {
    fn default() -> Self {
        Self::new()
    }
}
