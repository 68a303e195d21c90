//! Fallback poller
//!
//! Periodic pull path used whenever the push channel is not confirmed live:
//! - Builds a since-map from the registered channel list and store state
//! - Issues one batched `POST /comments/check` request
//! - Folds the delta summaries back into the state store
//!
//! Polling is at-least-once and best-effort: a failed request is swallowed
//! and the next tick retries.

use crate::config::FALLBACK_EPOCH;
use crate::persist::PersistenceAdapter;
use crate::store::{Author, ChannelId, MessageCandidate, SyncStateStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Request body for the check endpoint
#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    chats: &'a HashMap<ChannelId, String>,
}

/// Per-channel delta summary returned by the check endpoint.
///
/// Channels with no new activity since the given timestamp are simply
/// absent from the response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSummary {
    /// Timestamp of the most recent message (ISO 8601)
    pub latest: String,
    /// Number of messages since the since-map value
    pub count: u32,
    /// Recent distinct senders
    #[serde(default)]
    pub authors: Vec<Author>,
    /// Preview text of the most recent message
    #[serde(default)]
    pub text: Option<String>,
    /// Author name of the most recent message
    #[serde(default)]
    pub author: Option<String>,
}

/// A since-map plus the channels queried in author-only refresh mode
#[derive(Debug, Default)]
pub struct SinceMap {
    /// Per-channel "tell me about activity after this time" values
    pub since: HashMap<ChannelId, String>,
    /// Channels whose since-value was overridden to the fallback epoch
    /// purely to backfill `recent_authors`
    pub author_only: HashSet<ChannelId>,
}

/// Periodic pull fallback feeding the state store.
///
/// Started by the connection manager while the push channel is down and
/// stopped once a subscription is confirmed live.
pub struct FallbackPoller {
    client: reqwest::Client,
    check_url: String,
    interval: Duration,
    store: Arc<SyncStateStore>,
    persist: Arc<PersistenceAdapter>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackPoller {
    /// Create a poller against the given check endpoint
    pub fn new(
        check_url: String,
        interval: Duration,
        store: Arc<SyncStateStore>,
        persist: Arc<PersistenceAdapter>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            check_url,
            interval,
            store,
            persist,
            task: Mutex::new(None),
        }
    }

    /// Build the since-map for the currently registered channels.
    ///
    /// For each channel: the store's latest timestamp if known, else the
    /// last-read marker, else the fallback epoch so a channel that has never
    /// produced any signal still gets its history bootstrapped. A channel
    /// with a timestamp but no `recent_authors` is queried from the epoch in
    /// author-only mode so avatar data can be backfilled without producing a
    /// duplicate-unread false positive.
    pub fn build_since_map(store: &SyncStateStore) -> SinceMap {
        let mut map = SinceMap::default();
        for id in store.registered_channels() {
            let state = store.snapshot(&id).unwrap_or_default();
            let since = match (&state.latest_timestamp, &state.last_read_timestamp) {
                (Some(latest), _) => {
                    if state.recent_authors.is_none() {
                        map.author_only.insert(id.clone());
                        FALLBACK_EPOCH.to_string()
                    } else {
                        latest.clone()
                    }
                }
                (None, Some(read)) => read.clone(),
                (None, None) => FALLBACK_EPOCH.to_string(),
            };
            map.since.insert(id, since);
        }
        map
    }

    /// Run one poll cycle: build the since-map, query the endpoint, apply
    /// the response. Failures are logged and swallowed.
    pub async fn poll(&self) {
        let map = Self::build_since_map(&self.store);
        if map.since.is_empty() {
            return;
        }

        let response = self
            .client
            .post(&self.check_url)
            .json(&CheckRequest { chats: &map.since })
            .send()
            .await;

        let summaries: HashMap<ChannelId, ChannelSummary> = match response {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!("Discarding unreadable poll response: {}", e);
                    return;
                }
            },
            Ok(resp) => {
                tracing::debug!("Poll returned status {}", resp.status());
                return;
            }
            Err(e) => {
                tracing::debug!("Poll request failed: {}", e);
                return;
            }
        };

        self.apply_response(summaries, &map.author_only);
    }

    /// Fold a poll response into the store.
    ///
    /// Channels queried in author-only mode contribute only their author
    /// list; everything else merges the summary, adopts the returned count
    /// and flags the channel for a full-content refresh.
    pub fn apply_response(
        &self,
        summaries: HashMap<ChannelId, ChannelSummary>,
        author_only: &HashSet<ChannelId>,
    ) {
        let mut changed = false;
        for (id, summary) in summaries {
            if author_only.contains(&id) {
                // The epoch timestamp always loses the merge, so only the
                // missing author list can be adopted
                let backfill = MessageCandidate {
                    ts: FALLBACK_EPOCH.to_string(),
                    recent_authors: Some(summary.authors),
                    ..Default::default()
                };
                changed |= self.store.merge_update(&id, backfill);
                continue;
            }

            let candidate = MessageCandidate {
                ts: summary.latest,
                text: summary.text,
                author: summary.author,
                recent_authors: if summary.authors.is_empty() {
                    None
                } else {
                    Some(summary.authors)
                },
            };
            changed |= self.store.merge_update(&id, candidate);
            changed |= self.store.set_unread_count(&id, summary.count);
            self.store.mark_pending_refresh(&id, true);
        }

        if changed {
            self.persist.schedule_save_latest(self.store.latest_snapshots());
        }
    }

    /// Start the poll interval. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        tracing::info!("Starting fallback poller (every {:?})", self.interval);
        let poller = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately
            loop {
                ticker.tick().await;
                poller.poll().await;
            }
        }));
    }

    /// Stop the poll interval. No-op if not running.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            tracing::info!("Stopped fallback poller");
        }
    }

    /// Whether the poll interval is currently running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Trigger one immediate poll outside the interval schedule.
    ///
    /// Used as the catch-up poll when a subscription is confirmed, bridging
    /// the gap between the last successful sync and the subscription ack.
    pub fn poll_now(self: &Arc<Self>) {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.poll().await;
        });
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
