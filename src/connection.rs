//! Connection manager
//!
//! Owns the push-channel lifecycle: connect, authenticate, subscribe,
//! receive, reconnect with exponential backoff. Coordinates the handoff
//! with the fallback poller (stopped while the push channel is confirmed
//! live, running while it is not) and registers the send gateway while a
//! transport is open.

use crate::config::SyncConfig;
use crate::dispatch::MessageDispatcher;
use crate::gateway::SendGateway;
use crate::persist::PersistenceAdapter;
use crate::poller::FallbackPoller;
use crate::protocol::{InboundFrame, OutboundFrame};
use crate::store::{MessageCandidate, SyncStateStore};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Lifecycle state of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No credential present; no connection is attempted
    Idle,
    /// Transport handshake in progress
    Connecting,
    /// Transport open, subscription not yet acknowledged
    Open,
    /// Server acknowledged the subscription; push is live
    Subscribed,
    /// Transport closed or errored; reconnect pending
    Closed,
    /// Torn down; terminal
    Stopped,
}

/// Exponential reconnect backoff: successive delays double from the
/// initial value up to a cap, and reset after a successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Take the current delay and double it for next time, up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Inner {
    config: SyncConfig,
    credential: Mutex<Option<String>>,
    credential_notify: Notify,
    store: Arc<SyncStateStore>,
    dispatcher: Arc<MessageDispatcher>,
    gateway: Arc<SendGateway>,
    poller: Arc<FallbackPoller>,
    persist: Arc<PersistenceAdapter>,
    state: Mutex<ConnectionState>,
    backoff: Mutex<Backoff>,
    shutdown: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// On entry to `Closed`: release the gateway, revive the poller
    fn enter_closed(&self) {
        self.gateway.clear();
        self.poller.start();
        self.set_state(ConnectionState::Closed);
    }

    /// Apply one inbound envelope. Frames are acted on only while the
    /// transport is open; anything arriving outside that window is dropped.
    fn handle_frame(self: &Arc<Self>, frame: InboundFrame) {
        if !matches!(
            self.state(),
            ConnectionState::Open | ConnectionState::Subscribed
        ) {
            tracing::debug!("Dropping frame received outside an open session");
            return;
        }

        match frame {
            InboundFrame::Subscribed => {
                self.set_state(ConnectionState::Subscribed);
                tracing::info!("Push subscription confirmed");
                // Push is live: stop polling, then bridge the gap between
                // the last successful sync and the subscription ack
                self.poller.stop();
                self.poller.poll_now();
            }
            InboundFrame::NewMessage {
                ref chat_id,
                ref latest,
                ref text,
                ref author,
                ref comment,
            } => {
                // The bump is unconditional, even when the carried
                // timestamp loses the merge below
                self.store.bump_unread_count(chat_id);
                let changed = self.store.merge_update(
                    chat_id,
                    MessageCandidate {
                        ts: latest.clone(),
                        text: text.clone(),
                        author: author.clone(),
                        recent_authors: None,
                    },
                );
                if changed {
                    self.persist
                        .schedule_save_latest(self.store.latest_snapshots());
                }

                if comment.is_some() {
                    self.dispatcher.dispatch(chat_id, &frame);
                } else {
                    // Lightweight notification: a collaborator fetches the
                    // full content over REST
                    self.store.mark_pending_refresh(chat_id, true);
                }
            }
            InboundFrame::MessageUpdated { ref chat_id, .. }
            | InboundFrame::MessageDeleted { ref chat_id, .. }
            | InboundFrame::ReactionUpdated { ref chat_id, .. }
            | InboundFrame::MessageSent { ref chat_id, .. } => {
                // No store mutation: these do not change latest-message
                // bookkeeping
                self.dispatcher.dispatch(chat_id, &frame);
            }
        }
    }

    /// Drive one open websocket session until it closes or errors
    async fn run_session<S>(self: &Arc<Self>, ws: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        lock(&self.backoff).reset();
        self.set_state(ConnectionState::Open);
        tracing::info!("Push channel open");

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.gateway.register(tx);

        // Subscribe with the channel list as registered right now; later
        // channel-list changes go through resubscribe() on the same socket
        self.gateway
            .send(OutboundFrame::subscribe(self.store.registered_channels()));

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        let json = match frame.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::warn!("Failed to encode outbound frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            tracing::debug!("Push send failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match InboundFrame::from_json(&text) {
                        Ok(frame) => self.handle_frame(frame),
                        Err(e) => tracing::debug!("Dropping malformed frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Push channel closed by server");
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(e)) => {
                        tracing::debug!("Push receive failed: {}", e);
                        break;
                    }
                },
            }
            if self.is_shutdown() {
                break;
            }
        }
    }
}

/// Reconnecting push-channel owner.
///
/// Constructed once per session with shared handles to the store,
/// dispatcher, gateway, poller and persistence; [`ConnectionManager::start`]
/// spawns the connect/reconnect loop. Time-varying inputs (credential,
/// registered channel list) are re-read from those handles on every use,
/// never captured at setup.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager; no connection is attempted until [`Self::start`]
    pub fn new(
        config: SyncConfig,
        store: Arc<SyncStateStore>,
        dispatcher: Arc<MessageDispatcher>,
        gateway: Arc<SendGateway>,
        poller: Arc<FallbackPoller>,
        persist: Arc<PersistenceAdapter>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            inner: Arc::new(Inner {
                config,
                credential: Mutex::new(None),
                credential_notify: Notify::new(),
                store,
                dispatcher,
                gateway,
                poller,
                persist,
                state: Mutex::new(ConnectionState::Idle),
                backoff: Mutex::new(backoff),
                shutdown: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Set or clear the authentication credential.
    ///
    /// Providing a credential wakes the connect loop out of `Idle`.
    /// Clearing it prevents future reconnects; a logged-out session should
    /// call [`Self::teardown`] as well to drop the live transport.
    pub fn set_credential(&self, credential: Option<String>) {
        let has_credential = credential.is_some();
        *lock(&self.inner.credential) = credential;
        if has_credential {
            self.inner.credential_notify.notify_one();
        }
    }

    /// Spawn the connect/reconnect loop. No-op if already started or torn
    /// down. The fallback poller covers sync until a subscription is live.
    pub fn start(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        let mut task = lock(&self.inner.task);
        if task.is_some() {
            return;
        }

        self.inner.poller.start();
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run(inner)));
    }

    /// Send a fresh subscribe frame listing the currently registered
    /// channels over the live transport.
    ///
    /// Used when the channel list changes (e.g. the user registers for a
    /// new event); the connection itself is left alone. Returns `false`
    /// when no transport is live, in which case the next connect will
    /// subscribe with the current list anyway.
    pub fn resubscribe(&self) -> bool {
        self.inner
            .gateway
            .send(OutboundFrame::subscribe(self.inner.store.registered_channels()))
    }

    /// Tear the component down: close the transport, cancel all timers,
    /// release the gateway, stop the poller. Idempotent and terminal.
    pub fn teardown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.inner.task).take() {
            // Dropping the loop also drops the socket and any pending
            // reconnect sleep
            task.abort();
        }
        self.inner.gateway.clear();
        self.inner.poller.stop();
        self.inner.persist.cancel_pending();
        self.inner.set_state(ConnectionState::Stopped);
        tracing::info!("Connection manager torn down");
    }

    #[cfg(test)]
    pub(crate) fn handle_frame(&self, frame: InboundFrame) {
        self.inner.handle_frame(frame);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.inner.set_state(state);
    }

    #[cfg(test)]
    pub(crate) fn next_backoff_delay(&self) -> Duration {
        lock(&self.inner.backoff).next_delay()
    }

    #[cfg(test)]
    pub(crate) fn reset_backoff(&self) {
        lock(&self.inner.backoff).reset();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Connect/reconnect loop: gated on the credential, doubling the backoff
/// delay after every close and resetting it on a successful open.
async fn run(inner: Arc<Inner>) {
    loop {
        if inner.is_shutdown() {
            break;
        }

        // Re-read the credential every attempt; it may have arrived or
        // changed since the last one
        let credential = lock(&inner.credential).clone();
        let Some(credential) = credential else {
            inner.set_state(ConnectionState::Idle);
            inner.credential_notify.notified().await;
            continue;
        };

        inner.set_state(ConnectionState::Connecting);
        let url = format!("{}?token={}", inner.config.ws_url, credential);
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => inner.run_session(ws).await,
            Err(e) => tracing::debug!("Push connect failed: {}", e),
        }

        if inner.is_shutdown() {
            break;
        }
        inner.enter_closed();
        let delay = lock(&inner.backoff).next_delay();
        tracing::debug!("Reconnecting push channel in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_resets_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
