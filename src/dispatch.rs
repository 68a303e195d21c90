//! Message dispatcher
//!
//! Per-channel publish/subscribe registry that fans out full inbound
//! envelopes to UI subscribers. Intentionally decoupled from the state
//! store: subscribers here want message content (to render a chat bubble),
//! not unread bookkeeping.

use crate::protocol::InboundFrame;
use crate::store::ChannelId;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

struct Registry {
    channels: Mutex<HashMap<ChannelId, HashMap<u64, Callback>>>,
}

impl Registry {
    fn remove(&self, channel: &str, id: u64) {
        let mut channels = lock(&self.channels);
        let now_empty = match channels.get_mut(channel) {
            Some(subs) => {
                subs.remove(&id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            channels.remove(channel);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for an active subscription.
///
/// Dropping the handle (or calling [`Subscription::unsubscribe`]) removes
/// the callback from the registry.
pub struct Subscription {
    registry: Weak<Registry>,
    channel: ChannelId,
    id: u64,
}

impl Subscription {
    /// Remove this subscription from the registry
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.channel, self.id);
        }
    }
}

/// Per-channel fan-out of inbound envelopes to independent subscribers.
///
/// Multiple subscribers per channel are supported (a chat panel and a
/// notification badge can listen to the same channel). Each callback
/// invocation is isolated: a panicking callback never prevents delivery
/// to the remaining callbacks.
pub struct MessageDispatcher {
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl MessageDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                channels: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for full inbound envelopes on a channel
    pub fn subscribe<F>(&self, channel_id: &str, callback: F) -> Subscription
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = lock(&self.registry.channels);
        channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(id, Arc::new(callback));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            channel: channel_id.to_string(),
            id,
        }
    }

    /// Invoke every registered callback for a channel with the envelope
    pub fn dispatch(&self, channel_id: &str, envelope: &InboundFrame) {
        // Snapshot the callbacks so subscribers may (un)subscribe from
        // within their own callback without deadlocking
        let callbacks: Vec<Callback> = {
            let channels = lock(&self.registry.channels);
            match channels.get(channel_id) {
                Some(subs) => subs.values().cloned().collect(),
                None => return,
            }
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(envelope))).is_err() {
                tracing::warn!("Subscriber callback for {} panicked", channel_id);
            }
        }
    }

    /// Number of active subscriptions on a channel
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        lock(&self.registry.channels)
            .get(channel_id)
            .map_or(0, HashMap::len)
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn envelope(chat_id: &str) -> InboundFrame {
        InboundFrame::MessageDeleted {
            chat_id: chat_id.to_string(),
            comment_id: "c1".to_string(),
        }
    }

    #[test]
    fn test_dispatch_reaches_all_subscribers() {
        let dispatcher = MessageDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let _s1 = dispatcher.subscribe("c", move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = dispatcher.subscribe("c", move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch("c", &envelope("c"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_is_scoped_to_channel() {
        let dispatcher = MessageDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let _sub = dispatcher.subscribe("a", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch("b", &envelope("b"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = MessageDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = dispatcher.subscribe("c", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.subscriber_count("c"), 1);

        sub.unsubscribe();
        assert_eq!(dispatcher.subscriber_count("c"), 0);

        dispatcher.dispatch("c", &envelope("c"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let dispatcher = MessageDispatcher::new();
        {
            let _sub = dispatcher.subscribe("c", |_| {});
            assert_eq!(dispatcher.subscriber_count("c"), 1);
        }
        assert_eq!(dispatcher.subscriber_count("c"), 0);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let dispatcher = MessageDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = dispatcher.subscribe("c", |_| {
            panic!("subscriber bug");
        });
        let h = hits.clone();
        let _good = dispatcher.subscribe("c", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch("c", &envelope("c"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_to_channel_without_subscribers() {
        let dispatcher = MessageDispatcher::new();
        // Must not panic or allocate registry entries
        dispatcher.dispatch("nobody", &envelope("nobody"));
        assert_eq!(dispatcher.subscriber_count("nobody"), 0);
    }
}
