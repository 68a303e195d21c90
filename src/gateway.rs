//! Send gateway
//!
//! Single-slot handle to the live push transport's outbound queue. Callers
//! attempt to transmit here first; a `false` return means no transport is
//! available and the caller should fall back to its REST write endpoint.

use crate::protocol::OutboundFrame;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Gateway through which any caller can transmit over the push channel.
///
/// Only one transport registration is active at a time; the connection
/// manager registers its writer queue on open and clears it on close.
/// [`SendGateway::send`] never errors.
pub struct SendGateway {
    slot: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
}

impl SendGateway {
    /// Create a gateway with no transport registered
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<OutboundFrame>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the active transport's outbound queue, replacing any
    /// previous registration
    pub fn register(&self, sender: mpsc::UnboundedSender<OutboundFrame>) {
        *self.lock() = Some(sender);
        tracing::debug!("Send gateway registered");
    }

    /// Remove the active registration, if any
    pub fn clear(&self) {
        *self.lock() = None;
        tracing::debug!("Send gateway cleared");
    }

    /// Whether a transport is currently registered
    pub fn is_registered(&self) -> bool {
        self.lock().is_some()
    }

    /// Queue a frame for transmission over the push channel.
    ///
    /// Returns `true` if a transport is registered and accepted the frame,
    /// `false` otherwise — the caller then uses its REST fallback. A dead
    /// writer queue is treated the same as no registration and is cleared.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(sender) => {
                if sender.send(frame).is_ok() {
                    true
                } else {
                    // Writer task is gone; drop the stale registration
                    *slot = None;
                    false
                }
            }
            None => false,
        }
    }
}

impl Default for SendGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> OutboundFrame {
        OutboundFrame::subscribe(vec!["general:global".to_string()])
    }

    #[test]
    fn test_send_without_registration_returns_false() {
        let gateway = SendGateway::new();
        assert!(!gateway.is_registered());
        assert!(!gateway.send(frame()));
    }

    #[test]
    fn test_send_with_registration_delivers() {
        let gateway = SendGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.register(tx);

        assert!(gateway.is_registered());
        assert!(gateway.send(frame()));
        assert_eq!(rx.try_recv().expect("frame queued"), frame());
    }

    #[test]
    fn test_clear_removes_registration() {
        let gateway = SendGateway::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        gateway.register(tx);
        gateway.clear();

        assert!(!gateway.is_registered());
        assert!(!gateway.send(frame()));
    }

    #[test]
    fn test_dead_writer_queue_counts_as_unregistered() {
        let gateway = SendGateway::new();
        let (tx, rx) = mpsc::unbounded_channel();
        gateway.register(tx);
        drop(rx);

        assert!(!gateway.send(frame()));
        assert!(!gateway.is_registered());
    }

    #[test]
    fn test_new_registration_replaces_old() {
        let gateway = SendGateway::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        gateway.register(tx1);
        gateway.register(tx2);

        assert!(gateway.send(frame()));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().expect("frame queued"), frame());
    }
}
