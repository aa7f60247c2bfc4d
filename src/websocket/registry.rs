//! Subscription registry
//!
//! Append-only log of subscribe payloads, replayed verbatim on every new link.

use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::link::Link;
use crate::error::{FeedError, Result};

/// Ordered log of previously issued subscribe requests
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<Message>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload; returns its replay position
    pub async fn record(&self, payload: Message) -> usize {
        let mut entries = self.entries.lock().await;
        entries.push(payload);
        entries.len() - 1
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of the log in replay order
    pub async fn entries(&self) -> Vec<Message> {
        self.entries.lock().await.clone()
    }

    /// Send every payload over `link` in recording order.
    ///
    /// Stops at the first failed write; a partial replay is an error and the
    /// link must be replaced.
    pub async fn replay(&self, link: &Link) -> Result<usize> {
        let entries = self.entries().await;
        let total = entries.len();

        for (index, payload) in entries.into_iter().enumerate() {
            debug!(index, total, "Replaying subscription");
            if let Err(e) = link.send(payload).await {
                warn!(index, total, error = %e, "Subscription replay failed");
                return Err(FeedError::ReplaySend {
                    index,
                    reason: e.to_string(),
                });
            }
        }

        if total > 0 {
            info!(count = total, url = %link.url(), "Subscriptions replayed");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::link::testing::channel_link;
    use tokio::sync::mpsc;

    /// Link whose writes land in a channel; writes after `budget` fail
    fn recording_link(budget: usize) -> (Link, mpsc::UnboundedReceiver<Message>) {
        let (link, rx, _inbound) = channel_link(budget);
        (link, rx)
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_replay_preserves_order_every_time() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.record(text("A")).await, 0);
        assert_eq!(registry.record(text("B")).await, 1);
        assert_eq!(registry.record(text("C")).await, 2);

        for _ in 0..3 {
            let (link, mut rx) = recording_link(usize::MAX);
            assert_eq!(registry.replay(&link).await.unwrap(), 3);
            drop(link);

            let mut replayed = Vec::new();
            while let Some(message) = rx.recv().await {
                replayed.push(message);
            }
            assert_eq!(replayed, vec![text("A"), text("B"), text("C")]);
        }
    }

    #[tokio::test]
    async fn test_partial_replay_is_an_error() {
        let registry = SubscriptionRegistry::new();
        registry.record(text("A")).await;
        registry.record(text("B")).await;
        registry.record(text("C")).await;

        let (link, mut rx) = recording_link(1);
        let err = registry.replay(&link).await.unwrap_err();
        assert!(matches!(err, FeedError::ReplaySend { index: 1, .. }));
        assert!(err.is_transport());

        assert_eq!(rx.recv().await, Some(text("A")));
        assert!(rx.try_recv().is_err());
        // the log itself is untouched
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_empty_registry_replays_nothing() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty().await);
        let (link, _rx) = recording_link(0);
        assert_eq!(registry.replay(&link).await.unwrap(), 0);
    }
}
