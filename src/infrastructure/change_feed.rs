use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTable {
    Votes,
    Participants,
    Trip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub trip_id: String,
    pub table: ChangeTable,
    pub kind: ChangeKind,
    /// User whose row changed, when the backend reports one.
    pub actor: Option<String>,
}

/// Push feed of row changes scoped to one trip.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, trip_id: &str) -> Result<Subscription, InfraError>;
}

/// Receiving end of a feed subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    _guard: UnsubscribeGuard,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<ChangeEvent>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            _guard: UnsubscribeGuard {
                unsubscribe: Some(Box::new(unsubscribe)),
            },
        }
    }

    /// `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

struct UnsubscribeGuard {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// For backends without push delivery; the engine falls back to polling.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledChangeFeed;

#[async_trait]
impl ChangeFeed for DisabledChangeFeed {
    async fn subscribe(&self, trip_id: &str) -> Result<Subscription, InfraError> {
        Err(InfraError::Subscription(format!(
            "push delivery is not configured for trip {trip_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn dropping_subscription_runs_unsubscribe() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&unsubscribed);
        let mut subscription = Subscription::new(receiver, move || flag.store(true, Ordering::SeqCst));

        sender
            .send(ChangeEvent {
                trip_id: "trip-1".to_string(),
                table: ChangeTable::Votes,
                kind: ChangeKind::Insert,
                actor: Some("user-a".to_string()),
            })
            .expect("send event");
        let event = subscription.recv().await.expect("event delivered");
        assert_eq!(event.table, ChangeTable::Votes);

        drop(subscription);
        assert!(unsubscribed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disabled_feed_refuses_subscription() {
        let result = DisabledChangeFeed.subscribe("trip-1").await;
        assert!(matches!(result, Err(InfraError::Subscription(_))));
    }
}
