use crate::{Error, Result, SessionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    LockAcquired,
    LockReleased,
    LockConflict,
    LeaseJeopardy,
    ContentInvalidated,
    SessionExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTarget {
    Lock(String),
    Session(SessionId),
}

impl EventTarget {
    pub fn lock_name(&self) -> Option<&str> {
        match self {
            EventTarget::Lock(name) => Some(name),
            EventTarget::Session(_) => None,
        }
    }
}

/// A delivered notification. `sequence` is assigned per subscriber at
/// enqueue time and is strictly increasing within one subscriber's queue,
/// which lets a client detect gaps and deduplicate after reconnecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub target: EventTarget,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct SubscriberQueue {
    tx: mpsc::Sender<Event>,
    next_seq: AtomicU64,
}

/// Fans events out to per-session ordered queues.
///
/// Each queue is bounded and drained independently: a subscriber that stops
/// polling overflows its own queue (the event is dropped with a warning)
/// and never blocks the dispatch path or other subscribers. Queues survive
/// jeopardy and are discarded only when the owning session expires.
#[derive(Debug)]
pub struct EventDispatcher {
    queues: DashMap<SessionId, SubscriberQueue>,
    receivers: DashMap<SessionId, Arc<Mutex<mpsc::Receiver<Event>>>>,
    subscriptions: DashMap<String, HashSet<SessionId>>,
    queue_depth: usize,
}

impl EventDispatcher {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queues: DashMap::new(),
            receivers: DashMap::new(),
            subscriptions: DashMap::new(),
            queue_depth,
        }
    }

    /// Create the delivery queue for a freshly opened session.
    pub fn register(&self, session: SessionId) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.queues.insert(
            session,
            SubscriberQueue {
                tx,
                next_seq: AtomicU64::new(1),
            },
        );
        self.receivers.insert(session, Arc::new(Mutex::new(rx)));
    }

    /// Drop the session's queue and all of its subscriptions. An in-flight
    /// `poll` observes the closed channel and fails with `SessionExpired`.
    pub fn unregister(&self, session: SessionId) {
        self.queues.remove(&session);
        self.receivers.remove(&session);
        for mut entry in self.subscriptions.iter_mut() {
            entry.value_mut().remove(&session);
        }
    }

    pub fn subscribe(&self, session: SessionId, name: &str) {
        self.subscriptions
            .entry(name.to_string())
            .or_default()
            .insert(session);
    }

    pub fn unsubscribe(&self, session: SessionId, name: &str) {
        if let Some(mut subs) = self.subscriptions.get_mut(name) {
            subs.remove(&session);
        }
    }

    pub fn subscribers_of(&self, name: &str) -> Vec<SessionId> {
        self.subscriptions
            .get(name)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Enqueue an event for every recipient, at most once each, assigning
    /// the recipient's next sequence number.
    pub fn publish_to<I>(&self, kind: EventKind, target: EventTarget, recipients: I)
    where
        I: IntoIterator<Item = SessionId>,
    {
        let unique: HashSet<SessionId> = recipients.into_iter().collect();
        let timestamp = Utc::now();
        for session in unique {
            let Some(queue) = self.queues.get(&session) else {
                continue;
            };
            let event = Event {
                kind,
                target: target.clone(),
                sequence: queue.next_seq.fetch_add(1, Ordering::SeqCst),
                timestamp,
            };
            trace!(?kind, %session, seq = event.sequence, "delivering event");
            if queue.tx.try_send(event).is_err() {
                warn!(%session, ?kind, "subscriber queue full, dropping event");
            }
        }
    }

    /// Enqueue an event for every session subscribed to `name`.
    pub fn publish_lock_event(&self, kind: EventKind, name: &str) {
        self.publish_to(kind, EventTarget::Lock(name.to_string()), self.subscribers_of(name));
    }

    /// Next undelivered event for the session, in publish order. Blocks
    /// until one arrives; fails with `SessionExpired` once the queue has
    /// been discarded.
    pub async fn poll(&self, session: SessionId) -> Result<Event> {
        let rx = self
            .receivers
            .get(&session)
            .map(|entry| entry.value().clone())
            .ok_or(Error::SessionNotFound { session })?;
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(Error::SessionExpired { session })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_subscriber_order_and_sequence() {
        let dispatcher = EventDispatcher::new(16);
        let s1 = SessionId::new();
        dispatcher.register(s1);
        dispatcher.subscribe(s1, "l");

        dispatcher.publish_lock_event(EventKind::LockAcquired, "l");
        dispatcher.publish_lock_event(EventKind::LockReleased, "l");

        let first = dispatcher.poll(s1).await.unwrap();
        let second = dispatcher.poll(s1).await.unwrap();
        assert_eq!(first.kind, EventKind::LockAcquired);
        assert_eq!(second.kind, EventKind::LockReleased);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn duplicate_recipients_get_one_copy() {
        let dispatcher = EventDispatcher::new(16);
        let s1 = SessionId::new();
        dispatcher.register(s1);

        dispatcher.publish_to(
            EventKind::LockAcquired,
            EventTarget::Lock("l".into()),
            vec![s1, s1, s1],
        );

        let event = dispatcher.poll(s1).await.unwrap();
        assert_eq!(event.sequence, 1);
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            dispatcher.poll(s1),
        )
        .await;
        assert!(pending.is_err(), "only one copy should be enqueued");
    }

    #[tokio::test]
    async fn unregister_fails_pending_poll() {
        let dispatcher = Arc::new(EventDispatcher::new(16));
        let s1 = SessionId::new();
        dispatcher.register(s1);

        let poller = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.poll(s1).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        dispatcher.unregister(s1);

        let result = poller.await.unwrap();
        assert!(matches!(result, Err(Error::SessionExpired { .. })));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let dispatcher = EventDispatcher::new(2);
        let s1 = SessionId::new();
        dispatcher.register(s1);
        dispatcher.subscribe(s1, "l");

        for _ in 0..5 {
            dispatcher.publish_lock_event(EventKind::ContentInvalidated, "l");
        }

        // Two delivered, three dropped; sequence numbers show the gap.
        let first = dispatcher.poll(s1).await.unwrap();
        let second = dispatcher.poll(s1).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }
}
