//! Change feed for session documents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use exam_core::model::{ExamSession, SessionId};
use tokio::sync::mpsc;

/// What a watcher learns about a session document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The document exists; this is its current content.
    Snapshot(ExamSession),
    /// The store confirmed the document does not exist.
    Missing,
    /// The watch channel is interrupted. Says nothing about the document.
    ConnectionLost,
}

/// Receiving end of a session watch. Dropping it ends the watch.
#[derive(Debug)]
pub struct SessionSubscription {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl SessionSubscription {
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out of watch events to every live subscription of a session.
#[derive(Clone, Default)]
pub struct SessionFeed {
    subscribers: Arc<Mutex<HashMap<SessionId, Vec<mpsc::UnboundedSender<WatchEvent>>>>>,
}

impl SessionFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and hand it `initial` before any later event.
    pub fn subscribe(&self, id: SessionId, initial: WatchEvent) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this send cannot fail.
        let _ = tx.send(initial);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .push(tx);
        SessionSubscription::new(rx)
    }

    /// Deliver `event` to every subscriber of `id`, dropping closed ones.
    pub fn publish(&self, id: SessionId, event: WatchEvent) {
        let mut guard = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = guard.get_mut(&id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                guard.remove(&id);
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, id: SessionId) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::{ExamId, StudentId};

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let feed = SessionFeed::new();
        let id = SessionId::for_sitting(ExamId::new(1), StudentId::new(1));

        let mut kept = feed.subscribe(id, WatchEvent::Missing);
        let dropped = feed.subscribe(id, WatchEvent::Missing);
        assert_eq!(feed.subscriber_count(id), 2);

        drop(dropped);
        feed.publish(id, WatchEvent::ConnectionLost);

        assert_eq!(feed.subscriber_count(id), 1);
        assert_eq!(kept.next().await, Some(WatchEvent::Missing));
        assert_eq!(kept.next().await, Some(WatchEvent::ConnectionLost));
    }
}
