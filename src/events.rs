//! Change notifications fired after a reload has been committed.
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::model::News;

/// Immutable snapshot of what one committed reload changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewsEvent {
    pub feed_link: String,
    pub feed_updated: bool,
    pub added: Vec<News>,
    pub updated: Vec<News>,
    pub removed: Vec<News>,
    /// News were added or removed (as opposed to content-only updates).
    pub structural_change: bool,
}

impl NewsEvent {
    pub fn is_empty(&self) -> bool {
        !self.feed_updated
            && self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
    }
}

/// Fire-and-forget observer.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &NewsEvent);
}

/// Fans events out to any number of async subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<NewsEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewsEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn notify(&self, event: &NewsEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(link = %event.feed_link, "no event subscribers");
        }
    }
}

/// Logs a one-line summary per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn notify(&self, event: &NewsEvent) {
        info!(
            link = %event.feed_link,
            added = event.added.len(),
            updated = event.updated.len(),
            removed = event.removed.len(),
            structural = event.structural_change,
            "feed changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(4);
        let mut rx = sink.subscribe();
        let event = NewsEvent {
            feed_link: "http://example.com/feed".into(),
            feed_updated: false,
            added: vec![News::new("a")],
            updated: vec![],
            removed: vec![],
            structural_change: true,
        };
        sink.notify(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn notify_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(1);
        sink.notify(&NewsEvent {
            feed_link: "x".into(),
            feed_updated: true,
            added: vec![],
            updated: vec![],
            removed: vec![],
            structural_change: false,
        });
    }
}
