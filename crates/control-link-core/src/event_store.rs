//! Broadcast + history store for local observers.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{LinkStatus, LocalEvent, SessionSnapshot, TaskRecord};

/// Default history size limit (events).
const HISTORY_EVENTS: usize = 512;

/// Event store with broadcast and history support.
///
/// Publishing never blocks: lagging or absent listeners are skipped, and the
/// history keeps only the newest events so a late status view can catch up.
pub struct EventStore {
    history: RwLock<VecDeque<LocalEvent>>,
    capacity: usize,
    sender: broadcast::Sender<LocalEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a new event store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_EVENTS)
    }

    /// Create a store keeping at most `capacity` past events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: LocalEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Push a session snapshot.
    pub fn push_session(&self, snapshot: SessionSnapshot) {
        self.push(LocalEvent::Session(snapshot));
    }

    /// Push a status transition.
    pub fn push_status(&self, status: LinkStatus, data: serde_json::Value, timestamp: i64) {
        self.push(LocalEvent::Status {
            status,
            data,
            timestamp,
        });
    }

    /// Push a task record change.
    pub fn push_task(&self, record: TaskRecord) {
        self.push(LocalEvent::Task(record));
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LocalEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<LocalEvent> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Latest status event in history, if any.
    #[must_use]
    pub fn last_status(&self) -> Option<LinkStatus> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find_map(|event| match event {
                LocalEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<LocalEvent, std::io::Error>> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history.into_iter().map(Ok::<_, std::io::Error>));
        let live = BroadcastStream::new(rx).filter_map(|res: Result<LocalEvent, _>| async move {
            match res {
                Ok(event) => Some(Ok::<_, std::io::Error>(event)),
                Err(e) => {
                    tracing::debug!("Local event listener fell behind: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }

    /// SSE stream (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn sse_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<axum::response::sse::Event, std::io::Error>>
    {
        use futures::TryStreamExt;
        self.history_plus_stream()
            .map_ok(|event| event.to_sse_event())
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let store = EventStore::with_capacity(3);
        for i in 0..5 {
            store.push_status(LinkStatus::Reconnecting, json!({ "attempt": i }), i);
        }
        let history = store.history();
        assert_eq!(history.len(), 3);
        assert!(matches!(
            &history[0],
            LocalEvent::Status { timestamp: 2, .. }
        ));
    }

    #[test]
    fn test_push_without_listeners_does_not_fail() {
        let store = EventStore::new();
        store.push_session(SessionSnapshot::default());
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.last_status(), None);
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = EventStore::new();
        store.push_status(LinkStatus::Connected, json!({}), 1);

        let mut stream = store.history_plus_stream();
        store.push_status(LinkStatus::Disconnected, json!({}), 2);

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, LocalEvent::Status { status: LinkStatus::Connected, .. }));
        assert!(matches!(
            second,
            LocalEvent::Status { status: LinkStatus::Disconnected, .. }
        ));
        assert_eq!(store.last_status(), Some(LinkStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_lagging_listener_skips_ahead() {
        let store = EventStore::with_capacity(1);
        let mut stream = store.history_plus_stream();
        for i in 0..1030 {
            store.push_status(LinkStatus::Reconnecting, json!({}), i);
        }

        // The oldest six events were overwritten before the listener read them.
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, LocalEvent::Status { timestamp: 6, .. }));
    }
}
