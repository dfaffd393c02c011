//! Event dispatch: per-type handler registry and the dispatcher task.
//!
//! The listener pushes decoded events onto a bounded per-room channel; the
//! dispatcher task drains it and invokes the registered handlers. Handler
//! execution therefore never stalls the socket read loop, and a panicking
//! handler is caught and logged without stopping delivery.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::models::{Event, EventType};
use crate::queue::CommandQueue;

/// An event handler registered on a room.
///
/// Handlers run on the dispatcher task, so a slow handler delays later events
/// for its room (delivery order is guaranteed) but never the socket reads.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handlers keyed by event type, invoked in registration order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    inner: RwLock<HashMap<EventType, Vec<EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_type: EventType, handler: EventHandler) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entry(event_type).or_default().push(handler);
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<EventHandler> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(&event_type).cloned().unwrap_or_default()
    }
}

/// Dispatcher task: drain the room's event channel and fan out to handlers.
///
/// Mentions and replies are acknowledged back to the platform as they are
/// observed (fire-and-forget; an ack that cannot be queued is just logged).
/// Ends when the listener drops its sender.
pub(crate) async fn dispatch_loop(
    room_id: u64,
    mut events_rx: mpsc::Receiver<Event>,
    registry: Arc<HandlerRegistry>,
    queue: CommandQueue,
) {
    while let Some(event) = events_rx.recv().await {
        acknowledge_if_directed(room_id, &event, &queue);

        let handlers = registry.handlers_for(event.event_type());
        log::debug!(
            "[banter-link] [r{room_id}] dispatching {:?} (id {}) to {} handler(s)",
            event.event_type(),
            event.id(),
            handlers.len()
        );
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if outcome.is_err() {
                log::warn!(
                    "[banter-link] [r{room_id}] handler for {:?} panicked on event {}; continuing",
                    event.event_type(),
                    event.id()
                );
            }
        }
    }
    log::debug!("[banter-link] [r{room_id}] dispatcher finished");
}

/// The platform keeps a per-account unread marker for mentions and replies;
/// clear it so the account does not accumulate stale notifications.
fn acknowledge_if_directed(room_id: u64, event: &Event, queue: &CommandQueue) {
    let message_id = match event {
        Event::Mentioned(m) | Event::Replied(m) => m.message_id,
        _ => return,
    };
    queue.submit_nowait(
        "/messages/ack".to_string(),
        vec![("id".to_string(), message_id.to_string())],
    );
    log::debug!("[banter-link] [r{room_id}] acknowledged directed message {message_id}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn posted(id: u64, content: &str) -> Event {
        Event::MessagePosted(Message {
            id,
            time_stamp: 0,
            room_id: 1,
            message_id: id,
            user_id: 7,
            user_name: "someone".into(),
            content: content.into(),
            parent_id: None,
            stars: 0,
            edits: 0,
        })
    }

    fn test_queue() -> CommandQueue {
        CommandQueue::disconnected()
    }

    #[tokio::test]
    async fn test_handlers_invoked_in_registration_order() {
        let registry = Arc::new(HandlerRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry.register(
                EventType::MessagePosted,
                Arc::new(move |_: &Event| order.lock().unwrap().push(tag)),
            );
        }

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(dispatch_loop(1, rx, registry, test_queue()));
        tx.send(posted(1, "hello")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_delivery() {
        let registry = Arc::new(HandlerRegistry::new());
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.register(
            EventType::MessagePosted,
            Arc::new(|_: &Event| panic!("handler bug")),
        );
        let counter = delivered.clone();
        registry.register(
            EventType::MessagePosted,
            Arc::new(move |_: &Event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(dispatch_loop(1, rx, registry, test_queue()));
        tx.send(posted(1, "a")).await.unwrap();
        tx.send(posted(2, "b")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            delivered.load(Ordering::SeqCst),
            2,
            "later handlers and later events must still be delivered"
        );
    }

    #[tokio::test]
    async fn test_unregistered_types_are_dropped_silently() {
        let registry = Arc::new(HandlerRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(dispatch_loop(1, rx, registry, test_queue()));
        tx.send(posted(1, "nobody listens")).await.unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
