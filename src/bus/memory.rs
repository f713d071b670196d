//! In-process message bus.
//!
//! Publishes go through an unbounded channel to a single delivery task, so
//! publishers never run handlers on their own thread and messages reach
//! handlers in publish order. Nothing is persisted; messages published with
//! no matching subscriber are dropped.

use super::{MessageBus, MessageHandler, Payload, SubscriptionId};
use crate::error::{HubError, Result};
use crate::runtime::{RuntimeEvent, RuntimeEvents};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

type Subscriptions = Arc<Mutex<BTreeMap<SubscriptionId, (String, MessageHandler)>>>;

/// Single-process [`MessageBus`].
pub struct InMemoryBus {
    subscriptions: Subscriptions,
    next_id: AtomicU64,
    sender: mpsc::UnboundedSender<(String, Payload)>,
    events: RuntimeEvents,
}

impl InMemoryBus {
    /// Creates the bus and spawns its delivery task.
    ///
    /// Must be called from within a tokio runtime. The delivery task exits
    /// when the bus is dropped.
    pub fn new(events: RuntimeEvents) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriptions: Subscriptions = Arc::default();
        tokio::spawn(deliver(receiver, Arc::clone(&subscriptions)));
        Self {
            subscriptions,
            next_id: AtomicU64::new(1),
            sender,
            events,
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl MessageBus for InMemoryBus {
    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        super::validate_filter(filter)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (filter.to_owned(), handler));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        super::validate_topic(topic)?;
        self.sender
            .send((topic.to_owned(), payload))
            .map_err(|_| HubError::Bus("in-memory bus delivery task has stopped".to_owned()))?;
        self.events.emit(RuntimeEvent::MessagePublished {
            topic: topic.to_owned(),
        });
        Ok(())
    }
}

async fn deliver(mut receiver: mpsc::UnboundedReceiver<(String, Payload)>, subscriptions: Subscriptions) {
    while let Some((topic, payload)) = receiver.recv().await {
        let handlers: Vec<MessageHandler> = subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|(filter, _)| super::topic_matches(filter, &topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        trace!(%topic, handlers = handlers.len(), "delivering message");
        for handler in handlers {
            handler(&topic, &payload);
        }
    }
}
