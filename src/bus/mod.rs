//! Publish/subscribe message bus.
//!
//! [`MessageBus`] is the seam between the task registry and the transport.
//! Two implementations ship with the crate:
//!
//! - [`MessageBusClient`]: TCP client for the embedded [`EmbeddedBroker`] or
//!   an external broker speaking the same line protocol.
//! - [`InMemoryBus`]: single-process delivery for offline use and tests.
//!
//! Topic filters follow MQTT conventions: `/` separates levels, `+` matches
//! exactly one level, `#` matches the remaining levels and must be last.

pub mod broker;
pub mod client;
pub mod memory;
pub mod protocol;

pub use broker::EmbeddedBroker;
pub use client::MessageBusClient;
pub use memory::InMemoryBus;

use crate::error::{HubError, Result};
use serde_json::Value;
use std::sync::Arc;

/// JSON object carried by a bus message.
pub type Payload = serde_json::Map<String, Value>;

/// Hidden payload field carrying the forward count of an event.
pub const HOPS_FIELD: &str = "__hops";

/// Callback invoked for each message matching a subscription.
///
/// Runs on the bus delivery task and must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &Payload) + Send + Sync>;

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Connection state of a bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// Publish/subscribe operations used by the task registry.
pub trait MessageBus: Send + Sync {
    /// Registers `handler` for messages whose topic matches `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bus`] if `filter` is malformed.
    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId>;

    /// Removes a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Sends `payload` to every subscriber of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bus`] if the topic is malformed or the transport is down.
    fn publish(&self, topic: &str, payload: Payload) -> Result<()>;
}

/// Whether `topic` matches `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Checks a subscription filter.
///
/// # Errors
///
/// Returns [`HubError::Bus`] for empty filters, `#` anywhere but the last
/// level, or wildcards mixed with other characters in one level.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(HubError::Bus("topic filter cannot be empty".to_owned()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i + 1 != levels.len()) {
            return Err(HubError::Bus(format!(
                "`#` must be a whole level at the end of filter `{filter}`"
            )));
        }
        if level.contains('+') && *level != "+" {
            return Err(HubError::Bus(format!(
                "`+` must be a whole level in filter `{filter}`"
            )));
        }
    }
    Ok(())
}

/// Checks a publish topic.
///
/// # Errors
///
/// Returns [`HubError::Bus`] for empty topics or topics containing wildcards.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(HubError::Bus("topic cannot be empty".to_owned()));
    }
    if topic.contains(['+', '#']) {
        return Err(HubError::Bus(format!(
            "topic `{topic}` cannot contain wildcards"
        )));
    }
    Ok(())
}

/// Reads the hop count carried by `payload`.
///
/// Missing, negative, or non-integer values count as 0.
pub fn hop_count(payload: &Payload) -> u32 {
    payload
        .get(HOPS_FIELD)
        .and_then(Value::as_u64)
        .map_or(0, |hops| u32::try_from(hops).unwrap_or(u32::MAX))
}
