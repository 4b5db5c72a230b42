//! Inbox events
//!
//! Every accepted inbound message, recorded outbound message and applied
//! status change is published as an `InboxEvent` so downstream routing
//! (assignment, notifications, automations) can react without polling
//! the store. Publishing is best effort: the ingest path logs a failed
//! publish and carries on.

use crate::error::Result;
use crate::types::{Message, Platform, Priority};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event type published when an inbound message is stored
pub const MESSAGE_RECEIVED: &str = "message.received";
/// Event type published when an outbound message is stored
pub const MESSAGE_SENT: &str = "message.sent";
/// Event type published when a delivery status is applied
pub const MESSAGE_STATUS: &str = "message.status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Dotted event type, e.g. `message.received`
    pub event_type: String,

    pub user_id: String,
    pub platform: Platform,
    pub conversation_id: String,
    pub message_id: String,

    /// Priority the conversation was classified at, for inbound messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Classification label or status, depending on the event type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,
}

impl InboxEvent {
    fn for_message(event_type: &str, message: &Message) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.to_string(),
            user_id: message.user_id.clone(),
            platform: message.platform,
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            priority: None,
            label: None,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        }
    }

    /// An inbound message was stored and classified
    pub fn received(message: &Message, priority: Priority, intent: &str) -> Self {
        let mut event = Self::for_message(MESSAGE_RECEIVED, message);
        event.priority = Some(priority);
        event.label = Some(intent.to_string());
        event
    }

    /// An outbound message was stored
    pub fn sent(message: &Message) -> Self {
        Self::for_message(MESSAGE_SENT, message)
    }

    /// A delivery status was applied
    pub fn status(message: &Message) -> Self {
        let mut event = Self::for_message(MESSAGE_STATUS, message);
        event.label = Some(message.status.as_str().to_string());
        event
    }
}

/// Destination for inbox events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &InboxEvent) -> Result<()>;

    /// Sink name (e.g., "broadcast", "nats")
    fn name(&self) -> &str;
}

/// In-process fan-out over a tokio broadcast channel
///
/// Slow subscribers lag and lose the oldest events; publishing never
/// blocks the ingest path.
pub struct BroadcastSink {
    tx: broadcast::Sender<InboxEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: &InboxEvent) -> Result<()> {
        // No subscribers is not an error
        let receivers = self.tx.send(event.clone()).unwrap_or(0);
        tracing::trace!(
            event_type = %event.event_type,
            receivers,
            "Inbox event published"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}
