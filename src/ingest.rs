//! Ingest pipeline: resolve → dedup → append → classify → publish
//!
//! Shared by every channel provider. Ingestion is serialized per
//! `(user, platform, thread_key)` so messages of one thread are appended
//! in the order they were handed over, while unrelated threads proceed
//! in parallel.

use crate::classify::{KeywordClassifier, MessageClassifier};
use crate::error::Result;
use crate::events::{EventSink, InboxEvent};
use crate::resolver::{normalize_external_id, ContactConversationResolver};
use crate::store::{AppendOutcome, MessageStore};
use crate::types::{
    ContactHints, Direction, Message, MessageStatus, Metadata, ParsedMessage, Platform,
    StatusUpdate,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

type LockKey = (String, Platform, String);

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        message_id: String,
        contact_id: String,
        conversation_id: String,
    },
    /// Already stored under `message_id`; nothing was written
    Duplicate { message_id: String },
}

/// An outbound message the provider accepted
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub platform: Platform,
    /// Recipient identifier (not yet normalized)
    pub to: String,
    /// Conversation being replied to, if any
    pub conversation_id: Option<String>,
    /// Thread to file the message under; defaults to the normalized recipient
    pub thread_key: Option<String>,
    pub body: String,
    pub platform_message_id: Option<String>,
    pub status: MessageStatus,
    pub metadata: Metadata,
}

pub struct Ingestor {
    resolver: ContactConversationResolver,
    messages: Arc<dyn MessageStore>,
    classifier: Arc<dyn MessageClassifier>,
    events: Arc<dyn EventSink>,
    thread_locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl Ingestor {
    pub fn new(
        resolver: ContactConversationResolver,
        messages: Arc<dyn MessageStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            resolver,
            messages,
            classifier: Arc::new(KeywordClassifier::default()),
            events,
            thread_locks: DashMap::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn MessageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn resolver(&self) -> &ContactConversationResolver {
        &self.resolver
    }

    async fn with_thread_lock<T, F>(&self, key: LockKey, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lock = self
            .thread_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        // Drop idle locks so the map tracks only busy threads
        self.thread_locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    /// Store one inbound message
    pub async fn ingest(&self, user_id: &str, parsed: ParsedMessage) -> Result<IngestOutcome> {
        let key = (
            user_id.to_string(),
            parsed.platform,
            parsed.thread_key.clone(),
        );
        self.with_thread_lock(key, self.ingest_locked(user_id, parsed))
            .await
    }

    async fn ingest_locked(&self, user_id: &str, parsed: ParsedMessage) -> Result<IngestOutcome> {
        if let Some(existing) = self
            .messages
            .find_by_platform_id(user_id, parsed.platform, &parsed.platform_message_id)
            .await?
        {
            tracing::debug!(
                user_id = %user_id,
                platform = %parsed.platform,
                platform_message_id = %parsed.platform_message_id,
                "Duplicate inbound message"
            );
            return Ok(IngestOutcome::Duplicate {
                message_id: existing.id,
            });
        }

        let hints = ContactHints {
            display_name: parsed.display_name.clone(),
            metadata: Metadata::new(),
        };
        let contact_id = self
            .resolver
            .resolve_contact(user_id, parsed.platform, &parsed.external_id, Some(&hints))
            .await?;
        let conversation_id = self
            .resolver
            .resolve_conversation(user_id, &contact_id, parsed.platform, &parsed.thread_key)
            .await?;

        let classification = self.classifier.classify(&parsed);
        let mut message = Message::from_parts(
            user_id,
            &conversation_id,
            &contact_id,
            parsed.platform,
            Direction::Inbound,
            &parsed.body,
        );
        message.platform_message_id = Some(parsed.platform_message_id.clone());
        message.timestamp = parsed.timestamp;
        message.metadata = inbound_metadata(&parsed, classification.intent.as_str());

        let message_id = match self.messages.append(message.clone()).await? {
            AppendOutcome::Inserted(id) => id,
            AppendOutcome::Duplicate(id) => {
                return Ok(IngestOutcome::Duplicate { message_id: id });
            }
        };

        self.resolver
            .record_activity(
                &conversation_id,
                parsed.timestamp,
                preview_text(&parsed),
                Some(classification.priority),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            platform = %parsed.platform,
            platform_message_id = %parsed.platform_message_id,
            conversation_id = %conversation_id,
            intent = classification.intent.as_str(),
            "Inbound message stored"
        );

        self.publish(InboxEvent::received(
            &message,
            classification.priority,
            classification.intent.as_str(),
        ))
        .await;

        Ok(IngestOutcome::Accepted {
            message_id,
            contact_id,
            conversation_id,
        })
    }

    /// Store an outbound message after the provider accepted it
    ///
    /// Replies name their conversation and are filed under it. Otherwise
    /// the message joins the open conversation on its thread key, and only
    /// a thread nobody has written on yet opens a conversation with the
    /// recipient as contact.
    pub async fn record_outbound(&self, user_id: &str, record: OutboundRecord) -> Result<String> {
        let named = match &record.conversation_id {
            Some(id) => self
                .resolver
                .conversation(id)
                .await?
                .filter(|c| c.user_id == user_id && c.platform == record.platform),
            None => None,
        };
        let thread_key = match &named {
            Some(conversation) => conversation.thread_key.clone(),
            None => record
                .thread_key
                .clone()
                .unwrap_or_else(|| normalize_external_id(record.platform, &record.to)),
        };
        let key = (user_id.to_string(), record.platform, thread_key.clone());
        let target = named.map(|c| (c.id, c.contact_id));
        self.with_thread_lock(
            key,
            self.record_outbound_locked(user_id, record, thread_key, target),
        )
        .await
    }

    async fn record_outbound_locked(
        &self,
        user_id: &str,
        record: OutboundRecord,
        thread_key: String,
        target: Option<(String, String)>,
    ) -> Result<String> {
        let target = match target {
            Some(ids) => Some(ids),
            None => self
                .resolver
                .active_thread(user_id, record.platform, &thread_key)
                .await?
                .map(|c| (c.id, c.contact_id)),
        };
        let (conversation_id, contact_id) = match target {
            Some(ids) => ids,
            None => {
                let contact_id = self
                    .resolver
                    .resolve_contact(user_id, record.platform, &record.to, None)
                    .await?;
                let conversation_id = self
                    .resolver
                    .resolve_conversation(user_id, &contact_id, record.platform, &thread_key)
                    .await?;
                (conversation_id, contact_id)
            }
        };

        let now = Utc::now();
        let mut message = Message::from_parts(
            user_id,
            &conversation_id,
            &contact_id,
            record.platform,
            Direction::Outbound,
            &record.body,
        );
        message.platform_message_id = record.platform_message_id.clone();
        message.status = record.status;
        message.metadata = record.metadata;
        message.timestamp = now;

        let message_id = self.messages.append(message.clone()).await?.id().to_string();
        self.resolver
            .record_activity(&conversation_id, now, &record.body, None)
            .await?;

        tracing::info!(
            user_id = %user_id,
            platform = %record.platform,
            conversation_id = %conversation_id,
            platform_message_id = record.platform_message_id.as_deref().unwrap_or(""),
            "Outbound message stored"
        );
        self.publish(InboxEvent::sent(&message)).await;
        Ok(message_id)
    }

    /// Apply a delivery receipt; unknown messages and regressions are no-ops
    pub async fn apply_status(
        &self,
        user_id: &str,
        update: StatusUpdate,
    ) -> Result<Option<Message>> {
        let Some(existing) = self
            .messages
            .find_by_platform_id(user_id, update.platform, &update.platform_message_id)
            .await?
        else {
            tracing::debug!(
                user_id = %user_id,
                platform_message_id = %update.platform_message_id,
                status = %update.status,
                "Status receipt for unknown message"
            );
            return Ok(None);
        };
        let updated = self
            .messages
            .update_status(
                user_id,
                &update.platform_message_id,
                update.platform,
                update.status,
                update.error.clone(),
            )
            .await?;
        match &updated {
            Some(message) => {
                tracing::info!(
                    user_id = %user_id,
                    platform = %update.platform,
                    platform_message_id = %update.platform_message_id,
                    status = %update.status,
                    "Message status updated"
                );
                self.publish(InboxEvent::status(message)).await;
            }
            None => {
                tracing::debug!(
                    user_id = %user_id,
                    platform_message_id = %update.platform_message_id,
                    from = %existing.status,
                    to = %update.status,
                    "Status receipt would regress; ignored"
                );
            }
        }
        Ok(updated)
    }

    async fn publish(&self, event: InboxEvent) {
        if let Err(e) = self.events.publish(&event).await {
            tracing::warn!(
                sink = self.events.name(),
                event_type = %event.event_type,
                error = %e,
                "Failed to publish inbox event"
            );
        }
    }
}

fn preview_text(parsed: &ParsedMessage) -> &str {
    if parsed.body.trim().is_empty() {
        parsed.subject.as_deref().unwrap_or("")
    } else {
        &parsed.body
    }
}

fn inbound_metadata(parsed: &ParsedMessage, intent: &str) -> Metadata {
    let mut metadata = parsed.metadata.clone();
    if let Some(subject) = &parsed.subject {
        metadata.insert("subject".into(), Value::String(subject.clone()));
    }
    if !parsed.to.is_empty() {
        metadata.insert("to".into(), Value::String(parsed.to.clone()));
    }
    if !parsed.attachments.is_empty() {
        metadata.insert(
            "attachments".into(),
            serde_json::to_value(&parsed.attachments).unwrap_or(Value::Null),
        );
    }
    metadata.insert("intent".into(), Value::String(intent.to_string()));
    metadata
}
