//! Contact and conversation resolution
//!
//! Maps a sender identifier onto a stable contact and a thread key onto a
//! stable conversation. Both lookups are find-then-insert-or-fetch, so two
//! deliveries racing on the same sender end up on the same rows.

use crate::error::{InboxError, Result};
use crate::store::{ContactStore, ConversationStore};
use crate::types::{Contact, ContactHints, Conversation, ConversationStatus, Platform, Priority};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Normalize an external identifier for its platform
///
/// Phone numbers keep digits only, email addresses are reduced to the
/// lower-cased bare address, everything else is trimmed.
pub fn normalize_external_id(platform: Platform, raw: &str) -> String {
    let raw = raw.trim();
    match platform {
        Platform::Sms | Platform::Whatsapp => {
            let raw = raw.strip_prefix("whatsapp:").unwrap_or(raw);
            raw.chars().filter(|c| c.is_ascii_digit()).collect()
        }
        Platform::Email => bare_address(raw).to_lowercase(),
        _ => raw.to_string(),
    }
}

/// `"Jane Doe <jane@example.com>"` → `"jane@example.com"`
fn bare_address(raw: &str) -> &str {
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => raw[start + 1..end].trim(),
        _ => raw.trim_matches(|c: char| c == '"' || c.is_whitespace()),
    }
}

/// Truncate `text` to at most `max_chars` characters, marking the cut with `…`
pub fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    out.push('…');
    out
}

pub struct ContactConversationResolver {
    contacts: Arc<dyn ContactStore>,
    conversations: Arc<dyn ConversationStore>,
    preview_max_chars: usize,
}

impl ContactConversationResolver {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        conversations: Arc<dyn ConversationStore>,
        preview_max_chars: usize,
    ) -> Self {
        Self {
            contacts,
            conversations,
            preview_max_chars,
        }
    }

    /// Find or create the contact for `external_id`, returning its id
    pub async fn resolve_contact(
        &self,
        user_id: &str,
        platform: Platform,
        external_id: &str,
        hints: Option<&ContactHints>,
    ) -> Result<String> {
        let normalized = normalize_external_id(platform, external_id);
        if normalized.is_empty() {
            return Err(InboxError::MalformedPayload(format!(
                "empty {} sender identifier '{}'",
                platform, external_id
            )));
        }
        let display_name = hints.and_then(|h| h.display_name.clone());

        if let Some(existing) = self
            .contacts
            .find_contact(user_id, platform, &normalized)
            .await?
        {
            self.contacts
                .touch_contact(&existing.id, Utc::now(), display_name)
                .await?;
            return Ok(existing.id);
        }

        let mut contact = Contact::new(user_id, platform, normalized);
        contact.display_name = display_name;
        if let Some(h) = hints {
            contact.metadata = h.metadata.clone();
        }
        let outcome = self.contacts.insert_contact(contact).await?;
        if outcome.is_inserted() {
            tracing::debug!(user_id = %user_id, platform = %platform, "Contact created");
        }
        Ok(outcome.into_inner().id)
    }

    /// Find the active conversation for the thread or open a new one
    pub async fn resolve_conversation(
        &self,
        user_id: &str,
        contact_id: &str,
        platform: Platform,
        thread_key: &str,
    ) -> Result<String> {
        if let Some(existing) = self
            .conversations
            .find_active_conversation(contact_id, platform, thread_key)
            .await?
        {
            return Ok(existing.id);
        }
        let outcome = self
            .conversations
            .insert_conversation(Conversation::new(user_id, contact_id, platform, thread_key))
            .await?;
        if outcome.is_inserted() {
            tracing::debug!(
                user_id = %user_id,
                platform = %platform,
                thread_key = %thread_key,
                "Conversation opened"
            );
        }
        Ok(outcome.into_inner().id)
    }

    /// Bump the conversation's last activity and preview
    pub async fn record_activity(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        text: &str,
        priority: Option<Priority>,
    ) -> Result<()> {
        self.conversations
            .record_conversation_activity(
                conversation_id,
                at,
                preview(text, self.preview_max_chars),
                priority,
            )
            .await
    }

    pub async fn conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.conversations.get_conversation(conversation_id).await
    }

    /// Most recently active open conversation on a thread, whoever the contact
    ///
    /// A Slack channel carries many senders under one thread key; replies
    /// addressed to the channel belong with them.
    pub async fn active_thread(
        &self,
        user_id: &str,
        platform: Platform,
        thread_key: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .list_conversations(user_id)
            .await?
            .into_iter()
            .filter(|c| {
                c.platform == platform
                    && c.thread_key == thread_key
                    && c.status == ConversationStatus::Active
            })
            .max_by_key(|c| c.last_message_at.unwrap_or(c.created_at)))
    }
}
