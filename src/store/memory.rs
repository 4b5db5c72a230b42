//! In-memory store
//!
//! Implements every store contract behind a single `tokio::sync::RwLock`,
//! so each insert-or-fetch is atomic with respect to concurrent callers.
//! Data lives only as long as the process.

use super::{
    AppendOutcome, ContactStore, ConversationStore, CredentialStore, InsertOutcome, MessageStore,
    Store, StoreStats,
};
use crate::credential::CredentialRecord;
use crate::error::Result;
use crate::types::{
    Contact, Conversation, ConversationStatus, Message, MessageStatus, Platform, Priority, Provider,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

type ContactKey = (String, Platform, String);
type ThreadKey = (String, Platform, String);

#[derive(Default)]
struct MemoryState {
    credentials: HashMap<(String, Provider), CredentialRecord>,

    contacts: HashMap<String, Contact>,
    /// (user_id, platform, external_id) → contact id
    contact_keys: HashMap<ContactKey, String>,

    conversations: HashMap<String, Conversation>,
    /// (contact_id, platform, thread_key) → active conversation id
    active_threads: HashMap<ThreadKey, String>,

    messages: HashMap<String, Message>,
    /// (platform, platform_message_id) → message id
    platform_ids: HashMap<(String, Platform, String), String>,
    /// conversation id → message ids in arrival order
    conversation_log: HashMap<String, Vec<String>>,
}

/// In-memory implementation of all store contracts
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn upsert_credential(&self, mut record: CredentialRecord) -> Result<CredentialRecord> {
        let mut state = self.state.write().await;
        let key = (
            record.credential.user_id.clone(),
            record.credential.provider,
        );
        if let Some(existing) = state.credentials.get(&key) {
            record.credential.id = existing.credential.id.clone();
            record.credential.created_at = existing.credential.created_at;
            if record.credential.last_synced_at.is_none() {
                record.credential.last_synced_at = existing.credential.last_synced_at;
            }
        }
        state.credentials.insert(key, record.clone());
        Ok(record)
    }

    async fn get_credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<CredentialRecord>> {
        let state = self.state.read().await;
        Ok(state
            .credentials
            .get(&(user_id.to_string(), provider))
            .cloned())
    }

    async fn list_credentials(&self, user_id: &str) -> Result<Vec<CredentialRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<CredentialRecord> = state
            .credentials
            .values()
            .filter(|r| r.credential.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.credential.provider);
        Ok(records)
    }

    async fn deactivate_credential(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.credentials.get_mut(&(user_id.to_string(), provider)) {
            Some(record) => {
                record.credential.is_active = false;
                record.credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_credential_sync(
        &self,
        user_id: &str,
        provider: Provider,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.credentials.get_mut(&(user_id.to_string(), provider)) {
            record.credential.last_synced_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn find_contact(
        &self,
        user_id: &str,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<Contact>> {
        let state = self.state.read().await;
        let key = (user_id.to_string(), platform, external_id.to_string());
        Ok(state
            .contact_keys
            .get(&key)
            .and_then(|id| state.contacts.get(id))
            .cloned())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        Ok(self.state.read().await.contacts.get(contact_id).cloned())
    }

    async fn insert_contact(&self, contact: Contact) -> Result<InsertOutcome<Contact>> {
        let mut state = self.state.write().await;
        let key = (
            contact.user_id.clone(),
            contact.platform,
            contact.external_id.clone(),
        );
        if let Some(existing) = state
            .contact_keys
            .get(&key)
            .and_then(|id| state.contacts.get(id))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        state.contact_keys.insert(key, contact.id.clone());
        state.contacts.insert(contact.id.clone(), contact.clone());
        Ok(InsertOutcome::Inserted(contact))
    }

    async fn touch_contact(
        &self,
        contact_id: &str,
        seen_at: DateTime<Utc>,
        display_name: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(contact) = state.contacts.get_mut(contact_id) {
            if seen_at > contact.last_seen {
                contact.last_seen = seen_at;
            }
            if contact.display_name.is_none() {
                contact.display_name = display_name;
            }
        }
        Ok(())
    }

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>> {
        let state = self.state.read().await;
        let mut contacts: Vec<Contact> = state
            .contacts
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        contacts.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(contacts)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_active_conversation(
        &self,
        contact_id: &str,
        platform: Platform,
        thread_key: &str,
    ) -> Result<Option<Conversation>> {
        let state = self.state.read().await;
        let key = (contact_id.to_string(), platform, thread_key.to_string());
        Ok(state
            .active_threads
            .get(&key)
            .and_then(|id| state.conversations.get(id))
            .cloned())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .get(conversation_id)
            .cloned())
    }

    async fn insert_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<InsertOutcome<Conversation>> {
        let mut state = self.state.write().await;
        let key = (
            conversation.contact_id.clone(),
            conversation.platform,
            conversation.thread_key.clone(),
        );
        if let Some(existing) = state
            .active_threads
            .get(&key)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        if conversation.status == ConversationStatus::Active {
            state.active_threads.insert(key, conversation.id.clone());
        }
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(InsertOutcome::Inserted(conversation))
    }

    async fn record_conversation_activity(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        preview: String,
        priority: Option<Priority>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            let newer = conversation.last_message_at.map_or(true, |last| at >= last);
            if newer {
                conversation.last_message_at = Some(at);
                conversation.last_message_text = Some(preview);
            }
            if let Some(p) = priority {
                conversation.priority = conversation.priority.max(p);
            }
        }
        Ok(())
    }

    async fn close_conversation(&self, conversation_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = match state.conversations.get_mut(conversation_id) {
            Some(conversation) if conversation.status == ConversationStatus::Active => {
                conversation.status = ConversationStatus::Closed;
                (
                    conversation.contact_id.clone(),
                    conversation.platform,
                    conversation.thread_key.clone(),
                )
            }
            _ => return Ok(false),
        };
        state.active_threads.remove(&key);
        Ok(true)
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: Message) -> Result<AppendOutcome> {
        let mut state = self.state.write().await;
        if let Some(pmid) = &message.platform_message_id {
            let key = (message.user_id.clone(), message.platform, pmid.clone());
            if let Some(existing) = state.platform_ids.get(&key) {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
            state.platform_ids.insert(key, message.id.clone());
        }
        let id = message.id.clone();
        state
            .conversation_log
            .entry(message.conversation_id.clone())
            .or_default()
            .push(id.clone());
        state.messages.insert(id.clone(), message);
        Ok(AppendOutcome::Inserted(id))
    }

    async fn update_status(
        &self,
        user_id: &str,
        platform_message_id: &str,
        platform: Platform,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<Option<Message>> {
        let mut state = self.state.write().await;
        let id = match state
            .platform_ids
            .get(&(user_id.to_string(), platform, platform_message_id.to_string()))
        {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        let Some(message) = state.messages.get_mut(&id) else {
            return Ok(None);
        };
        if !message.status.can_transition_to(status) {
            return Ok(None);
        }
        message.status = status;
        if error.is_some() {
            message.error = error;
        }
        Ok(Some(message.clone()))
    }

    async fn find_by_platform_id(
        &self,
        user_id: &str,
        platform: Platform,
        platform_message_id: &str,
    ) -> Result<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .platform_ids
            .get(&(user_id.to_string(), platform, platform_message_id.to_string()))
            .and_then(|id| state.messages.get(id))
            .cloned())
    }

    async fn list_conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        Ok(state
            .conversation_log
            .get(conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.messages.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read().await;
        Ok(StoreStats {
            credentials: state.credentials.len(),
            contacts: state.contacts.len(),
            conversations: state.conversations.len(),
            messages: state.messages.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::sync::Arc;

    fn inbound(conversation: &Conversation, pmid: &str) -> Message {
        let mut msg = Message::new("u1", conversation, Direction::Inbound, "hello");
        msg.platform_message_id = Some(pmid.to_string());
        msg
    }

    #[tokio::test]
    async fn test_insert_contact_returns_existing_on_conflict() {
        let store = MemoryStore::new();
        let first = store
            .insert_contact(Contact::new("u1", Platform::Slack, "U1"))
            .await
            .unwrap();
        assert!(first.is_inserted());

        let second = store
            .insert_contact(Contact::new("u1", Platform::Slack, "U1"))
            .await
            .unwrap();
        assert!(!second.is_inserted());
        assert_eq!(first.into_inner().id, second.into_inner().id);
        assert_eq!(store.stats().await.unwrap().contacts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_contact_inserts_converge() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_contact(Contact::new("u1", Platform::Sms, "15551234567"))
                    .await
                    .unwrap()
                    .into_inner()
                    .id
            }));
        }
        let ids: Vec<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.stats().await.unwrap().contacts, 1);
    }

    #[tokio::test]
    async fn test_touch_contact_keeps_existing_name() {
        let store = MemoryStore::new();
        let mut contact = Contact::new("u1", Platform::Email, "a@b.com");
        contact.display_name = Some("Alice".into());
        let id = store.insert_contact(contact).await.unwrap().into_inner().id;

        store
            .touch_contact(&id, Utc::now(), Some("Someone Else".into()))
            .await
            .unwrap();
        let stored = store.get_contact(&id).await.unwrap().unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_append_dedups_on_platform_id() {
        let store = MemoryStore::new();
        let conv = Conversation::new("u1", "ct-1", Platform::Slack, "C1");

        let first = store.append(inbound(&conv, "slack_1")).await.unwrap();
        let second = store.append(inbound(&conv, "slack_1")).await.unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(second, AppendOutcome::Duplicate(first.id().to_string()));
        assert_eq!(store.stats().await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_same_platform_id_on_other_platform_is_distinct() {
        let store = MemoryStore::new();
        let slack = Conversation::new("u1", "ct-1", Platform::Slack, "C1");
        let sms = Conversation::new("u1", "ct-2", Platform::Sms, "1555");

        store.append(inbound(&slack, "X1")).await.unwrap();
        let outcome = store.append(inbound(&sms, "X1")).await.unwrap();
        assert!(!outcome.is_duplicate());
    }

    #[tokio::test]
    async fn test_update_status_follows_ladder() {
        let store = MemoryStore::new();
        let conv = Conversation::new("u1", "ct-1", Platform::Sms, "1555");
        let mut msg = Message::new("u1", &conv, Direction::Outbound, "hi");
        msg.platform_message_id = Some("SM1".into());
        msg.status = MessageStatus::Sent;
        store.append(msg).await.unwrap();

        let delivered = store
            .update_status("u1", "SM1", Platform::Sms, MessageStatus::Delivered, None)
            .await
            .unwrap();
        assert_eq!(delivered.unwrap().status, MessageStatus::Delivered);

        let regressed = store
            .update_status("u1", "SM1", Platform::Sms, MessageStatus::Sent, None)
            .await
            .unwrap();
        assert!(regressed.is_none());

        let stored = store
            .find_by_platform_id("u1", Platform::Sms, "SM1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_update_status_unknown_message_is_noop() {
        let store = MemoryStore::new();
        let result = store
            .update_status("u1", "missing", Platform::Sms, MessageStatus::Read, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_messages_listed_in_arrival_order() {
        let store = MemoryStore::new();
        let conv = Conversation::new("u1", "ct-1", Platform::Slack, "C1");
        for i in 0..5 {
            store
                .append(inbound(&conv, &format!("slack_{}", i)))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list_conversation_messages(&conv.id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|m| m.platform_message_id)
            .collect();
        assert_eq!(
            ids,
            vec!["slack_0", "slack_1", "slack_2", "slack_3", "slack_4"]
        );
    }

    #[tokio::test]
    async fn test_closed_conversation_frees_thread() {
        let store = MemoryStore::new();
        let first = store
            .insert_conversation(Conversation::new("u1", "ct-1", Platform::Slack, "C1"))
            .await
            .unwrap()
            .into_inner();
        assert!(store.close_conversation(&first.id).await.unwrap());
        assert!(store
            .find_active_conversation("ct-1", Platform::Slack, "C1")
            .await
            .unwrap()
            .is_none());

        let second = store
            .insert_conversation(Conversation::new("u1", "ct-1", Platform::Slack, "C1"))
            .await
            .unwrap();
        assert!(second.is_inserted());
        assert_ne!(second.into_inner().id, first.id);
    }

    #[tokio::test]
    async fn test_activity_raises_priority_only() {
        let store = MemoryStore::new();
        let conv = store
            .insert_conversation(Conversation::new("u1", "ct-1", Platform::Email, "t1"))
            .await
            .unwrap()
            .into_inner();

        store
            .record_conversation_activity(&conv.id, Utc::now(), "urgent!".into(), Some(Priority::Urgent))
            .await
            .unwrap();
        store
            .record_conversation_activity(&conv.id, Utc::now(), "thanks".into(), Some(Priority::Low))
            .await
            .unwrap();

        let stored = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(stored.priority, Priority::Urgent);
        assert_eq!(stored.last_message_text.as_deref(), Some("thanks"));
    }
}
