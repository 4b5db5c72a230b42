//! Store contracts: the persistence seam of the inbox
//!
//! The relational store itself lives outside this crate. Everything the
//! core needs from it is expressed here as async traits; `MemoryStore`
//! implements all of them for tests and single-process deployments.
//!
//! Every write is either an upsert or an insert-or-fetch, so concurrent
//! webhook deliveries converge on the same rows without a reconcile job.

use crate::credential::CredentialRecord;
use crate::error::Result;
use crate::types::{Contact, Conversation, Message, MessageStatus, Platform, Priority, Provider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;

pub use memory::MemoryStore;

/// Result of an insert-or-fetch
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    /// A new row was written
    Inserted(T),
    /// A row with the same natural key already existed and is returned
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(v) | InsertOutcome::Existing(v) => v,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Result of appending a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored under the returned message id
    Inserted(String),
    /// `(platform, platformMessageId)` was already stored under this id
    Duplicate(String),
}

impl AppendOutcome {
    pub fn id(&self) -> &str {
        match self {
            AppendOutcome::Inserted(id) | AppendOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Row counts, for health reporting and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub credentials: usize,
    pub contacts: usize,
    pub conversations: usize,
    pub messages: usize,
}

/// Encrypted credential rows, one per `(user_id, provider)`
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or replace the row keyed on `(user_id, provider)`
    ///
    /// An existing row keeps its `id`, `created_at` and `last_synced_at`.
    async fn upsert_credential(&self, record: CredentialRecord) -> Result<CredentialRecord>;

    /// Fetch the row for `(user_id, provider)`, active or not
    async fn get_credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<CredentialRecord>>;

    /// All rows of a user, active or not
    async fn list_credentials(&self, user_id: &str) -> Result<Vec<CredentialRecord>>;

    /// Set `is_active = false`; returns whether a row was found
    async fn deactivate_credential(&self, user_id: &str, provider: Provider) -> Result<bool>;

    /// Bump `last_synced_at`
    async fn touch_credential_sync(
        &self,
        user_id: &str,
        provider: Provider,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Contacts, unique on `(user_id, platform, external_id)`
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn find_contact(
        &self,
        user_id: &str,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<Contact>>;

    async fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>>;

    /// Insert, or return the row that already holds the natural key
    async fn insert_contact(&self, contact: Contact) -> Result<InsertOutcome<Contact>>;

    /// Bump `last_seen`; fills `display_name` only when it is still empty
    async fn touch_contact(
        &self,
        contact_id: &str,
        seen_at: DateTime<Utc>,
        display_name: Option<String>,
    ) -> Result<()>;

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>>;
}

/// Conversations, one active per `(contact_id, platform, thread_key)`
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_active_conversation(
        &self,
        contact_id: &str,
        platform: Platform,
        thread_key: &str,
    ) -> Result<Option<Conversation>>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    /// Insert, or return the active row that already holds the key
    async fn insert_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<InsertOutcome<Conversation>>;

    /// Bump `last_message_at` and the preview
    ///
    /// `priority` only ever raises the stored priority.
    async fn record_conversation_activity(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
        preview: String,
        priority: Option<Priority>,
    ) -> Result<()>;

    /// Mark a conversation closed; the next message on its thread opens a new one
    async fn close_conversation(&self, conversation_id: &str) -> Result<bool>;

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;
}

/// Append-only message log
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, deduplicating on
    /// `(user_id, platform, platform_message_id)`
    ///
    /// Platform ids are only unique within one connected account (Slack
    /// `ts` values repeat across workspaces), so the tenant is part of the key.
    async fn append(&self, message: Message) -> Result<AppendOutcome>;

    /// Apply a delivery status to the tenant's message carrying `platform_message_id`
    ///
    /// Returns the updated row, or `None` when nothing matched or the
    /// transition would move down the status ladder.
    async fn update_status(
        &self,
        user_id: &str,
        platform_message_id: &str,
        platform: Platform,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<Option<Message>>;

    async fn find_by_platform_id(
        &self,
        user_id: &str,
        platform: Platform,
        platform_message_id: &str,
    ) -> Result<Option<Message>>;

    /// Messages of one conversation in arrival order
    async fn list_conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
}

/// Everything the inbox needs from persistence
#[async_trait]
pub trait Store: CredentialStore + ContactStore + ConversationStore + MessageStore {
    /// Row counts
    async fn stats(&self) -> Result<StoreStats>;

    /// Health check
    ///
    /// Default implementation delegates to `stats()`.
    async fn health(&self) -> Result<bool> {
        self.stats().await.map(|_| true)
    }
}
