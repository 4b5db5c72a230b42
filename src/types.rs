//! Canonical message model shared by every channel
//!
//! All types use camelCase JSON serialization for wire compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::InboxError;

/// JSON object bag used for free-form metadata
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Messaging platform a conversation happens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Email,
    Slack,
    Sms,
    Whatsapp,
    Telegram,
    Facebook,
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Email => "email",
            Platform::Slack => "slack",
            Platform::Sms => "sms",
            Platform::Whatsapp => "whatsapp",
            Platform::Telegram => "telegram",
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
        }
    }

    /// Whether external ids on this platform are phone numbers
    pub fn is_phone_based(&self) -> bool {
        matches!(self, Platform::Sms | Platform::Whatsapp)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Third-party provider a credential belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Slack,
    Twilio,
    Whatsapp,
    Telegram,
    Facebook,
    Instagram,
    GoogleAds,
    MetaAds,
    LinkedinAds,
    Youtube,
    TiktokAds,
}

impl Provider {
    pub const ALL: [Provider; 12] = [
        Provider::Gmail,
        Provider::Slack,
        Provider::Twilio,
        Provider::Whatsapp,
        Provider::Telegram,
        Provider::Facebook,
        Provider::Instagram,
        Provider::GoogleAds,
        Provider::MetaAds,
        Provider::LinkedinAds,
        Provider::Youtube,
        Provider::TiktokAds,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Slack => "slack",
            Provider::Twilio => "twilio",
            Provider::Whatsapp => "whatsapp",
            Provider::Telegram => "telegram",
            Provider::Facebook => "facebook",
            Provider::Instagram => "instagram",
            Provider::GoogleAds => "google_ads",
            Provider::MetaAds => "meta_ads",
            Provider::LinkedinAds => "linkedin_ads",
            Provider::Youtube => "youtube",
            Provider::TiktokAds => "tiktok_ads",
        }
    }

    /// Messaging platform served by this provider, if any
    pub fn platform(&self) -> Option<Platform> {
        match self {
            Provider::Gmail => Some(Platform::Email),
            Provider::Slack => Some(Platform::Slack),
            Provider::Twilio => Some(Platform::Sms),
            Provider::Whatsapp => Some(Platform::Whatsapp),
            Provider::Telegram => Some(Platform::Telegram),
            Provider::Facebook => Some(Platform::Facebook),
            Provider::Instagram => Some(Platform::Instagram),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| InboxError::Config(format!("Unknown provider '{}'", s)))
    }
}

/// Contact lifecycle stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    #[default]
    Lead,
    Prospect,
    Customer,
    Churned,
}

/// Priority for contacts and conversations
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A person reachable on one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Unique contact identifier (ct-<uuid>)
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    /// Normalized external identifier (phone digits, email, platform user id)
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub lifecycle_stage: LifecycleStage,
    #[serde(default)]
    pub priority: Priority,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    /// Create a new contact with an auto-generated id
    pub fn new(
        user_id: impl Into<String>,
        platform: Platform,
        external_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ct-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            platform,
            external_id: external_id.into(),
            display_name: None,
            lifecycle_stage: LifecycleStage::Lead,
            priority: Priority::Normal,
            last_seen: now,
            metadata: Metadata::new(),
            created_at: now,
        }
    }
}

/// Optional data used when a contact is first created
#[derive(Debug, Clone, Default)]
pub struct ContactHints {
    pub display_name: Option<String>,
    pub metadata: Metadata,
}

impl ContactHints {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            metadata: Metadata::new(),
        }
    }
}

/// Conversation status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Closed,
}

/// One thread of messages with a contact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique conversation identifier (cv-<uuid>)
    pub id: String,
    pub user_id: String,
    pub contact_id: String,
    pub platform: Platform,
    /// Provider-native thread id, or a synthesized one
    pub thread_key: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        user_id: impl Into<String>,
        contact_id: impl Into<String>,
        platform: Platform,
        thread_key: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("cv-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            contact_id: contact_id.into(),
            platform,
            thread_key: thread_key.into(),
            status: ConversationStatus::Active,
            priority: Priority::Normal,
            last_message_at: None,
            last_message_text: None,
            created_at: Utc::now(),
        }
    }
}

/// Message direction relative to the tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Delivery status of a message
///
/// Outbound messages climb `queued < sent < delivered < read`; `failed`
/// is terminal. Inbound messages stay `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(&self) -> Option<u8> {
        match self {
            MessageStatus::Queued => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Received | MessageStatus::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Received)
    }

    /// Whether moving from `self` to `next` respects the status ladder
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            MessageStatus::Failed => matches!(self, MessageStatus::Queued | MessageStatus::Sent),
            MessageStatus::Received => false,
            _ => match (self.rank(), next.rank()) {
                (Some(current), Some(target)) => target > current,
                _ => false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment reference; content is never decoded by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// URL or provider-specific locator
    pub location: String,
}

impl Attachment {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            filename: None,
            content_type: None,
            size: None,
            location: location.into(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// A stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier (msg-<uuid>)
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub platform: Platform,
    pub direction: Direction,
    pub content: String,
    /// Provider-assigned id, used for dedup and status callbacks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// When the provider says the message was sent/received
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        user_id: impl Into<String>,
        conversation: &Conversation,
        direction: Direction,
        content: impl Into<String>,
    ) -> Self {
        Self::from_parts(
            user_id,
            &conversation.id,
            &conversation.contact_id,
            conversation.platform,
            direction,
            content,
        )
    }

    /// Build a message from already-resolved ids
    pub fn from_parts(
        user_id: impl Into<String>,
        conversation_id: &str,
        contact_id: &str,
        platform: Platform,
        direction: Direction,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            conversation_id: conversation_id.to_string(),
            contact_id: contact_id.to_string(),
            platform,
            direction,
            content: content.into(),
            platform_message_id: None,
            status: match direction {
                Direction::Inbound => MessageStatus::Received,
                Direction::Outbound => MessageStatus::Queued,
            },
            error: None,
            metadata: Metadata::new(),
            timestamp: now,
            created_at: now,
        }
    }
}

/// Provider-agnostic inbound message produced by a channel adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    pub platform: Platform,
    /// Sender identifier (not yet normalized)
    pub external_id: String,
    /// Recipient identifier on the tenant side
    #[serde(default)]
    pub to: String,
    pub body: String,
    pub thread_key: String,
    pub platform_message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Extra threading refs, headers, etc.
    #[serde(default)]
    pub metadata: Metadata,
}

impl ParsedMessage {
    pub fn new(
        platform: Platform,
        external_id: impl Into<String>,
        body: impl Into<String>,
        thread_key: impl Into<String>,
        platform_message_id: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            external_id: external_id.into(),
            to: String::new(),
            body: body.into(),
            thread_key: thread_key.into(),
            platform_message_id: platform_message_id.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            display_name: None,
            subject: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Delivery receipt for a previously sent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub platform: Platform,
    pub platform_message_id: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ladder_forward() {
        assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Delivered));
        assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_transition_to(MessageStatus::Read));
    }

    #[test]
    fn test_status_ladder_never_regresses() {
        assert!(!MessageStatus::Delivered.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Read.can_transition_to(MessageStatus::Delivered));
    }

    #[test]
    fn test_failed_is_terminal() {
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Failed));
        assert!(!MessageStatus::Failed.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Failed.can_transition_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_transition_to(MessageStatus::Failed));
    }

    #[test]
    fn test_received_never_changes() {
        assert!(!MessageStatus::Received.can_transition_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Queued.can_transition_to(MessageStatus::Received));
    }

    #[test]
    fn test_provider_roundtrip_str() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
        assert!("myspace".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_platform() {
        assert_eq!(Provider::Twilio.platform(), Some(Platform::Sms));
        assert_eq!(Provider::GoogleAds.platform(), None);
    }

    #[test]
    fn test_message_serialization_camel_case() {
        let conv = Conversation::new("u1", "ct-1", Platform::Slack, "C1");
        let mut msg = Message::new("u1", &conv, Direction::Inbound, "hello");
        msg.platform_message_id = Some("slack_1000.001".into());

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["platformMessageId"], "slack_1000.001");
        assert_eq!(json["direction"], "inbound");
        assert_eq!(json["status"], "received");
        assert!(json["id"].as_str().unwrap().starts_with("msg-"));
    }

    #[test]
    fn test_outbound_message_starts_queued() {
        let conv = Conversation::new("u1", "ct-1", Platform::Sms, "15551234567");
        let msg = Message::new("u1", &conv, Direction::Outbound, "hi");
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.contact_id, "ct-1");
    }
}
