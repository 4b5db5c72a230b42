//! Gmail provider
//!
//! Inbound mail arrives as a Pub/Sub push. The decoded payload is either
//! a full forwarded email or a mailbox notification carrying only a
//! `historyId`; notifications are resolved against the Gmail API from the
//! last history id seen for that mailbox.

use super::auth::{AuthOutcome, ChannelAuth, PushTokenAuth, WebhookRequest};
use super::{
    error_for_status, http_client, ChannelConfig, ChannelProvider, Delivery, EmailConfig,
    Integration, OutboundMessage, WebhookEvent,
};
use crate::config::ChannelSettings;
use crate::error::{InboxError, Result};
use crate::ingest::Ingestor;
use crate::types::{Attachment, Metadata, ParsedMessage, Platform};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Messages listed when a mailbox has no history cursor yet
const RECENT_LIMIT: u32 = 10;

/// Labels that mark mail the tenant wrote
const OWN_LABELS: &[&str] = &["SENT", "DRAFT"];

/// Gmail API provider
pub struct EmailProvider {
    settings: ChannelSettings,
    ingestor: Arc<Ingestor>,
    client: reqwest::Client,
    /// Last processed history id per (user, mailbox)
    history: DashMap<(String, String), u64>,
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
}

/// Decoded Pub/Sub data
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PushPayload {
    Notification(MailboxNotification),
    Forwarded(ForwardedEmail),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxNotification {
    email_address: String,
    history_id: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardedEmail {
    from: String,
    message_id: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    attachments: Vec<ForwardedAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardedAttachment {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, alias = "url")]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryList {
    #[serde(default)]
    history: Vec<HistoryRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentMessage {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
    #[serde(default)]
    messages_total: Option<u64>,
    #[serde(default)]
    threads_total: Option<u64>,
}

/// Gmail bodies are base64url, with or without padding
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// `"Jane Doe" <jane@example.com>` → `Jane Doe`
fn display_name(address: &str) -> Option<String> {
    let (name, _) = address.split_once('<')?;
    let name = name.trim().trim_matches('"').trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn history_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Strip CR/LF so header values cannot inject extra headers
fn header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Build the RFC 2822 text of an outbound message
fn rfc2822(from: &str, message: &OutboundMessage) -> String {
    let mut out = String::new();
    out.push_str(&format!("From: {}\r\n", header_value(from)));
    out.push_str(&format!("To: {}\r\n", header_value(&message.to)));
    if let Some(subject) = &message.subject {
        out.push_str(&format!("Subject: {}\r\n", header_value(subject)));
    }
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n");
    out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    out.push_str(&message.body);
    out
}

impl MessagePart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn plain_text(&self) -> Option<String> {
        if self.mime_type == "text/plain" && self.filename.is_empty() {
            if let Some(text) = self.body.data.as_deref().and_then(decode_body) {
                return Some(text);
            }
        }
        self.parts.iter().find_map(MessagePart::plain_text)
    }

    fn collect_attachments(&self, message_id: &str, out: &mut Vec<Attachment>) {
        if let (false, Some(attachment_id)) = (self.filename.is_empty(), &self.body.attachment_id) {
            out.push(
                Attachment::new(format!("gmail:{}/{}", message_id, attachment_id))
                    .with_filename(self.filename.clone())
                    .with_content_type(self.mime_type.clone())
                    .with_size(self.body.size),
            );
        }
        for part in &self.parts {
            part.collect_attachments(message_id, out);
        }
    }
}

impl GmailMessage {
    fn is_own(&self) -> bool {
        self.label_ids
            .iter()
            .any(|l| OWN_LABELS.contains(&l.as_str()))
    }

    fn into_parsed(self) -> Result<ParsedMessage> {
        let from = self
            .payload
            .header("From")
            .ok_or_else(|| InboxError::MalformedPayload(format!("gmail message {} has no From", self.id)))?
            .to_string();
        let body = self
            .payload
            .plain_text()
            .unwrap_or_else(|| self.snippet.clone());

        let mut parsed = ParsedMessage::new(
            Platform::Email,
            from.clone(),
            body.trim_end(),
            self.thread_id.clone(),
            self.id.clone(),
        );
        if let Some(to) = self.payload.header("To") {
            parsed = parsed.with_to(to);
        }
        if let Some(subject) = self.payload.header("Subject") {
            parsed = parsed.with_subject(subject);
        }
        if let Some(name) = display_name(&from) {
            parsed = parsed.with_display_name(name);
        }
        if let Some(at) = self
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
        {
            parsed = parsed.with_timestamp(at);
        }

        let mut headers = Metadata::new();
        for name in ["Message-ID", "In-Reply-To", "References"] {
            if let Some(value) = self.payload.header(name) {
                headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        if !headers.is_empty() {
            parsed.metadata.insert("headers".into(), Value::Object(headers));
        }

        let mut attachments = Vec::new();
        self.payload.collect_attachments(&self.id, &mut attachments);
        parsed.attachments = attachments;
        Ok(parsed)
    }
}

impl ForwardedEmail {
    fn into_parsed(self) -> ParsedMessage {
        let header = |name: &str| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        // Without a native thread id, thread on the first referenced message
        let thread_key = self
            .thread_id
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| {
                header("References")
                    .and_then(|r| r.split_whitespace().next().map(str::to_string))
            })
            .or_else(|| header("In-Reply-To"))
            .unwrap_or_else(|| self.message_id.clone());

        let mut parsed = ParsedMessage::new(
            Platform::Email,
            self.from.clone(),
            self.text.clone().unwrap_or_default(),
            thread_key,
            self.message_id.clone(),
        );
        if let Some(to) = &self.to {
            parsed = parsed.with_to(to.clone());
        }
        if let Some(subject) = &self.subject {
            parsed = parsed.with_subject(subject.clone());
        }
        if let Some(name) = display_name(&self.from) {
            parsed = parsed.with_display_name(name);
        }
        if let Some(date) = self.date {
            parsed = parsed.with_timestamp(date);
        }
        if !self.headers.is_empty() {
            let headers: Metadata = self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            parsed.metadata.insert("headers".into(), Value::Object(headers));
        }
        for (i, a) in self.attachments.into_iter().enumerate() {
            let location = a
                .location
                .unwrap_or_else(|| format!("email:{}/{}", self.message_id, i));
            let mut attachment = Attachment::new(location);
            attachment.filename = a.filename;
            attachment.content_type = a.content_type;
            attachment.size = a.size;
            parsed = parsed.with_attachment(attachment);
        }
        parsed
    }
}

impl EmailProvider {
    pub fn new(settings: ChannelSettings, ingestor: Arc<Ingestor>) -> Result<Self> {
        let client = http_client(&settings)?;
        Ok(Self {
            settings,
            ingestor,
            client,
            history: DashMap::new(),
        })
    }

    fn config(config: &ChannelConfig) -> Result<&EmailConfig> {
        match config {
            ChannelConfig::Email(c) => Ok(c),
            other => Err(InboxError::Config(format!(
                "expected an email integration, got {}",
                other.platform()
            ))),
        }
    }

    /// Last history id processed for a mailbox
    pub fn history_cursor(&self, user_id: &str, address: &str) -> Option<u64> {
        self.history
            .get(&(user_id.to_string(), address.to_lowercase()))
            .map(|v| *v)
    }

    fn decode_push(body: &[u8]) -> Result<PushPayload> {
        let envelope: PushEnvelope = serde_json::from_slice(body)
            .map_err(|e| InboxError::MalformedPayload(format!("pubsub envelope: {}", e)))?;
        let data = envelope
            .message
            .data
            .ok_or_else(|| InboxError::MalformedPayload("pubsub message has no data".into()))?;
        let bytes = STANDARD
            .decode(data.trim())
            .or_else(|_| URL_SAFE_NO_PAD.decode(data.trim().trim_end_matches('=')))
            .map_err(|e| InboxError::MalformedPayload(format!("pubsub data: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| InboxError::MalformedPayload(format!("pubsub payload: {}", e)))
    }

    /// GET a Gmail API path; `Ok(None)` on 404
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        cfg: &EmailConfig,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let resp = self
            .client
            .get(format!("{}/{}", cfg.api_base, path))
            .bearer_auth(&cfg.access_token)
            .query(query)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(error_for_status("gmail", resp).await?.json().await?))
    }

    /// Ids of messages added since `start`, or `None` if the cursor expired
    async fn added_since(&self, cfg: &EmailConfig, start: u64) -> Result<Option<Vec<String>>> {
        let query = [
            ("startHistoryId", start.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("labelId", "INBOX".to_string()),
        ];
        let Some(list) = self
            .get::<HistoryList>(cfg, "users/me/history", &query)
            .await?
        else {
            return Ok(None);
        };
        let mut ids: Vec<String> = Vec::new();
        for added in list.history.into_iter().flat_map(|h| h.messages_added) {
            let skip = added
                .message
                .label_ids
                .iter()
                .any(|l| OWN_LABELS.contains(&l.as_str()));
            if !skip && !ids.contains(&added.message.id) {
                ids.push(added.message.id);
            }
        }
        Ok(Some(ids))
    }

    async fn recent(&self, cfg: &EmailConfig) -> Result<Vec<String>> {
        let query = [
            ("labelIds", "INBOX".to_string()),
            ("maxResults", RECENT_LIMIT.to_string()),
        ];
        let list = self
            .get::<MessageList>(cfg, "users/me/messages", &query)
            .await?;
        Ok(list
            .map(|l| l.messages.into_iter().map(|m| m.id).collect())
            .unwrap_or_default())
    }

    async fn on_notification(
        &self,
        integration: &Integration,
        cfg: &EmailConfig,
        notification: MailboxNotification,
    ) -> Result<WebhookEvent> {
        if !notification
            .email_address
            .eq_ignore_ascii_case(&cfg.address)
        {
            return Ok(WebhookEvent::Ignored(format!(
                "notification for {}",
                notification.email_address
            )));
        }
        let Some(new_cursor) = history_id(&notification.history_id) else {
            return Err(InboxError::MalformedPayload("invalid historyId".into()));
        };

        let key = (integration.user_id.clone(), cfg.address.to_lowercase());
        let cursor = self.history.get(&key).map(|v| *v);
        if cursor.is_some_and(|c| c >= new_cursor) {
            return Ok(WebhookEvent::Ignored("history already processed".into()));
        }

        let ids = match cursor {
            Some(start) => match self.added_since(cfg, start).await? {
                Some(ids) => ids,
                None => {
                    tracing::warn!(
                        user_id = %integration.user_id,
                        start_history_id = start,
                        "Gmail history cursor expired, listing recent messages"
                    );
                    self.recent(cfg).await?
                }
            },
            None => self.recent(cfg).await?,
        };

        let mut messages = Vec::new();
        for id in ids {
            let query = [("format", "full".to_string())];
            let Some(message) = self
                .get::<GmailMessage>(cfg, &format!("users/me/messages/{}", id), &query)
                .await?
            else {
                continue;
            };
            if message.is_own() {
                continue;
            }
            match message.into_parsed() {
                Ok(parsed) => messages.push(parsed),
                Err(e) => tracing::warn!(
                    user_id = %integration.user_id,
                    gmail_id = %id,
                    error = %e,
                    "Skipping unparseable Gmail message"
                ),
            }
        }

        // With messages to store, the cursor moves in `on_ingested`
        if messages.is_empty() {
            self.advance_cursor(key, new_cursor);
            Ok(WebhookEvent::Ignored("no new messages".into()))
        } else {
            Ok(WebhookEvent::Inbound(messages))
        }
    }

    fn advance_cursor(&self, key: (String, String), history_id: u64) {
        self.history
            .entry(key)
            .and_modify(|c| *c = (*c).max(history_id))
            .or_insert(history_id);
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn platform(&self) -> Platform {
        Platform::Email
    }

    fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    fn verify(&self, integration: &Integration, request: &WebhookRequest) -> AuthOutcome {
        match Self::config(&integration.config) {
            Ok(cfg) => PushTokenAuth::new(cfg.push_token.clone())
                .verify_request(request, Utc::now().timestamp()),
            Err(e) => AuthOutcome::Rejected {
                reason: e.to_string(),
            },
        }
    }

    async fn parse(
        &self,
        integration: &Integration,
        request: &WebhookRequest,
    ) -> Result<WebhookEvent> {
        let cfg = Self::config(&integration.config)?;
        match Self::decode_push(&request.body)? {
            PushPayload::Forwarded(email) => Ok(WebhookEvent::Inbound(vec![email.into_parsed()])),
            PushPayload::Notification(notification) => {
                self.on_notification(integration, cfg, notification).await
            }
        }
    }

    async fn deliver(&self, config: &ChannelConfig, message: &OutboundMessage) -> Result<Delivery> {
        let cfg = Self::config(config)?;
        if message.to.trim().is_empty() {
            return Err(InboxError::Config("email recipient is empty".into()));
        }
        let raw = URL_SAFE_NO_PAD.encode(rfc2822(&cfg.address, message));
        let mut payload = serde_json::json!({ "raw": raw });
        if let Some(thread) = &message.thread_key {
            payload["threadId"] = Value::String(thread.clone());
        }

        let resp = self
            .client
            .post(format!("{}/users/me/messages/send", cfg.api_base))
            .bearer_auth(&cfg.access_token)
            .json(&payload)
            .send()
            .await?;
        let sent: SentMessage = error_for_status("gmail", resp).await?.json().await?;

        let mut delivery = Delivery::new(Platform::Email, sent.id);
        delivery.thread_key = sent.thread_id;
        Ok(delivery)
    }

    async fn probe(&self, config: &ChannelConfig) -> Result<Value> {
        let cfg = Self::config(config)?;
        let profile = self
            .get::<Profile>(cfg, "users/me/profile", &[])
            .await?
            .ok_or_else(|| InboxError::provider("gmail", "profile not found"))?;
        Ok(serde_json::json!({
            "emailAddress": profile.email_address,
            "messagesTotal": profile.messages_total,
            "threadsTotal": profile.threads_total,
        }))
    }

    async fn on_ingested(&self, integration: &Integration, request: &WebhookRequest) -> Result<()> {
        let cfg = Self::config(&integration.config)?;
        let Ok(PushPayload::Notification(notification)) = Self::decode_push(&request.body) else {
            return Ok(());
        };
        if !notification
            .email_address
            .eq_ignore_ascii_case(&cfg.address)
        {
            return Ok(());
        }
        if let Some(history_id) = history_id(&notification.history_id) {
            self.advance_cursor(
                (integration.user_id.clone(), cfg.address.to_lowercase()),
                history_id,
            );
        }
        Ok(())
    }
}
