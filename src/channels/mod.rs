//! Channel providers
//!
//! One `ChannelProvider` per messaging platform family. Each variant
//! supplies the platform-specific pieces (signature scheme, wire parsing,
//! send and probe calls); the trait's provided methods own the shared
//! flow so every channel verifies, dedups, threads and records the same
//! way.

pub mod auth;
pub mod email;
pub mod slack;
pub mod sms;

pub use auth::{AuthOutcome, ChannelAuth, WebhookRequest};
pub use email::EmailProvider;
pub use slack::SlackProvider;
pub use sms::SmsProvider;

use crate::config::ChannelSettings;
use crate::credential::DecryptedCredential;
use crate::error::{ErrorKind, InboxError, Result};
use crate::ingest::{IngestOutcome, Ingestor, OutboundRecord};
use crate::types::{Attachment, MessageStatus, Metadata, ParsedMessage, Platform, Provider, StatusUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Gmail connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    /// Mailbox address of the connected account
    pub address: String,
    pub access_token: String,
    /// Shared token expected on Pub/Sub pushes, if configured
    pub push_token: Option<String>,
    pub api_base: String,
}

/// Slack app settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackConfig {
    pub bot_token: String,
    pub signing_secret: String,
    pub team_id: Option<String>,
    pub api_base: String,
}

/// Twilio account settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number in E.164
    pub from_number: String,
    /// Public URL Twilio posts inbound messages to (signature base)
    pub webhook_url: Option<String>,
    /// Where delivery receipts for sent messages should go
    pub status_callback_url: Option<String>,
    pub api_base: String,
}

/// Channel connection settings, one variant per provider family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelConfig {
    Email(EmailConfig),
    Slack(SlackConfig),
    Sms(SmsConfig),
}

fn require(value: &str, field: &str, channel: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(InboxError::Config(format!(
            "{} integration is missing '{}'",
            channel, field
        )));
    }
    Ok(())
}

impl ChannelConfig {
    pub fn platform(&self) -> Platform {
        match self {
            ChannelConfig::Email(_) => Platform::Email,
            ChannelConfig::Slack(_) => Platform::Slack,
            ChannelConfig::Sms(_) => Platform::Sms,
        }
    }

    /// Check that every required field is present
    pub fn validate(&self) -> Result<()> {
        match self {
            ChannelConfig::Email(c) => {
                require(&c.address, "emailAddress", "email")?;
                require(&c.access_token, "accessToken", "email")
            }
            ChannelConfig::Slack(c) => {
                require(&c.bot_token, "accessToken", "slack")?;
                require(&c.signing_secret, "signingSecret", "slack")
            }
            ChannelConfig::Sms(c) => {
                require(&c.account_sid, "accountSid", "sms")?;
                require(&c.auth_token, "authToken", "sms")?;
                require(&c.from_number, "fromNumber", "sms")
            }
        }
    }
}

/// A user's connected channel
#[derive(Debug, Clone)]
pub struct Integration {
    pub user_id: String,
    pub provider: Provider,
    pub config: ChannelConfig,
}

impl Integration {
    /// Build the channel config from a decrypted credential
    pub fn from_credential(cred: &DecryptedCredential, settings: &ChannelSettings) -> Result<Self> {
        let p = &cred.payload;
        let owned = |v: Option<&str>| v.unwrap_or_default().to_string();

        let config = match cred.credential.provider {
            Provider::Gmail => ChannelConfig::Email(EmailConfig {
                address: owned(
                    p.extra_str("emailAddress")
                        .or(cred.credential.account_name.as_deref()),
                ),
                access_token: owned(p.access_token.as_deref()),
                push_token: p.extra_str("pushToken").map(str::to_string),
                api_base: settings.gmail_api_base.clone(),
            }),
            Provider::Slack => ChannelConfig::Slack(SlackConfig {
                bot_token: owned(p.access_token.as_deref()),
                signing_secret: owned(p.extra_str("signingSecret").or(p.api_secret.as_deref())),
                team_id: cred.credential.account_id.clone(),
                api_base: settings.slack_api_base.clone(),
            }),
            Provider::Twilio | Provider::Whatsapp => ChannelConfig::Sms(SmsConfig {
                account_sid: owned(p.extra_str("accountSid").or(p.api_key.as_deref())),
                auth_token: owned(p.extra_str("authToken").or(p.api_secret.as_deref())),
                from_number: owned(p.extra_str("fromNumber")),
                webhook_url: p.extra_str("webhookUrl").map(str::to_string),
                status_callback_url: p.extra_str("statusCallbackUrl").map(str::to_string),
                api_base: settings.twilio_api_base.clone(),
            }),
            other => {
                return Err(InboxError::Config(format!(
                    "{} is not a messaging channel",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(Self {
            user_id: cred.credential.user_id.clone(),
            provider: cred.credential.provider,
            config,
        })
    }
}

/// Map a webhook path segment onto the provider that serves it
pub fn provider_for_channel(channel: &str) -> Option<Provider> {
    match channel {
        "slack" => Some(Provider::Slack),
        "sms" => Some(Provider::Twilio),
        "whatsapp" => Some(Provider::Whatsapp),
        "email" | "gmail" => Some(Provider::Gmail),
        _ => None,
    }
}

/// Message to send through a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Recipient: phone number, email address or Slack channel id
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Conversation this message replies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Provider thread to reply in (Slack `channel:thread_ts`, Gmail threadId)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_key: Option<String>,
    /// Media URLs; only channels with URL-based media send them
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn in_thread(mut self, thread_key: impl Into<String>) -> Self {
        self.thread_key = Some(thread_key.into());
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// What the provider API returned for an accepted send
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Platform the message actually went out on (sms vs whatsapp)
    pub platform: Platform,
    pub platform_message_id: Option<String>,
    pub thread_key: Option<String>,
    pub status: MessageStatus,
    pub metadata: Metadata,
}

impl Delivery {
    pub fn new(platform: Platform, platform_message_id: impl Into<String>) -> Self {
        Self {
            platform,
            platform_message_id: Some(platform_message_id.into()),
            thread_key: None,
            status: MessageStatus::Sent,
            metadata: Metadata::new(),
        }
    }
}

/// Outcome of `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            platform_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of `test_connection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub success: bool,
    /// Account details reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// A webhook payload after parsing
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// Handshake; echo the value back
    Challenge(String),
    Inbound(Vec<ParsedMessage>),
    /// Delivery receipts for previously sent messages
    Status(Vec<StatusUpdate>),
    /// Valid but irrelevant (bot echoes, edits, typing notices)
    Ignored(String),
}

/// What `process_webhook` did; the HTTP edge maps this to a status code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
    Challenge(String),
    /// At least one new message was stored
    Accepted {
        message_ids: Vec<String>,
        duplicates: usize,
    },
    /// Every message in the payload was already stored
    Duplicate,
    StatusApplied {
        applied: usize,
    },
    Ignored(String),
    /// Authenticity check failed; nothing was read or written
    Rejected(String),
    /// Unparseable payload; logged and acknowledged so the provider stops retrying
    Dropped(String),
    /// Transient upstream failure; the provider should redeliver
    Deferred(String),
}

impl WebhookResponse {
    /// Whether the provider should consider the delivery done
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, WebhookResponse::Rejected(_) | WebhookResponse::Deferred(_))
    }
}

/// A messaging channel: authenticity, parsing, sending, probing
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Primary platform served by this provider
    fn platform(&self) -> Platform;

    /// Shared timeouts and limits
    fn settings(&self) -> &ChannelSettings;

    /// Pipeline inbound and outbound messages are recorded through
    fn ingestor(&self) -> &Ingestor;

    /// Check the request's authenticity; must not touch the store
    fn verify(&self, integration: &Integration, request: &WebhookRequest) -> AuthOutcome;

    /// Turn a verified request into canonical events
    async fn parse(&self, integration: &Integration, request: &WebhookRequest)
        -> Result<WebhookEvent>;

    /// Call the provider's send API
    async fn deliver(&self, config: &ChannelConfig, message: &OutboundMessage) -> Result<Delivery>;

    /// Call a read-only account endpoint
    async fn probe(&self, config: &ChannelConfig) -> Result<serde_json::Value>;

    /// Called once every inbound message of a request has been stored or
    /// found to be a duplicate. Providers that track a read position
    /// advance it here, so a failed ingest is fetched again on redelivery.
    async fn on_ingested(&self, _integration: &Integration, _request: &WebhookRequest) -> Result<()> {
        Ok(())
    }

    /// Send a message and record it as outbound
    ///
    /// Provider failures come back as `success: false`; only store faults
    /// are returned as `Err`.
    async fn send_message(
        &self,
        integration: &Integration,
        message: &OutboundMessage,
    ) -> Result<SendResult> {
        if let Err(e) = integration.config.validate() {
            return Ok(SendResult::failed(e.to_string()));
        }
        if message.to.trim().is_empty() && message.conversation_id.is_none() {
            return Ok(SendResult::failed("recipient is empty"));
        }

        let timeout = self.settings().request_timeout();
        let delivery =
            match tokio::time::timeout(timeout, self.deliver(&integration.config, message)).await {
                Ok(Ok(delivery)) => delivery,
                Ok(Err(e)) => {
                    tracing::warn!(
                        user_id = %integration.user_id,
                        platform = %self.platform(),
                        error = %e,
                        "Send failed"
                    );
                    return Ok(SendResult::failed(e.to_string()));
                }
                Err(_) => {
                    let e = InboxError::Timeout(format!("send after {:?}", timeout));
                    tracing::warn!(
                        user_id = %integration.user_id,
                        platform = %self.platform(),
                        "Send timed out"
                    );
                    return Ok(SendResult::failed(e.to_string()));
                }
            };

        let mut metadata = delivery.metadata.clone();
        if let Some(subject) = &message.subject {
            metadata.insert("subject".into(), serde_json::Value::String(subject.clone()));
        }
        let record = OutboundRecord {
            platform: delivery.platform,
            to: message.to.clone(),
            conversation_id: message.conversation_id.clone(),
            thread_key: delivery.thread_key.clone().or_else(|| message.thread_key.clone()),
            body: message.body.clone(),
            platform_message_id: delivery.platform_message_id.clone(),
            status: delivery.status,
            metadata,
        };
        let (message_id, error) = match self
            .ingestor()
            .record_outbound(&integration.user_id, record)
            .await
        {
            Ok(id) => (Some(id), None),
            Err(e) if e.is_internal() => return Err(e),
            Err(e) => {
                // Already sent; report it without a stored id
                tracing::warn!(
                    user_id = %integration.user_id,
                    platform = %delivery.platform,
                    error = %e,
                    "Sent message could not be recorded"
                );
                (None, Some(e.to_string()))
            }
        };

        Ok(SendResult {
            success: true,
            message_id,
            platform_message_id: delivery.platform_message_id,
            error,
        })
    }

    /// Verify, parse and ingest one webhook delivery
    async fn process_webhook(
        &self,
        request: &WebhookRequest,
        integration: &Integration,
    ) -> Result<WebhookResponse> {
        let user_id = integration.user_id.as_str();
        let platform = self.platform();

        if let AuthOutcome::Rejected { reason } = self.verify(integration, request) {
            tracing::warn!(user_id = %user_id, platform = %platform, reason = %reason, "Webhook rejected");
            return Ok(WebhookResponse::Rejected(reason));
        }

        let event = match self.parse(integration, request).await {
            Ok(event) => event,
            Err(e) => {
                return match e.kind() {
                    ErrorKind::Internal => Err(e),
                    ErrorKind::TransientProvider => {
                        tracing::warn!(user_id = %user_id, platform = %platform, error = %e, "Webhook deferred");
                        Ok(WebhookResponse::Deferred(e.to_string()))
                    }
                    _ => {
                        tracing::warn!(user_id = %user_id, platform = %platform, error = %e, "Webhook dropped");
                        Ok(WebhookResponse::Dropped(e.to_string()))
                    }
                };
            }
        };

        match event {
            WebhookEvent::Challenge(challenge) => Ok(WebhookResponse::Challenge(challenge)),
            WebhookEvent::Ignored(reason) => {
                tracing::debug!(user_id = %user_id, platform = %platform, reason = %reason, "Webhook ignored");
                Ok(WebhookResponse::Ignored(reason))
            }
            WebhookEvent::Inbound(messages) => {
                let total = messages.len();
                let mut message_ids = Vec::new();
                let mut duplicates = 0;
                for parsed in messages {
                    let pmid = parsed.platform_message_id.clone();
                    match self.ingestor().ingest(user_id, parsed).await {
                        Ok(IngestOutcome::Accepted { message_id, .. }) => message_ids.push(message_id),
                        Ok(IngestOutcome::Duplicate { .. }) => duplicates += 1,
                        Err(e) if e.is_internal() => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                user_id = %user_id,
                                platform = %platform,
                                platform_message_id = %pmid,
                                error = %e,
                                "Inbound message dropped"
                            );
                        }
                    }
                }
                self.on_ingested(integration, request).await?;

                if message_ids.is_empty() && duplicates > 0 {
                    Ok(WebhookResponse::Duplicate)
                } else if message_ids.is_empty() {
                    Ok(WebhookResponse::Dropped(format!(
                        "none of {} messages could be stored",
                        total
                    )))
                } else {
                    Ok(WebhookResponse::Accepted {
                        message_ids,
                        duplicates,
                    })
                }
            }
            WebhookEvent::Status(updates) => {
                let mut applied = 0;
                for update in updates {
                    if self.ingestor().apply_status(user_id, update).await?.is_some() {
                        applied += 1;
                    }
                }
                Ok(WebhookResponse::StatusApplied { applied })
            }
        }
    }

    /// Check the credentials against a read-only endpoint; never sends
    async fn test_connection(&self, config: &ChannelConfig) -> ConnectionTest {
        let started = Instant::now();
        let result = match config.validate() {
            Err(e) => Err(e),
            Ok(()) => {
                let timeout = self.settings().connection_test_timeout();
                match tokio::time::timeout(timeout, self.probe(config)).await {
                    Ok(result) => result,
                    Err(_) => Err(InboxError::Timeout(format!(
                        "connection test after {:?}",
                        timeout
                    ))),
                }
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(details) => ConnectionTest {
                success: true,
                details: Some(details),
                error: None,
                latency_ms,
            },
            Err(e) => ConnectionTest {
                success: false,
                details: None,
                error: Some(e.to_string()),
                latency_ms,
            },
        }
    }
}

/// Providers keyed by the platform family they serve
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    providers: std::collections::HashMap<Provider, Arc<dyn ChannelProvider>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Provider, channel: Arc<dyn ChannelProvider>) {
        self.providers.insert(provider, channel);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.get(&provider).cloned()
    }

    /// Registry with the Gmail, Slack and Twilio providers
    pub fn standard(settings: &ChannelSettings, ingestor: Arc<Ingestor>) -> Result<Self> {
        let sms: Arc<dyn ChannelProvider> = Arc::new(SmsProvider::new(settings.clone(), ingestor.clone())?);
        let mut registry = Self::new();
        registry.register(
            Provider::Gmail,
            Arc::new(EmailProvider::new(settings.clone(), ingestor.clone())?),
        );
        registry.register(
            Provider::Slack,
            Arc::new(SlackProvider::new(settings.clone(), ingestor)?),
        );
        registry.register(Provider::Twilio, sms.clone());
        registry.register(Provider::Whatsapp, sms);
        Ok(registry)
    }
}

/// reqwest client with the channel request timeout
pub(crate) fn http_client(settings: &ChannelSettings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(settings.request_timeout())
        .user_agent(concat!("a3s-inbox/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Turn a non-success provider response into a provider error
pub(crate) async fn error_for_status(
    provider: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(300).collect();
    Err(InboxError::provider(
        provider,
        format!("HTTP {}: {}", status.as_u16(), snippet),
    ))
}
