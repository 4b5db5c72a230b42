//! Twilio SMS and WhatsApp provider

use super::auth::{AuthOutcome, ChannelAuth, TwilioAuth, WebhookRequest};
use super::{
    http_client, ChannelConfig, ChannelProvider, Delivery, Integration, OutboundMessage,
    SmsConfig, WebhookEvent,
};
use crate::config::ChannelSettings;
use crate::error::{InboxError, Result};
use crate::ingest::Ingestor;
use crate::resolver::normalize_external_id;
use crate::types::{Attachment, MessageStatus, ParsedMessage, Platform, StatusUpdate};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const WHATSAPP_PREFIX: &str = "whatsapp:";

/// Twilio Programmable Messaging provider
pub struct SmsProvider {
    settings: ChannelSettings,
    ingestor: Arc<Ingestor>,
    client: reqwest::Client,
}

/// Map a Twilio message status onto the canonical ladder
pub fn map_status(status: &str) -> Option<MessageStatus> {
    match status {
        "accepted" | "scheduled" | "queued" | "sending" => Some(MessageStatus::Queued),
        "sent" => Some(MessageStatus::Sent),
        "delivered" => Some(MessageStatus::Delivered),
        "read" => Some(MessageStatus::Read),
        "failed" | "undelivered" | "canceled" => Some(MessageStatus::Failed),
        "received" | "receiving" => Some(MessageStatus::Received),
        _ => None,
    }
}

fn platform_of(address: &str) -> Platform {
    if address.starts_with(WHATSAPP_PREFIX) {
        Platform::Whatsapp
    } else {
        Platform::Sms
    }
}

fn with_prefix(address: &str, whatsapp: bool) -> String {
    let address = address.trim();
    if whatsapp && !address.starts_with(WHATSAPP_PREFIX) {
        format!("{}{}", WHATSAPP_PREFIX, address)
    } else {
        address.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioApiError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioAccount {
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl SmsProvider {
    pub fn new(settings: ChannelSettings, ingestor: Arc<Ingestor>) -> Result<Self> {
        let client = http_client(&settings)?;
        Ok(Self {
            settings,
            ingestor,
            client,
        })
    }

    fn config(config: &ChannelConfig) -> Result<&SmsConfig> {
        match config {
            ChannelConfig::Sms(c) => Ok(c),
            other => Err(InboxError::Config(format!(
                "expected an sms integration, got {}",
                other.platform()
            ))),
        }
    }

    /// Read a Twilio response, turning error bodies into `code message`
    async fn read<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let body = resp.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<TwilioApiError>(&body) {
            Ok(TwilioApiError {
                code: Some(code),
                message,
            }) => format!("{} {}", code, message.unwrap_or_default()),
            _ => format!("HTTP {}", status.as_u16()),
        };
        Err(InboxError::provider("twilio", reason.trim().to_string()))
    }

    fn inbound(params: &BTreeMap<String, String>) -> Result<ParsedMessage> {
        let field = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();
        let from = field("From");
        let sid = params
            .get("MessageSid")
            .or_else(|| params.get("SmsMessageSid"))
            .map(String::as_str)
            .unwrap_or_default();
        if from.is_empty() || sid.is_empty() {
            return Err(InboxError::MalformedPayload(
                "twilio message without From or MessageSid".into(),
            ));
        }

        let platform = platform_of(from);
        let thread_key = normalize_external_id(platform, from);
        let mut parsed = ParsedMessage::new(platform, from, field("Body"), thread_key, sid)
            .with_to(field("To"))
            .with_timestamp(Utc::now());
        if let Some(name) = params.get("ProfileName").filter(|n| !n.is_empty()) {
            parsed = parsed.with_display_name(name.clone());
        }

        let media: usize = field("NumMedia").parse().unwrap_or(0);
        for i in 0..media {
            let Some(url) = params.get(&format!("MediaUrl{}", i)) else {
                continue;
            };
            let mut attachment = Attachment::new(url.clone());
            attachment.content_type = params.get(&format!("MediaContentType{}", i)).cloned();
            parsed = parsed.with_attachment(attachment);
        }
        Ok(parsed)
    }
}

#[async_trait]
impl ChannelProvider for SmsProvider {
    fn platform(&self) -> Platform {
        Platform::Sms
    }

    fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    fn verify(&self, integration: &Integration, request: &WebhookRequest) -> AuthOutcome {
        match Self::config(&integration.config) {
            Ok(cfg) => TwilioAuth::new(
                cfg.account_sid.clone(),
                cfg.auth_token.clone(),
                cfg.webhook_url.clone(),
            )
            .verify_request(request, Utc::now().timestamp()),
            Err(e) => AuthOutcome::Rejected {
                reason: e.to_string(),
            },
        }
    }

    async fn parse(
        &self,
        _integration: &Integration,
        request: &WebhookRequest,
    ) -> Result<WebhookEvent> {
        let params = request.form_params();
        if params.is_empty() {
            return Err(InboxError::MalformedPayload("empty twilio form".into()));
        }

        let reported = params
            .get("MessageStatus")
            .or_else(|| params.get("SmsStatus"))
            .map(String::as_str);
        match reported.map(|s| (s, map_status(s))) {
            None | Some((_, Some(MessageStatus::Received))) => {
                Ok(WebhookEvent::Inbound(vec![Self::inbound(&params)?]))
            }
            Some((raw, None)) => Ok(WebhookEvent::Ignored(format!("status {}", raw))),
            Some((_, Some(status))) => {
                let Some(sid) = params.get("MessageSid").or_else(|| params.get("SmsSid")) else {
                    return Err(InboxError::MalformedPayload(
                        "status callback without MessageSid".into(),
                    ));
                };
                let error = params.get("ErrorCode").filter(|c| !c.is_empty()).map(|code| {
                    match params.get("ErrorMessage").filter(|m| !m.is_empty()) {
                        Some(message) => format!("{} {}", code, message),
                        None => code.clone(),
                    }
                });
                let from = params.get("From").map(String::as_str).unwrap_or_default();
                Ok(WebhookEvent::Status(vec![StatusUpdate {
                    platform: platform_of(from),
                    platform_message_id: sid.clone(),
                    status,
                    error,
                }]))
            }
        }
    }

    async fn deliver(&self, config: &ChannelConfig, message: &OutboundMessage) -> Result<Delivery> {
        let cfg = Self::config(config)?;
        let whatsapp = message.to.trim().starts_with(WHATSAPP_PREFIX)
            || cfg.from_number.starts_with(WHATSAPP_PREFIX);
        let platform = if whatsapp {
            Platform::Whatsapp
        } else {
            Platform::Sms
        };

        let mut form = vec![
            ("To".to_string(), with_prefix(&message.to, whatsapp)),
            ("From".to_string(), with_prefix(&cfg.from_number, whatsapp)),
            ("Body".to_string(), message.body.clone()),
        ];
        if let Some(callback) = &cfg.status_callback_url {
            form.push(("StatusCallback".into(), callback.clone()));
        }
        for attachment in &message.attachments {
            form.push(("MediaUrl".into(), attachment.location.clone()));
        }

        tracing::debug!(platform = %platform, "Sending Twilio message");
        let resp = self
            .client
            .post(format!(
                "{}/Accounts/{}/Messages.json",
                cfg.api_base, cfg.account_sid
            ))
            .basic_auth(&cfg.account_sid, Some(&cfg.auth_token))
            .form(&form)
            .send()
            .await?;
        let sent: TwilioMessage = Self::read(resp).await?;

        let mut delivery = Delivery::new(platform, sent.sid);
        delivery.status = sent
            .status
            .as_deref()
            .and_then(map_status)
            .filter(|s| *s != MessageStatus::Received)
            .unwrap_or(MessageStatus::Queued);
        Ok(delivery)
    }

    async fn probe(&self, config: &ChannelConfig) -> Result<serde_json::Value> {
        let cfg = Self::config(config)?;
        let resp = self
            .client
            .get(format!("{}/Accounts/{}.json", cfg.api_base, cfg.account_sid))
            .basic_auth(&cfg.account_sid, Some(&cfg.auth_token))
            .send()
            .await?;
        let account: TwilioAccount = Self::read(resp).await?;
        Ok(serde_json::json!({
            "friendlyName": account.friendly_name,
            "status": account.status,
            "type": account.kind,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::auth::twilio_signature;
    use crate::channels::WebhookResponse;
    use crate::events::BroadcastSink;
    use crate::ingest::OutboundRecord;
    use crate::resolver::ContactConversationResolver;
    use crate::store::{ContactStore, ConversationStore, MemoryStore, MessageStore, Store};
    use crate::types::{Metadata, Provider};

    const URL: &str = "https://inbox.example.com/webhooks/sms/u1";

    fn setup() -> (Arc<MemoryStore>, SmsProvider) {
        let store = Arc::new(MemoryStore::new());
        let resolver = ContactConversationResolver::new(store.clone(), store.clone(), 120);
        let ingestor = Ingestor::new(resolver, store.clone(), Arc::new(BroadcastSink::default()));
        let provider = SmsProvider::new(ChannelSettings::default(), Arc::new(ingestor)).unwrap();
        (store, provider)
    }

    fn integration() -> Integration {
        Integration {
            user_id: "u1".into(),
            provider: Provider::Twilio,
            config: ChannelConfig::Sms(SmsConfig {
                account_sid: "AC123".into(),
                auth_token: "token".into(),
                from_number: "+15550000000".into(),
                webhook_url: Some(URL.into()),
                status_callback_url: None,
                api_base: "http://localhost".into(),
            }),
        }
    }

    fn signed(pairs: &[(&str, &str)]) -> WebhookRequest {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        let params: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WebhookRequest::new(body).with_header("X-Twilio-Signature", twilio_signature("token", URL, &params))
    }

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("undelivered"), Some(MessageStatus::Failed));
        assert_eq!(map_status("sending"), Some(MessageStatus::Queued));
        assert_eq!(map_status("received"), Some(MessageStatus::Received));
        assert_eq!(map_status("mystery"), None);
    }

    #[tokio::test]
    async fn test_inbound_sms_with_media() {
        let (store, provider) = setup();
        let request = signed(&[
            ("AccountSid", "AC123"),
            ("Body", "photo attached"),
            ("From", "+1 (555) 123-4567"),
            ("MediaContentType0", "image/jpeg"),
            ("MediaUrl0", "https://api.twilio.com/media/ME1"),
            ("MessageSid", "SM1"),
            ("NumMedia", "1"),
            ("SmsStatus", "received"),
            ("To", "+15550000000"),
        ]);
        let resp = provider.process_webhook(&request, &integration()).await.unwrap();
        assert!(matches!(resp, WebhookResponse::Accepted { .. }));

        let message = store
            .find_by_platform_id("u1", Platform::Sms, "SM1")
            .await
            .unwrap()
            .unwrap();
        let conversation = store.get_conversation(&message.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.thread_key, "15551234567");
        assert_eq!(
            message.metadata["attachments"][0]["location"],
            "https://api.twilio.com/media/ME1"
        );
    }

    #[tokio::test]
    async fn test_whatsapp_inbound_platform() {
        let (store, provider) = setup();
        let request = signed(&[
            ("AccountSid", "AC123"),
            ("Body", "hola"),
            ("From", "whatsapp:+15551234567"),
            ("MessageSid", "SM2"),
            ("ProfileName", "Maria"),
            ("To", "whatsapp:+15550000000"),
        ]);
        provider.process_webhook(&request, &integration()).await.unwrap();
        assert!(store
            .find_by_platform_id("u1", Platform::Whatsapp, "SM2")
            .await
            .unwrap()
            .is_some());
        let contact = store
            .find_contact("u1", Platform::Whatsapp, "15551234567")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.display_name.as_deref(), Some("Maria"));
    }

    #[tokio::test]
    async fn test_delivery_receipt_updates_outbound() {
        let (store, provider) = setup();
        provider
            .ingestor()
            .record_outbound(
                "u1",
                OutboundRecord {
                    platform: Platform::Sms,
                    to: "+15551234567".into(),
                    conversation_id: None,
                    thread_key: None,
                    body: "your code is 1234".into(),
                    platform_message_id: Some("SM123".into()),
                    status: MessageStatus::Sent,
                    metadata: Metadata::new(),
                },
            )
            .await
            .unwrap();
        let before = store.stats().await.unwrap();

        let request = signed(&[
            ("AccountSid", "AC123"),
            ("From", "+15550000000"),
            ("MessageSid", "SM123"),
            ("MessageStatus", "delivered"),
            ("To", "+15551234567"),
        ]);
        let resp = provider.process_webhook(&request, &integration()).await.unwrap();
        assert_eq!(resp, WebhookResponse::StatusApplied { applied: 1 });

        let message = store
            .find_by_platform_id("u1", Platform::Sms, "SM123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(store.stats().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_receipt_carries_error() {
        let (_, provider) = setup();
        let request = signed(&[
            ("AccountSid", "AC123"),
            ("ErrorCode", "30003"),
            ("ErrorMessage", "Unreachable destination handset"),
            ("From", "+15550000000"),
            ("MessageSid", "SM9"),
            ("MessageStatus", "undelivered"),
        ]);
        let event = provider.parse(&integration(), &request).await.unwrap();
        let WebhookEvent::Status(updates) = event else {
            panic!("expected status event");
        };
        assert_eq!(updates[0].status, MessageStatus::Failed);
        assert_eq!(
            updates[0].error.as_deref(),
            Some("30003 Unreachable destination handset")
        );
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let (store, provider) = setup();
        let mut request = signed(&[("From", "+15551234567"), ("MessageSid", "SM1")]);
        request.body = b"From=%2B15559999999&MessageSid=SM1".to_vec();
        let resp = provider.process_webhook(&request, &integration()).await.unwrap();
        assert!(matches!(resp, WebhookResponse::Rejected(_)));
        assert_eq!(store.stats().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_missing_sid_dropped() {
        let (_, provider) = setup();
        let request = signed(&[("AccountSid", "AC123"), ("Body", "hi"), ("From", "+15551234567")]);
        let resp = provider.process_webhook(&request, &integration()).await.unwrap();
        assert!(matches!(resp, WebhookResponse::Dropped(_)));
    }

    #[test]
    fn test_with_prefix() {
        assert_eq!(with_prefix("+1555", true), "whatsapp:+1555");
        assert_eq!(with_prefix("whatsapp:+1555", true), "whatsapp:+1555");
        assert_eq!(with_prefix(" +1555 ", false), "+1555");
    }
}
