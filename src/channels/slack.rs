//! Slack channel provider

use super::auth::{AuthOutcome, ChannelAuth, SlackAuth, WebhookRequest};
use super::{
    error_for_status, http_client, ChannelConfig, ChannelProvider, Delivery, Integration,
    OutboundMessage, SlackConfig, WebhookEvent,
};
use crate::config::ChannelSettings;
use crate::error::{InboxError, Result};
use crate::ingest::Ingestor;
use crate::types::{Attachment, ParsedMessage, Platform};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// Subtypes that still carry a user-authored message
const ACCEPTED_SUBTYPES: &[&str] = &["file_share", "thread_broadcast"];

/// Slack Events API provider
pub struct SlackProvider {
    settings: ChannelSettings,
    ingestor: Arc<Ingestor>,
    client: reqwest::Client,
}

impl SlackProvider {
    pub fn new(settings: ChannelSettings, ingestor: Arc<Ingestor>) -> Result<Self> {
        let client = http_client(&settings)?;
        Ok(Self {
            settings,
            ingestor,
            client,
        })
    }

    fn config(config: &ChannelConfig) -> Result<&SlackConfig> {
        match config {
            ChannelConfig::Slack(c) => Ok(c),
            other => Err(InboxError::Config(format!(
                "expected a slack integration, got {}",
                other.platform()
            ))),
        }
    }

    /// Split an outbound target into channel and optional thread_ts
    fn target(message: &OutboundMessage) -> Result<(String, Option<String>)> {
        if let Some(key) = message.thread_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(match key.split_once(':') {
                Some((channel, ts)) => (channel.to_string(), Some(ts.to_string())),
                None => (key.to_string(), None),
            });
        }
        let to = message.to.trim();
        if to.is_empty() {
            return Err(InboxError::Config("slack channel is empty".into()));
        }
        Ok((to.to_string(), None))
    }

    async fn call(&self, bot_token: &str, url: String, body: serde_json::Value) -> Result<SlackApiResponse> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(bot_token)
            .json(&body)
            .send()
            .await?;
        let result: SlackApiResponse = error_for_status("slack", resp).await?.json().await?;
        if !result.ok {
            return Err(InboxError::provider(
                "slack",
                result.error.unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        Ok(result)
    }
}

/// Outer Events API envelope
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackEnvelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        #[serde(default)]
        team_id: Option<String>,
        event: SlackEvent,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
    #[serde(default)]
    user_profile: Option<SlackUserProfile>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    url_private: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackUserProfile {
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Slack `ts` values are `seconds.micros`
fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

impl SlackEvent {
    fn into_message(self) -> std::result::Result<ParsedMessage, String> {
        if !matches!(self.kind.as_str(), "message" | "app_mention") {
            return Err(format!("event type {}", self.kind));
        }
        if self.bot_id.is_some() {
            return Err("bot message".into());
        }
        if let Some(subtype) = self.subtype.as_deref() {
            if !ACCEPTED_SUBTYPES.contains(&subtype) {
                return Err(format!("subtype {}", subtype));
            }
        }
        let (Some(channel), Some(user), Some(ts)) = (self.channel, self.user, self.ts) else {
            return Err("message without channel, user or ts".into());
        };

        let thread_key = match self.thread_ts.as_deref() {
            Some(parent) if parent != ts => format!("{}:{}", channel, parent),
            _ => channel.clone(),
        };
        let mut parsed = ParsedMessage::new(
            Platform::Slack,
            user,
            self.text,
            thread_key,
            format!("slack_{}", ts),
        )
        .with_to(channel);
        if let Some(at) = parse_ts(&ts) {
            parsed = parsed.with_timestamp(at);
        }
        if let Some(name) = self.user_profile.and_then(|p| {
            p.display_name
                .filter(|n| !n.is_empty())
                .or(p.real_name.filter(|n| !n.is_empty()))
        }) {
            parsed = parsed.with_display_name(name);
        }
        for file in self.files {
            let mut attachment = Attachment::new(
                file.url_private
                    .unwrap_or_else(|| format!("slack:file/{}", file.id)),
            );
            attachment.filename = file.name;
            attachment.content_type = file.mimetype;
            attachment.size = file.size;
            parsed = parsed.with_attachment(attachment);
        }
        Ok(parsed)
    }
}

#[async_trait]
impl ChannelProvider for SlackProvider {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    fn verify(&self, integration: &Integration, request: &WebhookRequest) -> AuthOutcome {
        match Self::config(&integration.config) {
            Ok(cfg) => SlackAuth::new(cfg.signing_secret.clone())
                .with_max_age(self.settings.signature_max_age_secs)
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
        let envelope: SlackEnvelope = serde_json::from_slice(&request.body)
            .map_err(|e| InboxError::MalformedPayload(format!("slack event: {}", e)))?;

        match envelope {
            SlackEnvelope::UrlVerification { challenge } => Ok(WebhookEvent::Challenge(challenge)),
            SlackEnvelope::Other => Ok(WebhookEvent::Ignored("unsupported envelope".into())),
            SlackEnvelope::EventCallback { team_id, event } => {
                let expected = Self::config(&integration.config)?.team_id.as_deref();
                if let (Some(expected), Some(actual)) = (expected, team_id.as_deref()) {
                    if expected != actual {
                        return Ok(WebhookEvent::Ignored(format!("team {}", actual)));
                    }
                }
                match event.into_message() {
                    Ok(parsed) => Ok(WebhookEvent::Inbound(vec![parsed])),
                    Err(reason) => Ok(WebhookEvent::Ignored(reason)),
                }
            }
        }
    }

    async fn deliver(&self, config: &ChannelConfig, message: &OutboundMessage) -> Result<Delivery> {
        let cfg = Self::config(config)?;
        let (channel, thread_ts) = Self::target(message)?;

        let mut payload = serde_json::json!({
            "channel": channel,
            "text": message.body,
        });
        if let Some(ts) = &thread_ts {
            payload["thread_ts"] = serde_json::Value::String(ts.clone());
        }

        tracing::debug!(channel = %channel, "Sending Slack message");
        let result = self
            .call(
                &cfg.bot_token,
                format!("{}/chat.postMessage", cfg.api_base),
                payload,
            )
            .await?;

        let ts = result
            .ts
            .ok_or_else(|| InboxError::provider("slack", "chat.postMessage returned no ts"))?;
        let channel = result.channel.unwrap_or(channel);
        let mut delivery = Delivery::new(Platform::Slack, format!("slack_{}", ts));
        delivery.thread_key = Some(match thread_ts {
            Some(parent) => format!("{}:{}", channel, parent),
            None => channel,
        });
        Ok(delivery)
    }

    async fn probe(&self, config: &ChannelConfig) -> Result<serde_json::Value> {
        let cfg = Self::config(config)?;
        let result = self
            .call(
                &cfg.bot_token,
                format!("{}/auth.test", cfg.api_base),
                serde_json::json!({}),
            )
            .await?;
        Ok(serde_json::json!({
            "team": result.team,
            "teamId": result.team_id,
            "user": result.user,
            "url": result.url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::auth::slack_signature;
    use crate::channels::WebhookResponse;
    use crate::events::BroadcastSink;
    use crate::resolver::ContactConversationResolver;
    use crate::store::{ContactStore, MemoryStore, MessageStore, Store};
    use crate::types::Provider;

    fn provider(store: Arc<MemoryStore>) -> SlackProvider {
        let resolver = ContactConversationResolver::new(store.clone(), store.clone(), 120);
        let ingestor = Ingestor::new(resolver, store, Arc::new(BroadcastSink::default()));
        SlackProvider::new(ChannelSettings::default(), Arc::new(ingestor)).unwrap()
    }

    fn integration() -> Integration {
        Integration {
            user_id: "u1".into(),
            provider: Provider::Slack,
            config: ChannelConfig::Slack(SlackConfig {
                bot_token: "xoxb-test".into(),
                signing_secret: "secret".into(),
                team_id: Some("T1".into()),
                api_base: "http://localhost".into(),
            }),
        }
    }

    fn signed(body: &str) -> WebhookRequest {
        let ts = Utc::now().timestamp().to_string();
        let sig = slack_signature("secret", &ts, body.as_bytes());
        WebhookRequest::new(body)
            .with_header("X-Slack-Request-Timestamp", ts)
            .with_header("X-Slack-Signature", sig)
    }

    const HELLO: &str = r#"{"type":"event_callback","team_id":"T1","event":{"type":"message","channel":"C1","user":"U1","text":"hello","ts":"1000.001"}}"#;

    #[test]
    fn test_parse_ts() {
        let at = parse_ts("1000.001").unwrap();
        assert_eq!(at.timestamp(), 1000);
        assert_eq!(at.timestamp_subsec_micros(), 1000);
        assert!(parse_ts("abc").is_none());
    }

    #[tokio::test]
    async fn test_url_verification() {
        let store = Arc::new(MemoryStore::new());
        let body = r#"{"type":"url_verification","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"}"#;
        let resp = provider(store)
            .process_webhook(&signed(body), &integration())
            .await
            .unwrap();
        assert_eq!(
            resp,
            WebhookResponse::Challenge(
                "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P".into()
            )
        );
    }

    #[tokio::test]
    async fn test_message_event_is_ingested() {
        let store = Arc::new(MemoryStore::new());
        let resp = provider(store.clone())
            .process_webhook(&signed(HELLO), &integration())
            .await
            .unwrap();
        assert!(matches!(resp, WebhookResponse::Accepted { .. }));

        let contact = store
            .find_contact("u1", Platform::Slack, "U1")
            .await
            .unwrap()
            .unwrap();
        let message = store
            .find_by_platform_id("u1", Platform::Slack, "slack_1000.001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.contact_id, contact.id);
        assert_eq!(message.timestamp.timestamp(), 1000);
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut request = signed(HELLO);
        request.body = HELLO.replace("hello", "hacked").into_bytes();
        let resp = provider(store.clone())
            .process_webhook(&request, &integration())
            .await
            .unwrap();
        assert!(matches!(resp, WebhookResponse::Rejected(_)));
        assert_eq!(store.stats().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_bot_and_edit_events_ignored() {
        let store = Arc::new(MemoryStore::new());
        let p = provider(store.clone());
        let bot = r#"{"type":"event_callback","event":{"type":"message","channel":"C1","bot_id":"B1","text":"echo","ts":"1.0"}}"#;
        let edit = r#"{"type":"event_callback","event":{"type":"message","subtype":"message_changed","channel":"C1","ts":"2.0"}}"#;
        for body in [bot, edit] {
            let resp = p.process_webhook(&signed(body), &integration()).await.unwrap();
            assert!(matches!(resp, WebhookResponse::Ignored(_)), "{:?}", resp);
        }
        assert_eq!(store.stats().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_other_team_ignored() {
        let store = Arc::new(MemoryStore::new());
        let body = HELLO.replace("\"T1\"", "\"T2\"");
        let resp = provider(store)
            .process_webhook(&signed(&body), &integration())
            .await
            .unwrap();
        assert!(matches!(resp, WebhookResponse::Ignored(_)));
    }

    #[test]
    fn test_threaded_reply_and_files() {
        let event: SlackEvent = serde_json::from_str(
            r#"{"type":"message","subtype":"file_share","channel":"C1","user":"U2","text":"see file",
                "ts":"1001.5","thread_ts":"1000.001",
                "user_profile":{"real_name":"Ada Lovelace","display_name":""},
                "files":[{"id":"F1","name":"report.pdf","mimetype":"application/pdf","size":2048,
                          "url_private":"https://files.slack.com/F1"}]}"#,
        )
        .unwrap();
        let parsed = event.into_message().unwrap();
        assert_eq!(parsed.thread_key, "C1:1000.001");
        assert_eq!(parsed.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].location, "https://files.slack.com/F1");
        assert_eq!(parsed.attachments[0].size, Some(2048));
    }

    #[test]
    fn test_thread_parent_uses_channel_key() {
        let event: SlackEvent = serde_json::from_str(
            r#"{"type":"message","channel":"C1","user":"U1","text":"root","ts":"1000.001","thread_ts":"1000.001"}"#,
        )
        .unwrap();
        assert_eq!(event.into_message().unwrap().thread_key, "C1");
    }

    #[tokio::test]
    async fn test_malformed_body_dropped() {
        let store = Arc::new(MemoryStore::new());
        let resp = provider(store)
            .process_webhook(&signed("{not json"), &integration())
            .await
            .unwrap();
        assert!(matches!(resp, WebhookResponse::Dropped(_)));
    }

    #[test]
    fn test_outbound_target() {
        let msg = OutboundMessage::new("C9", "hi").in_thread("C1:1000.001");
        assert_eq!(
            SlackProvider::target(&msg).unwrap(),
            ("C1".to_string(), Some("1000.001".to_string()))
        );
        let msg = OutboundMessage::new(" C9 ", "hi");
        assert_eq!(SlackProvider::target(&msg).unwrap(), ("C9".to_string(), None));
        assert!(SlackProvider::target(&OutboundMessage::new("", "hi")).is_err());
    }
}
