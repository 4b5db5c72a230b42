//! Service wiring
//!
//! `InboxService` owns one instance of every component and hands out
//! references to them. Nothing is global: tests build a service over an
//! in-memory store with a fixed key, the binary builds one from
//! `InboxConfig`.

use crate::audience::{AnalyticsSource, AudienceContext, AudienceContextAggregator, HttpAnalyticsSource};
use crate::channels::{
    provider_for_channel, ChannelProvider, ChannelRegistry, ConnectionTest, Integration,
    OutboundMessage, SendResult, WebhookRequest, WebhookResponse,
};
use crate::classify::MessageClassifier;
use crate::config::{resolve_secret, AudienceSettings, ChannelSettings, InboxConfig};
use crate::credential::DecryptedCredential;
use crate::crypto::CredentialCipher;
use crate::error::{InboxError, Result};
use crate::events::{BroadcastSink, InboxEvent};
use crate::ingest::Ingestor;
use crate::oauth::{OAuthApp, OAuthTokenClient, TokenRefresher};
use crate::resolver::ContactConversationResolver;
use crate::store::{
    ContactStore, ConversationStore, CredentialStore, MemoryStore, MessageStore, Store, StoreStats,
};
use crate::types::Provider;
use crate::vault::CredentialVault;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Store handle split into the per-concern trait objects
#[derive(Clone)]
struct StoreHandles {
    all: Arc<dyn Store>,
    credentials: Arc<dyn CredentialStore>,
    contacts: Arc<dyn ContactStore>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
}

impl StoreHandles {
    fn new<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            all: store.clone(),
            credentials: store.clone(),
            contacts: store.clone(),
            conversations: store.clone(),
            messages: store,
        }
    }
}

pub struct InboxService {
    store: Arc<dyn Store>,
    vault: Arc<CredentialVault>,
    ingestor: Arc<Ingestor>,
    registry: ChannelRegistry,
    aggregator: AudienceContextAggregator,
    events: Arc<BroadcastSink>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl InboxService {
    pub fn builder(cipher: Arc<dyn CredentialCipher>) -> InboxServiceBuilder {
        InboxServiceBuilder::new(cipher)
    }

    /// Build a service over an in-memory store from configuration
    pub fn from_config(config: &InboxConfig) -> Result<Self> {
        let cipher = Arc::new(config.encryption.build_cipher()?);
        let mut builder = Self::builder(cipher)
            .channel_settings(config.channels.clone())
            .audience_settings(config.audience.clone());

        for source in &config.audience.sources {
            builder = builder.analytics_source(Arc::new(HttpAnalyticsSource::new(
                source.provider,
                source.endpoint.clone(),
                config.audience.fetch_timeout(),
            )?));
        }

        if !config.oauth.apps.is_empty() {
            let mut client =
                OAuthTokenClient::new(Duration::from_millis(config.oauth.timeout_ms))?;
            for app in &config.oauth.apps {
                let secret = resolve_secret(&app.client_secret)?;
                let oauth_app = match (&app.token_url, app.provider) {
                    (Some(url), _) => OAuthApp::new(url.clone(), app.client_id.clone(), secret),
                    (None, Provider::Gmail | Provider::GoogleAds | Provider::Youtube) => {
                        OAuthApp::google(app.client_id.clone(), secret)
                    }
                    (None, Provider::Slack) => OAuthApp::slack(app.client_id.clone(), secret),
                    (None, other) => {
                        return Err(InboxError::Config(format!(
                            "oauth app for {} needs a token_url",
                            other
                        )))
                    }
                };
                client = client.with_app(app.provider, oauth_app);
            }
            builder = builder.token_refresher(Arc::new(client));
        }

        builder.build()
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &AudienceContextAggregator {
        &self.aggregator
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    pub async fn health(&self) -> bool {
        self.store.health().await.unwrap_or(false)
    }

    async fn credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<DecryptedCredential>> {
        match &self.refresher {
            Some(refresher) => match self.vault.get_fresh(user_id, provider, refresher.as_ref()).await {
                Err(e) if !e.is_internal() => {
                    // Fall back to the stored token; the provider call reports it if stale
                    tracing::warn!(user_id = %user_id, provider = %provider, error = %e, "Token refresh failed");
                    self.vault.get(user_id, provider).await
                }
                other => other,
            },
            None => self.vault.get(user_id, provider).await,
        }
    }

    /// Channel provider and integration for a connected provider
    ///
    /// `None` when the user has no usable credential for it.
    pub async fn connection(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<(Arc<dyn ChannelProvider>, Integration)>> {
        let Some(channel) = self.registry.get(provider) else {
            return Ok(None);
        };
        let Some(credential) = self.credential(user_id, provider).await? else {
            return Ok(None);
        };
        match Integration::from_credential(&credential, channel.settings()) {
            Ok(integration) => Ok(Some((channel, integration))),
            Err(e) if e.is_internal() => Err(e),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    error = %e,
                    "Stored credential is not a usable integration"
                );
                Ok(None)
            }
        }
    }

    /// Route a webhook to its channel provider
    ///
    /// Returns `None` when the channel is unknown or not connected for
    /// `user_id`.
    pub async fn handle_webhook(
        &self,
        channel: &str,
        user_id: &str,
        request: &WebhookRequest,
    ) -> Result<Option<WebhookResponse>> {
        let Some(provider) = provider_for_channel(channel) else {
            tracing::debug!(channel = %channel, "Webhook for unknown channel");
            return Ok(None);
        };
        let Some((provider_impl, integration)) = self.connection(user_id, provider).await? else {
            tracing::info!(user_id = %user_id, channel = %channel, "Webhook for unconnected channel");
            return Ok(None);
        };
        provider_impl
            .process_webhook(request, &integration)
            .await
            .map(Some)
    }

    pub async fn send_message(
        &self,
        user_id: &str,
        provider: Provider,
        message: &OutboundMessage,
    ) -> Result<SendResult> {
        match self.connection(user_id, provider).await? {
            Some((channel, integration)) => channel.send_message(&integration, message).await,
            None => Ok(SendResult::failed(format!("{} is not connected", provider))),
        }
    }

    pub async fn test_connection(&self, user_id: &str, provider: Provider) -> Result<ConnectionTest> {
        match self.connection(user_id, provider).await? {
            Some((channel, integration)) => Ok(channel.test_connection(&integration.config).await),
            None => Ok(ConnectionTest {
                success: false,
                details: None,
                error: Some(format!("{} is not connected", provider)),
                latency_ms: 0,
            }),
        }
    }

    pub async fn audience(&self, user_id: &str) -> Result<AudienceContext> {
        self.aggregator.build(user_id).await
    }
}

pub struct InboxServiceBuilder {
    cipher: Arc<dyn CredentialCipher>,
    store: Option<StoreHandles>,
    channels: ChannelSettings,
    audience: AudienceSettings,
    sources: Vec<Arc<dyn AnalyticsSource>>,
    classifier: Option<Arc<dyn MessageClassifier>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    registry: Option<ChannelRegistry>,
    event_capacity: usize,
}

impl InboxServiceBuilder {
    pub fn new(cipher: Arc<dyn CredentialCipher>) -> Self {
        Self {
            cipher,
            store: None,
            channels: ChannelSettings::default(),
            audience: AudienceSettings::default(),
            sources: Vec::new(),
            classifier: None,
            refresher: None,
            registry: None,
            event_capacity: 1024,
        }
    }

    /// Backing store; defaults to a fresh `MemoryStore`
    pub fn store<S: Store + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(StoreHandles::new(store));
        self
    }

    pub fn channel_settings(mut self, settings: ChannelSettings) -> Self {
        self.channels = settings;
        self
    }

    pub fn audience_settings(mut self, settings: AudienceSettings) -> Self {
        self.audience = settings;
        self
    }

    pub fn analytics_source(mut self, source: Arc<dyn AnalyticsSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn MessageClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Replace the standard providers, e.g. with fakes
    pub fn registry(mut self, registry: ChannelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<InboxService> {
        let store = self
            .store
            .unwrap_or_else(|| StoreHandles::new(Arc::new(MemoryStore::new())));
        let events = Arc::new(BroadcastSink::new(self.event_capacity.max(1)));

        let resolver = ContactConversationResolver::new(
            store.contacts.clone(),
            store.conversations.clone(),
            self.channels.preview_max_chars,
        );
        let mut ingestor = Ingestor::new(resolver, store.messages.clone(), events.clone());
        if let Some(classifier) = self.classifier {
            ingestor = ingestor.with_classifier(classifier);
        }
        let ingestor = Arc::new(ingestor);

        let registry = match self.registry {
            Some(registry) => registry,
            None => ChannelRegistry::standard(&self.channels, ingestor.clone())?,
        };

        let vault = Arc::new(CredentialVault::new(store.credentials.clone(), self.cipher));
        let aggregator = self
            .sources
            .into_iter()
            .fold(AudienceContextAggregator::new(vault.clone(), self.audience), |agg, source| {
                agg.with_source(source)
            });

        tracing::info!(
            analytics_sources = ?aggregator.providers(),
            token_refresh = self.refresher.is_some(),
            "Inbox service ready"
        );

        Ok(InboxService {
            store: store.all,
            vault,
            ingestor,
            registry,
            aggregator,
            events,
            refresher: self.refresher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::auth::slack_signature;
    use crate::credential::{AccountInfo, CredentialPayload, ProviderType};
    use crate::crypto::Aes256GcmCipher;
    use crate::types::Platform;

    fn service() -> (Arc<MemoryStore>, InboxService) {
        let store = Arc::new(MemoryStore::new());
        let service = InboxService::builder(Arc::new(Aes256GcmCipher::new("k1", &[9u8; 32])))
            .store(store.clone())
            .build()
            .unwrap();
        (store, service)
    }

    async fn connect_slack(service: &InboxService) {
        service
            .vault()
            .store(
                "u1",
                Provider::Slack,
                CredentialPayload::oauth("xoxb-1", None).with_extra("signingSecret", "shh"),
                ProviderType::Oauth,
                Some(AccountInfo::new("T1", "Acme")),
            )
            .await
            .unwrap();
    }

    fn slack_request(body: &str) -> WebhookRequest {
        let ts = chrono::Utc::now().timestamp().to_string();
        let sig = slack_signature("shh", &ts, body.as_bytes());
        WebhookRequest::new(body.as_bytes().to_vec())
            .with_header("X-Slack-Request-Timestamp", ts)
            .with_header("X-Slack-Signature", sig)
    }

    #[tokio::test]
    async fn test_unknown_channel_is_none() {
        let (_, service) = service();
        let resp = service
            .handle_webhook("pager", "u1", &WebhookRequest::new(b"{}".to_vec()))
            .await
            .unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_unconnected_channel_is_none() {
        let (_, service) = service();
        let resp = service
            .handle_webhook("slack", "u1", &slack_request("{}"))
            .await
            .unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_slack_webhook_routed_and_stored() {
        let (store, service) = service();
        connect_slack(&service).await;
        let mut events = service.subscribe();

        let body = r#"{"type":"event_callback","team_id":"T1","event":{"type":"message","user":"U1","channel":"C1","text":"hello","ts":"1000.001"}}"#;
        let resp = service
            .handle_webhook("slack", "u1", &slack_request(body))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(resp, WebhookResponse::Accepted { .. }));

        let contact = store
            .find_contact("u1", Platform::Slack, "U1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.external_id, "U1");
        let message = store
            .find_by_platform_id("u1", Platform::Slack, "slack_1000.001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.content, "hello");

        let event = events.recv().await.unwrap();
        assert_eq!(event.message_id, message.id);
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_use_credential() {
        let (_, service) = service();
        connect_slack(&service).await;
        let resp = service
            .handle_webhook("slack", "u2", &slack_request("{}"))
            .await
            .unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_incomplete_credential_treated_as_unconnected() {
        let (_, service) = service();
        service
            .vault()
            .store(
                "u1",
                Provider::Twilio,
                CredentialPayload::api_key("AC1", None),
                ProviderType::ApiKey,
                None,
            )
            .await
            .unwrap();
        assert!(service.connection("u1", Provider::Twilio).await.unwrap().is_none());

        let result = service
            .send_message("u1", Provider::Twilio, &OutboundMessage::new("+15550001111", "hi"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_test_connection_unconnected() {
        let (_, service) = service();
        let result = service.test_connection("u1", Provider::Gmail).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let (_, service) = service();
        connect_slack(&service).await;
        assert!(service.health().await);
        assert_eq!(service.stats().await.unwrap().credentials, 1);
    }
}
