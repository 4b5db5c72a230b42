//! HTTP analytics source

use super::aggregator::AnalyticsSource;
use super::types::PlatformAnalytics;
use crate::credential::DecryptedCredential;
use crate::error::{InboxError, Result};
use crate::types::Provider;
use async_trait::async_trait;
use std::time::Duration;

/// Fetches `PlatformAnalytics` JSON from an endpoint with the credential's token
///
/// The endpoint is expected to front the provider's reporting API and
/// return the canonical shape.
pub struct HttpAnalyticsSource {
    provider: Provider,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAnalyticsSource {
    pub fn new(provider: Provider, endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provider,
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl AnalyticsSource for HttpAnalyticsSource {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch(&self, credential: &DecryptedCredential) -> Result<PlatformAnalytics> {
        let token = credential
            .payload
            .access_token
            .as_deref()
            .or(credential.payload.api_key.as_deref())
            .ok_or_else(|| {
                InboxError::Config(format!("{} credential has no token", self.provider))
            })?;

        let mut request = self.client.get(&self.endpoint).bearer_auth(token);
        if let Some(account_id) = &credential.credential.account_id {
            request = request.query(&[("accountId", account_id)]);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InboxError::provider(
                self.provider.as_str(),
                format!("analytics HTTP {}", status.as_u16()),
            ));
        }
        Ok(resp.json().await?)
    }
}
