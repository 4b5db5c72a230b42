//! Audience context aggregation
//!
//! Fans out to every connected analytics source in parallel. Each fetch
//! is isolated: a failing or slow source contributes nothing to the
//! totals and shows up as a low-quality `DataSource` instead of failing
//! the whole build.

use super::merge::merge;
use super::recommend::generate_recommendations;
use super::types::{AudienceContext, DataQuality, DataSource, PlatformAnalytics, SourceStatus};
use crate::config::AudienceSettings;
use crate::credential::{Credential, DecryptedCredential};
use crate::error::{InboxError, Result};
use crate::types::Provider;
use crate::vault::CredentialVault;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Analytics endpoint of one provider
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    fn provider(&self) -> Provider;

    async fn fetch(&self, credential: &DecryptedCredential) -> Result<PlatformAnalytics>;
}

pub struct AudienceContextAggregator {
    vault: Arc<CredentialVault>,
    sources: HashMap<Provider, Arc<dyn AnalyticsSource>>,
    settings: AudienceSettings,
    cache: DashMap<String, (Instant, AudienceContext)>,
}

impl AudienceContextAggregator {
    pub fn new(vault: Arc<CredentialVault>, settings: AudienceSettings) -> Self {
        Self {
            vault,
            sources: HashMap::new(),
            settings,
            cache: DashMap::new(),
        }
    }

    /// Register a source; replaces any earlier one for the same provider
    pub fn with_source(mut self, source: Arc<dyn AnalyticsSource>) -> Self {
        self.sources.insert(source.provider(), source);
        self
    }

    /// Providers with a registered source
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.sources.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Drop the cached context of a user
    pub fn invalidate(&self, user_id: &str) {
        self.cache.remove(user_id);
    }

    fn cached(&self, user_id: &str) -> Option<AudienceContext> {
        let ttl = self.settings.cache_ttl()?;
        let entry = self.cache.get(user_id)?;
        let (at, context) = entry.value();
        (at.elapsed() < ttl).then(|| context.clone())
    }

    /// Build the merged context for a user
    pub async fn build(&self, user_id: &str) -> Result<AudienceContext> {
        if let Some(context) = self.cached(user_id) {
            tracing::debug!(user_id = %user_id, "Audience context served from cache");
            return Ok(context);
        }

        let started = Instant::now();
        let credentials: Vec<(Credential, Arc<dyn AnalyticsSource>)> = self
            .vault
            .list_integrations(user_id)
            .await?
            .into_iter()
            .filter_map(|c| self.sources.get(&c.provider).cloned().map(|s| (c, s)))
            .collect();

        let fetches = credentials
            .iter()
            .map(|(credential, source)| self.fetch_one(user_id, credential, source.as_ref()));
        let mut outcomes = join_all(fetches)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        outcomes.sort_by_key(|(source, _)| source.provider);

        let successes: Vec<(Provider, PlatformAnalytics)> = outcomes
            .iter()
            .filter_map(|(source, analytics)| analytics.clone().map(|a| (source.provider, a)))
            .collect();
        let merged = merge(&successes);

        let mut context = AudienceContext {
            user_id: user_id.to_string(),
            generated_at: Utc::now(),
            data_sources: outcomes.into_iter().map(|(source, _)| source).collect(),
            audience: merged.audience,
            cohorts: merged.cohorts,
            performance: merged.performance,
            icp: merged.icp,
            recommendations: Vec::new(),
        };
        context.recommendations =
            generate_recommendations(&context, self.settings.diversification_threshold);

        tracing::info!(
            user_id = %user_id,
            sources = context.data_sources.len(),
            succeeded = successes.len(),
            total_reach = context.audience.total_reach,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Audience context built"
        );

        if self.settings.cache_ttl().is_some() {
            self.cache
                .insert(user_id.to_string(), (Instant::now(), context.clone()));
        }
        Ok(context)
    }

    /// Fetch one source; only store faults come back as `Err`
    async fn fetch_one(
        &self,
        user_id: &str,
        credential: &Credential,
        source: &dyn AnalyticsSource,
    ) -> Result<(DataSource, Option<PlatformAnalytics>)> {
        let provider = credential.provider;
        let mut entry = DataSource {
            provider,
            account_name: credential.account_name.clone(),
            status: SourceStatus::Error,
            data_quality: DataQuality::Low,
            reach: 0,
            last_synced_at: credential.last_synced_at,
            error: None,
        };

        if CredentialVault::is_expired(credential) {
            entry.status = SourceStatus::Expired;
            entry.error = Some("credential expired".into());
            return Ok((entry, None));
        }

        let Some(decrypted) = self.vault.get(user_id, provider).await? else {
            entry.error = Some("credential unavailable".into());
            return Ok((entry, None));
        };

        let timeout = self.settings.fetch_timeout();
        let result = match tokio::time::timeout(timeout, source.fetch(&decrypted)).await {
            Ok(result) => result,
            Err(_) => Err(InboxError::Timeout(format!(
                "{} analytics after {:?}",
                provider, timeout
            ))),
        };

        match result {
            Ok(analytics) => {
                if let Err(e) = self.vault.mark_synced(user_id, provider).await {
                    tracing::warn!(user_id = %user_id, provider = %provider, error = %e, "Could not mark credential synced");
                }
                entry.status = SourceStatus::Connected;
                entry.data_quality = analytics.data_quality;
                entry.reach = analytics.reach;
                entry.last_synced_at = Some(Utc::now());
                Ok((entry, Some(analytics)))
            }
            Err(e) if e.is_internal() => Err(e),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    error = %e,
                    "Analytics fetch failed"
                );
                entry.error = Some(e.to_string());
                Ok((entry, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialPayload, ProviderType};
    use crate::crypto::Aes256GcmCipher;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        provider: Provider,
        reach: u64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalyticsSource for FixedSource {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn fetch(&self, _: &DecryptedCredential) -> Result<PlatformAnalytics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlatformAnalytics {
                reach: self.reach,
                ..Default::default()
            })
        }
    }

    fn vault() -> Arc<CredentialVault> {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(Aes256GcmCipher::new("k1", &[3u8; 32]));
        Arc::new(CredentialVault::new(store, cipher))
    }

    fn fixed(provider: Provider, reach: u64) -> Arc<FixedSource> {
        Arc::new(FixedSource {
            provider,
            reach,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_expired_credential_not_fetched() {
        let vault = vault();
        vault
            .store(
                "u1",
                Provider::GoogleAds,
                CredentialPayload::oauth("t", None)
                    .with_expires_at(Utc::now() - chrono::Duration::hours(1)),
                ProviderType::Oauth,
                None,
            )
            .await
            .unwrap();
        let source = fixed(Provider::GoogleAds, 100);
        let aggregator = AudienceContextAggregator::new(vault, AudienceSettings::default())
            .with_source(source.clone());

        let ctx = aggregator.build("u1").await.unwrap();
        assert_eq!(ctx.data_sources[0].status, SourceStatus::Expired);
        assert_eq!(ctx.data_sources[0].data_quality, DataQuality::Low);
        assert_eq!(ctx.audience.total_reach, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_providers_skipped() {
        let vault = vault();
        vault
            .store(
                "u1",
                Provider::Slack,
                CredentialPayload::oauth("xoxb", None),
                ProviderType::Oauth,
                None,
            )
            .await
            .unwrap();
        let aggregator = AudienceContextAggregator::new(vault, AudienceSettings::default())
            .with_source(fixed(Provider::MetaAds, 1));
        let ctx = aggregator.build("u1").await.unwrap();
        assert!(ctx.data_sources.is_empty());
    }

    #[tokio::test]
    async fn test_success_marks_synced_and_caches() {
        let vault = vault();
        vault
            .store(
                "u1",
                Provider::MetaAds,
                CredentialPayload::oauth("t", None),
                ProviderType::Oauth,
                None,
            )
            .await
            .unwrap();
        let source = fixed(Provider::MetaAds, 250);
        let settings = AudienceSettings {
            cache_ttl_secs: 60,
            ..Default::default()
        };
        let aggregator =
            AudienceContextAggregator::new(vault.clone(), settings).with_source(source.clone());

        let first = aggregator.build("u1").await.unwrap();
        let second = aggregator.build("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.data_sources[0].status, SourceStatus::Connected);

        let listed = vault.list_integrations("u1").await.unwrap();
        assert!(listed[0].last_synced_at.is_some());

        aggregator.invalidate("u1");
        aggregator.build("u1").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
