//! Audience aggregation integration tests
//!
//! Builds audience contexts over connected ad platforms where some
//! sources fail or hang, and checks the failures stay isolated.

use a3s_inbox::audience::types::{Cohort, IcpSegment};
use a3s_inbox::audience::{
    AnalyticsSource, DataQuality, PlatformAnalytics, RecommendationKind, SourceStatus,
};
use a3s_inbox::config::AudienceSettings;
use a3s_inbox::{
    Aes256GcmCipher, CredentialPayload, DecryptedCredential, InboxError, InboxService,
    MemoryStore, Provider, ProviderType,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

enum Behavior {
    Return(PlatformAnalytics),
    Fail,
    Hang,
}

struct StubSource {
    provider: Provider,
    behavior: Behavior,
}

#[async_trait]
impl AnalyticsSource for StubSource {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch(&self, _credential: &DecryptedCredential) -> a3s_inbox::Result<PlatformAnalytics> {
        match &self.behavior {
            Behavior::Return(analytics) => Ok(analytics.clone()),
            Behavior::Fail => Err(InboxError::provider(self.provider.as_str(), "HTTP 500")),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(PlatformAnalytics::default())
            }
        }
    }
}

fn source(provider: Provider, behavior: Behavior) -> Arc<StubSource> {
    Arc::new(StubSource { provider, behavior })
}

fn google() -> PlatformAnalytics {
    PlatformAnalytics {
        reach: 1_000,
        impressions: 20_000,
        clicks: 400,
        conversions: 40,
        spend: 200.0,
        revenue: 1_000.0,
        cohorts: vec![Cohort {
            id: "g-returning".into(),
            name: "Returning visitors".into(),
            provider: None,
            size: 300,
            performance_score: 88.0,
        }],
        icp_segments: vec![IcpSegment {
            name: "Agencies".into(),
            match_score: 0.85,
            size: 120,
            targeted: false,
        }],
        ..Default::default()
    }
}

fn meta() -> PlatformAnalytics {
    PlatformAnalytics {
        reach: 2_500,
        impressions: 30_000,
        clicks: 600,
        conversions: 12,
        spend: 300.0,
        revenue: 450.0,
        data_quality: DataQuality::Medium,
        ..Default::default()
    }
}

async fn connect(service: &InboxService, provider: Provider) {
    service
        .vault()
        .store(
            "u1",
            provider,
            CredentialPayload::oauth(format!("{}-token", provider), None),
            ProviderType::Oauth,
            None,
        )
        .await
        .unwrap();
}

fn service(settings: AudienceSettings, sources: Vec<Arc<StubSource>>) -> InboxService {
    let mut builder = InboxService::builder(Arc::new(Aes256GcmCipher::new("k1", &[5u8; 32])))
        .store(Arc::new(MemoryStore::new()))
        .audience_settings(settings);
    for s in sources {
        builder = builder.analytics_source(s);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_failed_provider_is_isolated() {
    let service = service(
        AudienceSettings::default(),
        vec![
            source(Provider::GoogleAds, Behavior::Return(google())),
            source(Provider::MetaAds, Behavior::Return(meta())),
            source(Provider::LinkedinAds, Behavior::Fail),
        ],
    );
    for provider in [Provider::GoogleAds, Provider::MetaAds, Provider::LinkedinAds] {
        connect(&service, provider).await;
    }

    let ctx = service.audience("u1").await.unwrap();

    assert_eq!(ctx.audience.total_reach, 3_500);
    assert_eq!(ctx.data_sources.len(), 3);
    let linkedin = ctx
        .data_sources
        .iter()
        .find(|s| s.provider == Provider::LinkedinAds)
        .unwrap();
    assert_eq!(linkedin.status, SourceStatus::Error);
    assert_eq!(linkedin.data_quality, DataQuality::Low);
    assert_eq!(linkedin.reach, 0);
    assert!(linkedin.error.as_deref().unwrap().contains("HTTP 500"));

    let meta_source = ctx
        .data_sources
        .iter()
        .find(|s| s.provider == Provider::MetaAds)
        .unwrap();
    assert_eq!(meta_source.status, SourceStatus::Connected);
    assert_eq!(meta_source.data_quality, DataQuality::Medium);

    assert_eq!(ctx.performance.total_spend, 500.0);
    assert_eq!(ctx.performance.roas, 2.9);
    assert_eq!(ctx.cohorts.top().unwrap().provider, Some(Provider::GoogleAds));
}

#[tokio::test]
async fn test_hanging_provider_times_out() {
    let settings = AudienceSettings {
        fetch_timeout_ms: 50,
        ..Default::default()
    };
    let service = service(
        settings,
        vec![
            source(Provider::GoogleAds, Behavior::Return(google())),
            source(Provider::TiktokAds, Behavior::Hang),
        ],
    );
    connect(&service, Provider::GoogleAds).await;
    connect(&service, Provider::TiktokAds).await;

    let started = std::time::Instant::now();
    let ctx = service.audience("u1").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(ctx.audience.total_reach, 1_000);
    let tiktok = ctx
        .data_sources
        .iter()
        .find(|s| s.provider == Provider::TiktokAds)
        .unwrap();
    assert_eq!(tiktok.data_quality, DataQuality::Low);
    assert!(tiktok.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_recommendations_from_merged_context() {
    let service = service(
        AudienceSettings::default(),
        vec![
            source(Provider::GoogleAds, Behavior::Return(google())),
            source(Provider::MetaAds, Behavior::Return(meta())),
        ],
    );
    connect(&service, Provider::GoogleAds).await;
    connect(&service, Provider::MetaAds).await;

    let ctx = service.audience("u1").await.unwrap();
    let kinds: Vec<_> = ctx.recommendations.iter().map(|r| r.kind).collect();

    assert!(kinds.contains(&RecommendationKind::BudgetReallocation));
    assert!(kinds.contains(&RecommendationKind::LookalikeExpansion));
    assert!(kinds.contains(&RecommendationKind::NewTargeting));
    // Two connected platforms is below the default threshold of three
    assert!(kinds.contains(&RecommendationKind::PlatformDiversification));

    let budget = ctx
        .recommendations
        .iter()
        .find(|r| r.kind == RecommendationKind::BudgetReallocation)
        .unwrap();
    assert_eq!(budget.provider, Some(Provider::GoogleAds));
}

#[tokio::test]
async fn test_no_integrations_gives_empty_context() {
    let service = service(
        AudienceSettings::default(),
        vec![source(Provider::GoogleAds, Behavior::Return(google()))],
    );
    let ctx = service.audience("u1").await.unwrap();

    assert!(ctx.data_sources.is_empty());
    assert_eq!(ctx.audience.total_reach, 0);
    assert_eq!(ctx.recommendations.len(), 1);
    assert_eq!(
        ctx.recommendations[0].kind,
        RecommendationKind::PlatformDiversification
    );
}

#[tokio::test]
async fn test_removed_integration_not_fetched() {
    let service = service(
        AudienceSettings::default(),
        vec![
            source(Provider::GoogleAds, Behavior::Return(google())),
            source(Provider::MetaAds, Behavior::Return(meta())),
        ],
    );
    connect(&service, Provider::GoogleAds).await;
    connect(&service, Provider::MetaAds).await;
    service.vault().remove("u1", Provider::MetaAds).await.unwrap();

    let ctx = service.audience("u1").await.unwrap();
    assert_eq!(ctx.data_sources.len(), 1);
    assert_eq!(ctx.audience.total_reach, 1_000);
}
