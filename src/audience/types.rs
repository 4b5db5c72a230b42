//! Audience context model

use crate::types::{Priority, Provider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How far a source's numbers can be trusted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    #[default]
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Connected,
    Error,
    Expired,
}

/// Connection health of one provider in an aggregation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    pub status: SourceStatus,
    pub data_quality: DataQuality,
    /// Reach this source contributed to the totals
    pub reach: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts per bucket, e.g. `"25-34" -> 1200`
pub type Buckets = BTreeMap<String, u64>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    #[serde(default)]
    pub age: Buckets,
    #[serde(default)]
    pub gender: Buckets,
    #[serde(default)]
    pub location: Buckets,
}

/// Audience segment reported by a platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    pub id: String,
    pub name: String,
    /// Filled in by the aggregator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub size: u64,
    /// 0–100
    pub performance_score: f64,
}

/// Ideal-customer-profile segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpSegment {
    pub name: String,
    /// 0–1 fit against the profile
    pub match_score: f64,
    pub size: u64,
    /// Whether any campaign already targets it
    #[serde(default)]
    pub targeted: bool,
}

/// What one analytics source returned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformAnalytics {
    #[serde(default)]
    pub reach: u64,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub conversions: u64,
    #[serde(default)]
    pub spend: f64,
    #[serde(default)]
    pub revenue: f64,
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub cohorts: Vec<Cohort>,
    #[serde(default)]
    pub icp_segments: Vec<IcpSegment>,
    /// Quality the source reports for its own data (sampled, partial, ...)
    #[serde(default)]
    pub data_quality: DataQuality,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceSummary {
    pub total_reach: u64,
    pub total_impressions: u64,
    pub total_clicks: u64,
    pub total_conversions: u64,
    /// Summed per bucket across platforms
    pub demographics: Demographics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPerformance {
    pub provider: Provider,
    pub spend: f64,
    pub revenue: f64,
    /// revenue / spend; 0 without spend
    pub roas: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_spend: f64,
    pub total_revenue: f64,
    pub roas: f64,
    pub ctr: f64,
    pub conversion_rate: f64,
    pub by_platform: Vec<PlatformPerformance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortAnalysis {
    /// Ranked by performance score, then size
    pub cohorts: Vec<Cohort>,
}

impl CohortAnalysis {
    pub fn top(&self) -> Option<&Cohort> {
        self.cohorts.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpInsights {
    /// Merged by name, best match first
    pub segments: Vec<IcpSegment>,
}

impl IcpInsights {
    /// Segments no platform targets yet
    pub fn untapped(&self) -> impl Iterator<Item = &IcpSegment> {
        self.segments.iter().filter(|s| !s.targeted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    BudgetReallocation,
    LookalikeExpansion,
    NewTargeting,
    PlatformDiversification,
}

impl RecommendationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationKind::BudgetReallocation => "budget_reallocation",
            RecommendationKind::LookalikeExpansion => "lookalike_expansion",
            RecommendationKind::NewTargeting => "new_targeting",
            RecommendationKind::PlatformDiversification => "platform_diversification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// Stable for the same inputs, e.g. `budget_reallocation:google_ads`
    pub id: String,
    pub kind: RecommendationKind,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// 0–1
    pub confidence_score: f64,
    pub implementation_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

/// Merged cross-platform snapshot for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceContext {
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub data_sources: Vec<DataSource>,
    pub audience: AudienceSummary,
    pub cohorts: CohortAnalysis,
    pub performance: PerformanceMetrics,
    pub icp: IcpInsights,
    pub recommendations: Vec<Recommendation>,
}
