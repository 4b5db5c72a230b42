//! Cross-platform audience context
//!
//! `AudienceContextAggregator` pulls analytics from every connected
//! source, `merge` folds them into totals and rankings, and `recommend`
//! derives the suggestions shown next to them.

pub mod aggregator;
pub mod merge;
pub mod recommend;
pub mod source;
pub mod types;

pub use aggregator::{AnalyticsSource, AudienceContextAggregator};
pub use recommend::generate_recommendations;
pub use source::HttpAnalyticsSource;
pub use types::{
    AudienceContext, AudienceSummary, Cohort, CohortAnalysis, DataQuality, DataSource,
    Demographics, IcpInsights, IcpSegment, PerformanceMetrics, PlatformAnalytics, Recommendation,
    RecommendationKind, SourceStatus,
};
