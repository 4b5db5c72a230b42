//! Merging per-platform analytics
//!
//! Counts are summed, never averaged. Callers wanting percentages divide
//! by the summed totals themselves.

use super::types::{
    AudienceSummary, Buckets, Cohort, CohortAnalysis, Demographics, IcpInsights, IcpSegment,
    PerformanceMetrics, PlatformAnalytics, PlatformPerformance,
};
use crate::types::Provider;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Everything derived from the successful fetches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Merged {
    pub audience: AudienceSummary,
    pub performance: PerformanceMetrics,
    pub cohorts: CohortAnalysis,
    pub icp: IcpInsights,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn add_buckets(into: &mut Buckets, from: &Buckets) {
    for (bucket, count) in from {
        let slot = into.entry(bucket.clone()).or_default();
        *slot = slot.saturating_add(*count);
    }
}

/// Sum demographics per bucket
pub fn sum_demographics<'a>(all: impl IntoIterator<Item = &'a Demographics>) -> Demographics {
    let mut out = Demographics::default();
    for d in all {
        add_buckets(&mut out.age, &d.age);
        add_buckets(&mut out.gender, &d.gender);
        add_buckets(&mut out.location, &d.location);
    }
    out
}

/// Order by performance score desc, then size desc, then id
pub fn rank_cohorts(mut cohorts: Vec<Cohort>) -> Vec<Cohort> {
    cohorts.sort_by(|a, b| {
        b.performance_score
            .partial_cmp(&a.performance_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| a.id.cmp(&b.id))
    });
    cohorts
}

/// Merge ICP segments by name
///
/// Keeps the best match score, sums sizes, and counts a segment as
/// targeted when any platform targets it.
pub fn merge_icp<'a>(all: impl IntoIterator<Item = &'a IcpSegment>) -> Vec<IcpSegment> {
    let mut by_name: BTreeMap<String, IcpSegment> = BTreeMap::new();
    for segment in all {
        by_name
            .entry(segment.name.to_lowercase())
            .and_modify(|s| {
                s.match_score = s.match_score.max(segment.match_score);
                s.size = s.size.saturating_add(segment.size);
                s.targeted |= segment.targeted;
            })
            .or_insert_with(|| segment.clone());
    }
    let mut segments: Vec<IcpSegment> = by_name.into_values().collect();
    segments.sort_by(|a, b| {
        b.match_score
            .partial_cmp(&a.match_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| a.name.cmp(&b.name))
    });
    segments
}

/// Merge the analytics of every successful source
pub fn merge(results: &[(Provider, PlatformAnalytics)]) -> Merged {
    let mut audience = AudienceSummary::default();
    let mut performance = PerformanceMetrics::default();
    let mut cohorts = Vec::new();

    for (provider, a) in results {
        // Counters come from third parties; saturate instead of overflowing
        audience.total_reach = audience.total_reach.saturating_add(a.reach);
        audience.total_impressions = audience.total_impressions.saturating_add(a.impressions);
        audience.total_clicks = audience.total_clicks.saturating_add(a.clicks);
        audience.total_conversions = audience.total_conversions.saturating_add(a.conversions);

        performance.total_spend += a.spend;
        performance.total_revenue += a.revenue;
        performance.by_platform.push(PlatformPerformance {
            provider: *provider,
            spend: a.spend,
            revenue: a.revenue,
            roas: ratio(a.revenue, a.spend),
        });

        cohorts.extend(a.cohorts.iter().cloned().map(|mut c| {
            c.provider.get_or_insert(*provider);
            c
        }));
    }

    audience.demographics = sum_demographics(results.iter().map(|(_, a)| &a.demographics));
    performance.roas = ratio(performance.total_revenue, performance.total_spend);
    performance.ctr = ratio(audience.total_clicks as f64, audience.total_impressions as f64);
    performance.conversion_rate =
        ratio(audience.total_conversions as f64, audience.total_clicks as f64);

    Merged {
        audience,
        performance,
        cohorts: CohortAnalysis {
            cohorts: rank_cohorts(cohorts),
        },
        icp: IcpInsights {
            segments: merge_icp(results.iter().flat_map(|(_, a)| a.icp_segments.iter())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cohort(id: &str, score: f64, size: u64) -> Cohort {
        Cohort {
            id: id.into(),
            name: id.into(),
            provider: None,
            size,
            performance_score: score,
        }
    }

    fn segment(name: &str, score: f64, size: u64, targeted: bool) -> IcpSegment {
        IcpSegment {
            name: name.into(),
            match_score: score,
            size,
            targeted,
        }
    }

    #[test]
    fn test_demographics_sum_per_bucket() {
        let mut a = Demographics::default();
        a.age.insert("25-34".into(), 100);
        a.gender.insert("female".into(), 60);
        let mut b = Demographics::default();
        b.age.insert("25-34".into(), 50);
        b.age.insert("35-44".into(), 10);

        let sum = sum_demographics([&a, &b]);
        assert_eq!(sum.age["25-34"], 150);
        assert_eq!(sum.age["35-44"], 10);
        assert_eq!(sum.gender["female"], 60);
    }

    #[test]
    fn test_cohort_ranking_ties_break_on_size() {
        let ranked = rank_cohorts(vec![
            cohort("a", 80.0, 100),
            cohort("b", 90.0, 10),
            cohort("c", 80.0, 500),
            cohort("d", 80.0, 500),
        ]);
        let ids: Vec<_> = ranked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn test_icp_merge_by_name() {
        let merged = merge_icp(&[
            segment("SMB Founders", 0.7, 100, false),
            segment("smb founders", 0.9, 50, true),
            segment("Agencies", 0.8, 10, false),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].match_score, 0.9);
        assert_eq!(merged[0].size, 150);
        assert!(merged[0].targeted);
        assert_eq!(merged[1].name, "Agencies");
    }

    #[test]
    fn test_merge_saturates_huge_counters() {
        let mut demographics = Demographics::default();
        demographics.age.insert("18-24".into(), u64::MAX);
        let huge = PlatformAnalytics {
            reach: u64::MAX,
            impressions: u64::MAX - 1,
            clicks: 10,
            demographics,
            icp_segments: vec![segment("Agencies", 0.5, u64::MAX, false)],
            ..Default::default()
        };
        let small = PlatformAnalytics {
            reach: 5,
            impressions: 5,
            clicks: 10,
            demographics: huge.demographics.clone(),
            icp_segments: vec![segment("Agencies", 0.6, 7, false)],
            ..Default::default()
        };

        let merged = merge(&[(Provider::GoogleAds, huge), (Provider::MetaAds, small)]);
        assert_eq!(merged.audience.total_reach, u64::MAX);
        assert_eq!(merged.audience.total_impressions, u64::MAX);
        assert_eq!(merged.audience.total_clicks, 20);
        assert_eq!(merged.audience.demographics.age["18-24"], u64::MAX);
        assert_eq!(merged.icp.segments[0].size, u64::MAX);
    }

    #[test]
    fn test_merge_totals_and_ratios() {
        let google = PlatformAnalytics {
            reach: 1000,
            impressions: 10_000,
            clicks: 500,
            conversions: 50,
            spend: 100.0,
            revenue: 400.0,
            cohorts: vec![cohort("g1", 70.0, 10)],
            ..Default::default()
        };
        let meta = PlatformAnalytics {
            reach: 2000,
            impressions: 10_000,
            clicks: 500,
            conversions: 0,
            spend: 100.0,
            revenue: 0.0,
            ..Default::default()
        };
        let merged = merge(&[(Provider::GoogleAds, google), (Provider::MetaAds, meta)]);
        assert_eq!(merged.audience.total_reach, 3000);
        assert_eq!(merged.performance.roas, 2.0);
        assert_eq!(merged.performance.ctr, 0.05);
        assert_eq!(merged.performance.conversion_rate, 0.05);
        assert_eq!(merged.performance.by_platform[0].roas, 4.0);
        assert_eq!(merged.cohorts.cohorts[0].provider, Some(Provider::GoogleAds));
    }

    #[test]
    fn test_merge_empty() {
        let merged = merge(&[]);
        assert_eq!(merged.audience.total_reach, 0);
        assert_eq!(merged.performance.roas, 0.0);
        assert!(merged.cohorts.top().is_none());
    }
}
