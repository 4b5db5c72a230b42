//! Rule-based recommendations
//!
//! Pure functions of the merged context: the same context always yields
//! the same recommendations in the same order.

use super::types::{AudienceContext, Recommendation, RecommendationKind, SourceStatus};
use crate::types::Priority;
use std::cmp::Ordering;

fn clamp_confidence(value: f64) -> f64 {
    (value.clamp(0.0, 0.95) * 100.0).round() / 100.0
}

fn budget_reallocation(ctx: &AudienceContext) -> Option<Recommendation> {
    let mut spending: Vec<_> = ctx
        .performance
        .by_platform
        .iter()
        .filter(|p| p.spend > 0.0)
        .collect();
    if spending.len() < 2 {
        return None;
    }
    spending.sort_by(|a, b| {
        b.roas
            .partial_cmp(&a.roas)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.provider.cmp(&b.provider))
    });
    let best = spending.first()?;
    let worst = spending.last()?;
    if best.roas <= 0.0 || best.roas <= worst.roas {
        return None;
    }

    let gap = (best.roas - worst.roas) / best.roas;
    Some(Recommendation {
        id: format!("{}:{}", RecommendationKind::BudgetReallocation.as_str(), best.provider),
        kind: RecommendationKind::BudgetReallocation,
        title: format!("Shift budget toward {}", best.provider),
        description: format!(
            "{} returns {:.2}x on spend versus {:.2}x on {}.",
            best.provider, best.roas, worst.roas, worst.provider
        ),
        priority: if best.roas >= 2.0 * worst.roas {
            Priority::High
        } else {
            Priority::Normal
        },
        confidence_score: clamp_confidence(0.5 + 0.4 * gap),
        implementation_steps: vec![
            format!("Review campaigns on {} with the lowest return", worst.provider),
            format!("Move 10-20% of that budget to {}", best.provider),
            "Compare return on spend again after two weeks".to_string(),
        ],
        provider: Some(best.provider),
    })
}

fn lookalike_expansion(ctx: &AudienceContext) -> Option<Recommendation> {
    let top = ctx.cohorts.top()?;
    let score = top.performance_score.clamp(0.0, 100.0);
    Some(Recommendation {
        id: format!("{}:{}", RecommendationKind::LookalikeExpansion.as_str(), top.id),
        kind: RecommendationKind::LookalikeExpansion,
        title: format!("Build a lookalike audience from \"{}\"", top.name),
        description: format!(
            "\"{}\" is the best performing cohort (score {:.0}, {} people).",
            top.name, score, top.size
        ),
        priority: if score >= 80.0 {
            Priority::High
        } else {
            Priority::Normal
        },
        confidence_score: clamp_confidence(score / 100.0 * 0.9),
        implementation_steps: vec![
            format!("Export \"{}\" as a seed audience", top.name),
            "Create a 1-3% lookalike audience from the seed".to_string(),
            "Launch a test campaign with a capped daily budget".to_string(),
        ],
        provider: top.provider,
    })
}

fn new_targeting(ctx: &AudienceContext) -> Option<Recommendation> {
    let segment = ctx.icp.untapped().next()?;
    Some(Recommendation {
        id: format!(
            "{}:{}",
            RecommendationKind::NewTargeting.as_str(),
            segment.name.to_lowercase()
        ),
        kind: RecommendationKind::NewTargeting,
        title: format!("Target the \"{}\" segment", segment.name),
        description: format!(
            "\"{}\" matches the ideal customer profile at {:.0}% and no campaign targets it yet.",
            segment.name,
            segment.match_score * 100.0
        ),
        priority: if segment.match_score >= 0.8 {
            Priority::High
        } else {
            Priority::Normal
        },
        confidence_score: clamp_confidence(segment.match_score * 0.85),
        implementation_steps: vec![
            format!("Define targeting criteria for \"{}\"", segment.name),
            "Draft messaging for the segment's main pain points".to_string(),
            "Launch on the platform with the best return on spend".to_string(),
        ],
        provider: None,
    })
}

fn diversification(ctx: &AudienceContext, threshold: usize) -> Option<Recommendation> {
    let connected = ctx
        .data_sources
        .iter()
        .filter(|s| s.status == SourceStatus::Connected)
        .count();
    if connected >= threshold {
        return None;
    }
    Some(Recommendation {
        id: RecommendationKind::PlatformDiversification.as_str().to_string(),
        kind: RecommendationKind::PlatformDiversification,
        title: "Reach your audience on more platforms".to_string(),
        description: format!(
            "Data is coming from {} platform(s); at least {} give a more reliable picture.",
            connected, threshold
        ),
        priority: if connected == 0 {
            Priority::High
        } else {
            Priority::Normal
        },
        confidence_score: if connected <= 1 { 0.75 } else { 0.6 },
        implementation_steps: vec![
            "Connect another advertising or messaging platform".to_string(),
            "Start with a small test budget there".to_string(),
        ],
        provider: None,
    })
}

/// Derive recommendations from a merged context
pub fn generate_recommendations(
    ctx: &AudienceContext,
    diversification_threshold: usize,
) -> Vec<Recommendation> {
    let mut out: Vec<Recommendation> = [
        budget_reallocation(ctx),
        lookalike_expansion(ctx),
        new_targeting(ctx),
        diversification(ctx, diversification_threshold),
    ]
    .into_iter()
    .flatten()
    .collect();

    out.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| {
                b.confidence_score
                    .partial_cmp(&a.confidence_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}
