//! Credit scoring and offer generation over per-group aggregates.
//!
//! Both seams are async traits so deployments can swap in models that call
//! out to an external service. The bundled reference models are pure
//! functions of the aggregate row and the model config: [`WeightedScoreModel`]
//! blends volume, revenue share and consistency into a 300-850 score, and
//! [`TieredOfferModel`] turns the resulting risk band into loan offers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hopper_protocol::pipeline::{
    AggregateGroup, CreditModelConfig, Offer, RiskLevel, ScoreResult,
};

/// Aggregate total key holding a group's revenue-flagged volume.
pub const REVENUE_TOTAL_FIELD: &str = "revenue_amount";

/// Record field marking a transaction as revenue (as opposed to transfers,
/// refunds and other non-revenue movement).
pub const IS_REVENUE_FIELD: &str = "is_revenue";

/// Transactions per group at which the volume component saturates.
const TARGET_GROUP_TRANSACTIONS: f64 = 5.0;

/// Width of the medium-risk band below the configured risk threshold.
const RISK_BAND_WIDTH: f64 = 0.25;

const SCORE_FLOOR: f64 = 300.0;
const SCORE_CEILING: f64 = 850.0;

/// Offers below this amount are not worth originating.
const MIN_OFFER_AMOUNT: f64 = 1_000.0;

const TERM_LOAN_MULTIPLE: f64 = 2.0;
const TERM_LOAN_RATE: f64 = 0.09;
const CREDIT_LINE_MULTIPLE: f64 = 1.0;
const CREDIT_LINE_RATE: f64 = 0.12;
const WORKING_CAPITAL_MULTIPLE: f64 = 0.5;
const WORKING_CAPITAL_RATE: f64 = 0.18;

/// Produces one credit score per aggregate group.
#[async_trait]
pub trait ScoreModel: Send + Sync {
    async fn score(
        &self,
        group: &AggregateGroup,
        config: &CreditModelConfig,
    ) -> anyhow::Result<ScoreResult>;
}

/// Produces zero or more offers for a scored group.
#[async_trait]
pub trait OfferModel: Send + Sync {
    async fn offers(
        &self,
        group: &AggregateGroup,
        score: &ScoreResult,
        config: &CreditModelConfig,
    ) -> anyhow::Result<Vec<Offer>>;
}

/// Group volume excluding the revenue bucket, which is a subset of the
/// other totals rather than money of its own.
pub(crate) fn gross_total(group: &AggregateGroup) -> f64 {
    group
        .totals
        .iter()
        .filter(|(field, _)| field.as_str() != REVENUE_TOTAL_FIELD)
        .map(|(_, amount)| amount)
        .sum()
}

// ============================================================================
// Weighted score model
// ============================================================================

/// Reference scoring model: a weighted blend of three normalized components.
///
/// - `volume`: transaction count against [`TARGET_GROUP_TRANSACTIONS`].
/// - `revenue_ratio`: revenue-flagged volume over gross volume.
/// - `consistency`: evidence curve that grows with transaction count.
///
/// The blend is normalized by the configured weight total, mapped onto
/// 300-850, and banded into a risk level around `risk_threshold`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedScoreModel;

#[async_trait]
impl ScoreModel for WeightedScoreModel {
    async fn score(
        &self,
        group: &AggregateGroup,
        config: &CreditModelConfig,
    ) -> anyhow::Result<ScoreResult> {
        let count = group.record_count as f64;
        let gross = gross_total(group);
        let revenue = group.total(REVENUE_TOTAL_FIELD);

        let volume = (count / TARGET_GROUP_TRANSACTIONS).min(1.0);
        let revenue_ratio =
            if gross > 0.0 { (revenue / gross).clamp(0.0, 1.0) } else { 0.0 };
        let consistency = 1.0 - 1.0 / (1.0 + count);

        let weights = &config.weights;
        let weight_total = weights.total();
        let combined = if weight_total > 0.0 {
            (weights.volume * volume
                + weights.revenue_ratio * revenue_ratio
                + weights.consistency * consistency)
                / weight_total
        } else {
            0.0
        };

        let score = (SCORE_FLOOR + combined * (SCORE_CEILING - SCORE_FLOOR))
            .round()
            .clamp(SCORE_FLOOR, SCORE_CEILING) as u32;
        let risk_level = if combined >= config.risk_threshold {
            RiskLevel::Low
        } else if combined >= config.risk_threshold - RISK_BAND_WIDTH {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        };

        let mut components = BTreeMap::new();
        components.insert("volume".to_string(), volume);
        components.insert("revenue_ratio".to_string(), revenue_ratio);
        components.insert("consistency".to_string(), consistency);

        Ok(ScoreResult { group: group.group.clone(), score, risk_level, components })
    }
}

// ============================================================================
// Tiered offer model
// ============================================================================

/// Reference offer model: risk band picks the product mix, gross volume
/// sizes the amounts. High-risk groups get nothing; offers under
/// [`MIN_OFFER_AMOUNT`] are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TieredOfferModel;

#[async_trait]
impl OfferModel for TieredOfferModel {
    async fn offers(
        &self,
        group: &AggregateGroup,
        score: &ScoreResult,
        _config: &CreditModelConfig,
    ) -> anyhow::Result<Vec<Offer>> {
        let gross = gross_total(group);
        let candidates: Vec<(&str, f64, f64)> = match score.risk_level {
            RiskLevel::High => Vec::new(),
            RiskLevel::Medium => {
                vec![("working_capital", gross * WORKING_CAPITAL_MULTIPLE, WORKING_CAPITAL_RATE)]
            }
            RiskLevel::Low => vec![
                ("term_loan", gross * TERM_LOAN_MULTIPLE, TERM_LOAN_RATE),
                ("line_of_credit", gross * CREDIT_LINE_MULTIPLE, CREDIT_LINE_RATE),
            ],
        };

        let offers = candidates
            .into_iter()
            .filter(|(_, amount, _)| *amount >= MIN_OFFER_AMOUNT)
            .map(|(offer_type, amount, interest_rate)| Offer {
                group: group.group.clone(),
                offer_type: offer_type.to_string(),
                amount: round_cents(amount),
                interest_rate,
                credit_score: score.score,
                risk_level: score.risk_level,
            })
            .collect();
        Ok(offers)
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(count: u64, gross: f64, revenue: f64) -> AggregateGroup {
        let mut totals = BTreeMap::new();
        totals.insert("amount".to_string(), gross);
        if revenue > 0.0 {
            totals.insert(REVENUE_TOTAL_FIELD.to_string(), revenue);
        }
        AggregateGroup { group: "2024-01-01".to_string(), record_count: count, totals }
    }

    #[tokio::test]
    async fn test_strong_group_scores_low_risk() {
        let config = CreditModelConfig::default();
        let score = WeightedScoreModel
            .score(&group(10, 50_000.0, 45_000.0), &config)
            .await
            .unwrap();

        assert_eq!(score.risk_level, RiskLevel::Low);
        assert!(score.score > 700, "got {}", score.score);
        assert_eq!(score.components["volume"], 1.0);
        assert!(score.components["revenue_ratio"] > 0.89);
        assert!((300..=850).contains(&score.score));
    }

    #[tokio::test]
    async fn test_empty_group_scores_high_risk_floor() {
        let config = CreditModelConfig::default();
        let score = WeightedScoreModel.score(&group(0, 0.0, 0.0), &config).await.unwrap();

        assert_eq!(score.risk_level, RiskLevel::High);
        assert_eq!(score.score, 300);
        assert_eq!(score.components["revenue_ratio"], 0.0, "no gross means no ratio");
    }

    #[tokio::test]
    async fn test_risk_bands_follow_the_threshold() {
        let mut config = CreditModelConfig::default();
        config.risk_threshold = 0.95;
        let score = WeightedScoreModel
            .score(&group(10, 50_000.0, 45_000.0), &config)
            .await
            .unwrap();
        // Same group as the low-risk case; a stricter threshold demotes it.
        assert_eq!(score.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_consistency_saturates_with_count() {
        let config = CreditModelConfig::default();
        let few = WeightedScoreModel.score(&group(2, 1_000.0, 0.0), &config).await.unwrap();
        let many = WeightedScoreModel.score(&group(50, 1_000.0, 0.0), &config).await.unwrap();
        assert!(many.components["consistency"] > few.components["consistency"]);
        assert!(many.components["consistency"] < 1.0);
    }

    #[tokio::test]
    async fn test_low_risk_gets_two_offers_sized_from_gross() {
        let config = CreditModelConfig::default();
        let group = group(10, 50_000.0, 45_000.0);
        let score = WeightedScoreModel.score(&group, &config).await.unwrap();
        assert_eq!(score.risk_level, RiskLevel::Low);

        let offers = TieredOfferModel.offers(&group, &score, &config).await.unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].offer_type, "term_loan");
        assert_eq!(offers[0].amount, 100_000.0);
        assert_eq!(offers[0].interest_rate, 0.09);
        assert_eq!(offers[1].offer_type, "line_of_credit");
        assert_eq!(offers[1].amount, 50_000.0);
        assert!(offers.iter().all(|o| o.credit_score == score.score));
    }

    #[tokio::test]
    async fn test_high_risk_and_tiny_groups_get_no_offers() {
        let config = CreditModelConfig::default();

        let risky = group(1, 100.0, 0.0);
        let score = WeightedScoreModel.score(&risky, &config).await.unwrap();
        assert_eq!(score.risk_level, RiskLevel::High);
        let offers = TieredOfferModel.offers(&risky, &score, &config).await.unwrap();
        assert!(offers.is_empty());

        // healthy but small: the credit line falls under the offer minimum
        let tiny = group(4, 800.0, 700.0);
        let score = WeightedScoreModel.score(&tiny, &config).await.unwrap();
        assert_eq!(score.risk_level, RiskLevel::Low);
        let offers = TieredOfferModel.offers(&tiny, &score, &config).await.unwrap();
        assert_eq!(offers.len(), 1, "sub-minimum offers must be dropped");
        assert_eq!(offers[0].offer_type, "term_loan");
        assert_eq!(offers[0].amount, 1_600.0);
    }

    #[test]
    fn test_gross_total_excludes_the_revenue_bucket() {
        let g = group(3, 900.0, 400.0);
        assert_eq!(gross_total(&g), 900.0);
        assert_eq!(g.total(REVENUE_TOTAL_FIELD), 400.0);
    }
}
