//! Pipeline stage configuration and result shapes.
//!
//! A pipeline job imports records, aggregates them by a grouping dimension,
//! scores each aggregate group, and generates offers from the scores. The
//! score/offer collaborators are pluggable; these types are the contract
//! between the stages and the caller-visible report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Stage configuration
// ============================================================================

fn default_group_by() -> String {
    "date".to_string()
}

fn default_amount_fields() -> Vec<String> {
    vec!["amount".to_string()]
}

/// How the aggregate stage groups imported records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Field whose value buckets records into groups.
    #[serde(default = "default_group_by")]
    pub group_by: String,
    /// Numeric fields summed per group.
    #[serde(default = "default_amount_fields")]
    pub amount_fields: Vec<String>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self { group_by: default_group_by(), amount_fields: default_amount_fields() }
    }
}

/// Relative weight of each score component. Expected to sum to 1.0; the
/// scoring model normalizes if they do not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub volume: f64,
    pub revenue_ratio: f64,
    pub consistency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { volume: 0.4, revenue_ratio: 0.3, consistency: 0.3 }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.volume + self.revenue_ratio + self.consistency
    }
}

fn default_model_version() -> String {
    "v2.1".to_string()
}

fn default_rolling_period_days() -> u32 {
    90
}

fn default_risk_threshold() -> f64 {
    0.65
}

/// Scoring stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditModelConfig {
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Lookback window the model considers, in days.
    #[serde(default = "default_rolling_period_days")]
    pub rolling_period_days: u32,
    /// Normalized risk above this value suppresses offers.
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: f64,
    #[serde(default)]
    pub weights: ScoreWeights,
}

impl Default for CreditModelConfig {
    fn default() -> Self {
        Self {
            model_version: default_model_version(),
            rolling_period_days: default_rolling_period_days(),
            risk_threshold: default_risk_threshold(),
            weights: ScoreWeights::default(),
        }
    }
}

// ============================================================================
// Stage outputs
// ============================================================================

/// One aggregate group: every imported record sharing a `group_by` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    /// Value of the grouping field, rendered as text.
    pub group: String,
    /// Records in the group.
    pub record_count: u64,
    /// Sum per configured amount field.
    pub totals: BTreeMap<String, f64>,
}

impl AggregateGroup {
    pub fn total(&self, field: &str) -> f64 {
        self.totals.get(field).copied().unwrap_or(0.0)
    }
}

/// Risk band derived from the normalized risk value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(format!("Invalid risk level: '{}'", s)),
        }
    }
}

/// Scoring result for one aggregate group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub group: String,
    /// Credit-bureau style score, clamped to 300..=850.
    pub score: u32,
    pub risk_level: RiskLevel,
    /// Raw component values before weighting, for audit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, f64>,
}

/// One generated offer for a scored group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub group: String,
    pub offer_type: String,
    pub amount: f64,
    pub interest_rate: f64,
    pub credit_score: u32,
    pub risk_level: RiskLevel,
}

/// Roll-up counts for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub transactions_processed: u64,
    pub aggregates_created: u64,
    pub offers_generated: u64,
}

/// Everything a pipeline run produced, persisted per job and returned to the
/// caller after completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub summary: PipelineSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregates: Vec<AggregateGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scores: Vec<ScoreResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offers: Vec<Offer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_config_defaults() {
        let config: AggregateConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.group_by, "date");
        assert_eq!(config.amount_fields, vec!["amount".to_string()]);
    }

    #[test]
    fn credit_model_config_defaults() {
        let config: CreditModelConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.model_version, "v2.1");
        assert_eq!(config.rolling_period_days, 90);
        assert!((config.risk_threshold - 0.65).abs() < f64::EPSILON);
        assert!((config.weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn risk_level_roundtrip() {
        for level in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            assert_eq!(level.as_str().parse::<RiskLevel>().unwrap(), level);
        }
        let json = serde_json::to_string(&RiskLevel::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
    }

    #[test]
    fn report_serializes_summary_first_class() {
        let report = PipelineReport {
            summary: PipelineSummary {
                transactions_processed: 25,
                aggregates_created: 3,
                offers_generated: 2,
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["summary"]["transactions_processed"], 25);
        assert!(json.get("offers").is_none());
    }
}
