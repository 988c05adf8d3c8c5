//! Table-driven factor evaluation.
//!
//! Each scoring factor owns an ordered list of `(predicate, sub-score)`
//! rules; the first rule whose predicate holds for the factor's value wins,
//! otherwise the table's fallback applies. Tables are plain data so they can
//! be versioned with a benchmark.

use serde::{Deserialize, Serialize};

use super::model::RawSignals;

/// The ten weighted factors of the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    ResponseRate,
    DeliveryRate,
    SpamReports,
    BlockRate,
    HumanBehavior,
    MessageVolume,
    PolicyCompliance,
    Engagement,
    TimingSafety,
    ContentVariability,
}

impl Factor {
    pub const ALL: [Factor; 10] = [
        Factor::ResponseRate,
        Factor::DeliveryRate,
        Factor::SpamReports,
        Factor::BlockRate,
        Factor::HumanBehavior,
        Factor::MessageVolume,
        Factor::PolicyCompliance,
        Factor::Engagement,
        Factor::TimingSafety,
        Factor::ContentVariability,
    ];

    /// The signal value this factor is scored on.
    pub fn value(&self, signals: &RawSignals) -> f64 {
        match self {
            Self::ResponseRate => signals.response_rate,
            Self::DeliveryRate => signals.delivery_rate,
            Self::SpamReports => f64::from(signals.spam_reports),
            Self::BlockRate => signals.block_rate,
            Self::HumanBehavior => signals.human_like_score,
            Self::MessageVolume => signals.volume_ratio(),
            Self::PolicyCompliance => f64::from(signals.policy_violations),
            Self::Engagement => signals.engagement_rate,
            Self::TimingSafety => signals.peak_hour_ratio,
            Self::ContentVariability => signals.content_variability,
        }
    }
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResponseRate => "response_rate",
            Self::DeliveryRate => "delivery_rate",
            Self::SpamReports => "spam_reports",
            Self::BlockRate => "block_rate",
            Self::HumanBehavior => "human_behavior",
            Self::MessageVolume => "message_volume",
            Self::PolicyCompliance => "policy_compliance",
            Self::Engagement => "engagement",
            Self::TimingSafety => "timing_safety",
            Self::ContentVariability => "content_variability",
        };
        write!(f, "{s}")
    }
}

/// Predicate operator of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    AtMost,
    LessThan,
    AtLeast,
    GreaterThan,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::AtMost => value <= threshold,
            Self::LessThan => value < threshold,
            Self::AtLeast => value >= threshold,
            Self::GreaterThan => value > threshold,
        }
    }
}

/// One `(predicate, sub-score)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRule {
    pub op: Comparison,
    pub threshold: f64,
    pub score: f64,
}

impl ScoreRule {
    pub const fn at_most(threshold: f64, score: f64) -> Self {
        Self {
            op: Comparison::AtMost,
            threshold,
            score,
        }
    }

    pub const fn at_least(threshold: f64, score: f64) -> Self {
        Self {
            op: Comparison::AtLeast,
            threshold,
            score,
        }
    }
}

/// Ordered rules for one factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRules {
    pub rules: Vec<ScoreRule>,
    /// Sub-score when no rule matches.
    pub otherwise: f64,
}

impl FactorRules {
    pub fn new(rules: Vec<ScoreRule>, otherwise: f64) -> Self {
        Self { rules, otherwise }
    }

    /// First matching rule's sub-score, clamped to [0, 100].
    pub fn evaluate(&self, value: f64) -> f64 {
        self.rules
            .iter()
            .find(|rule| rule.op.holds(value, rule.threshold))
            .map(|rule| rule.score)
            .unwrap_or(self.otherwise)
            .clamp(0.0, 100.0)
    }

    /// Default table for a factor.
    pub fn default_for(factor: Factor) -> Self {
        use ScoreRule as R;

        match factor {
            Factor::ResponseRate => Self::new(
                vec![
                    R::at_least(0.7, 100.0),
                    R::at_least(0.5, 80.0),
                    R::at_least(0.3, 50.0),
                    R::at_least(0.1, 20.0),
                ],
                0.0,
            ),
            Factor::DeliveryRate => Self::new(
                vec![
                    R::at_least(0.98, 100.0),
                    R::at_least(0.95, 80.0),
                    R::at_least(0.90, 50.0),
                    R::at_least(0.80, 20.0),
                ],
                0.0,
            ),
            Factor::SpamReports => Self::new(
                vec![
                    R::at_most(0.0, 100.0),
                    R::at_most(1.0, 80.0),
                    R::at_most(3.0, 50.0),
                    R::at_most(5.0, 20.0),
                ],
                0.0,
            ),
            Factor::BlockRate => Self::new(
                vec![
                    R::at_most(0.01, 100.0),
                    R::at_most(0.02, 80.0),
                    R::at_most(0.05, 50.0),
                    R::at_most(0.10, 20.0),
                ],
                0.0,
            ),
            Factor::HumanBehavior => Self::new(
                vec![
                    R::at_least(0.8, 100.0),
                    R::at_least(0.7, 80.0),
                    R::at_least(0.5, 50.0),
                    R::at_least(0.3, 20.0),
                ],
                0.0,
            ),
            Factor::MessageVolume => Self::new(
                vec![
                    R::at_most(0.8, 100.0),
                    R::at_most(1.0, 80.0),
                    R::at_most(1.5, 50.0),
                    R::at_most(2.0, 20.0),
                ],
                0.0,
            ),
            Factor::PolicyCompliance => Self::new(
                vec![
                    R::at_most(0.0, 100.0),
                    R::at_most(1.0, 60.0),
                    R::at_most(2.0, 30.0),
                ],
                0.0,
            ),
            Factor::Engagement => Self::new(
                vec![
                    R::at_least(0.5, 100.0),
                    R::at_least(0.3, 80.0),
                    R::at_least(0.1, 50.0),
                    ScoreRule {
                        op: Comparison::GreaterThan,
                        threshold: 0.0,
                        score: 20.0,
                    },
                ],
                0.0,
            ),
            Factor::TimingSafety => Self::new(
                vec![
                    R::at_least(0.9, 100.0),
                    R::at_least(0.75, 80.0),
                    R::at_least(0.5, 50.0),
                ],
                20.0,
            ),
            Factor::ContentVariability => Self::new(
                vec![
                    R::at_least(0.6, 100.0),
                    R::at_least(0.4, 80.0),
                    R::at_least(0.2, 50.0),
                ],
                20.0,
            ),
        }
    }
}
