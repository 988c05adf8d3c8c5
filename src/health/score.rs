//! Composite health score.

use serde::{Deserialize, Serialize};

use super::benchmark::BenchmarkConfig;
use super::model::{FactorScore, RawSignals};
use super::rules::Factor;

/// Result of scoring one signal set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub factor_scores: Vec<FactorScore>,
    pub base_score: f64,
    pub penalty_multiplier: f64,
    /// Final score in [0, 100].
    pub health_score: f64,
}

/// Start at 100, deduct `(100 - sub_score) * weight` per factor, then apply
/// the critical penalties and clamp.
pub fn compute_score(signals: &RawSignals, config: &BenchmarkConfig) -> ScoreBreakdown {
    let factor_scores: Vec<FactorScore> = Factor::ALL
        .iter()
        .map(|factor| {
            let value = factor.value(signals);
            let sub_score = config.rules(*factor).evaluate(value);
            let weight = config.weight(*factor);
            FactorScore {
                factor: *factor,
                value,
                sub_score,
                weight,
                deduction: (100.0 - sub_score) * weight,
            }
        })
        .collect();

    let base_score = 100.0 - factor_scores.iter().map(|f| f.deduction).sum::<f64>();
    let penalty_multiplier = config.penalties.multiplier(signals);
    let health_score = (base_score * penalty_multiplier).clamp(0.0, 100.0);

    ScoreBreakdown {
        factor_scores,
        base_score,
        penalty_multiplier,
        health_score,
    }
}
