//! Health data model: raw signals, risk levels and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rules::Factor;

/// Raw behavioural and delivery signals for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignals {
    /// Replies received per message sent, in [0, 1].
    pub response_rate: f64,
    pub delivery_rate: f64,
    pub block_rate: f64,
    pub spam_reports: u32,
    pub policy_violations: u32,
    /// Account warnings issued by the network.
    pub warning_count: u32,
    /// In [0, 1]; 1 is indistinguishable from a person.
    pub human_like_score: f64,
    pub messages_sent_24h: u64,
    /// Plan cap; `None` when unlimited.
    pub max_daily_messages: Option<u64>,
    /// Interactions (replies, reads) per message sent.
    pub engagement_rate: f64,
    /// Share of sends inside peak hours.
    pub peak_hour_ratio: f64,
    /// Share of message types used.
    pub content_variability: f64,
}

impl RawSignals {
    /// Signals of a healthy instance with no recorded activity.
    pub fn nominal() -> Self {
        Self {
            response_rate: 1.0,
            delivery_rate: 1.0,
            block_rate: 0.0,
            spam_reports: 0,
            policy_violations: 0,
            warning_count: 0,
            human_like_score: 1.0,
            messages_sent_24h: 0,
            max_daily_messages: None,
            engagement_rate: 1.0,
            peak_hour_ratio: 1.0,
            content_variability: 1.0,
        }
    }

    /// Sent volume relative to the plan cap; 0 when unlimited.
    pub fn volume_ratio(&self) -> f64 {
        match self.max_daily_messages {
            None => 0.0,
            Some(0) => self.messages_sent_24h as f64,
            Some(max) => self.messages_sent_24h as f64 / max as f64,
        }
    }
}

/// Ordinal ban-risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Contribution of one factor to the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub factor: Factor,
    pub value: f64,
    pub sub_score: f64,
    pub weight: f64,
    /// `(100 - sub_score) * weight`.
    pub deduction: f64,
}

/// Immutable record of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetricsSnapshot {
    pub id: Uuid,
    pub instance_id: String,
    pub org_id: String,
    pub signals: RawSignals,
    pub factor_scores: Vec<FactorScore>,
    /// Score after weighted deductions, before penalties.
    pub base_score: f64,
    pub penalty_multiplier: f64,
    pub health_score: f64,
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    /// Benchmark version that produced this snapshot.
    pub benchmark_version: Option<i64>,
    pub created_at: DateTime<Utc>,
}
