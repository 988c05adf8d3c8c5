//! Versioned scoring benchmarks.
//!
//! A benchmark bundles factor weights, per-factor rule tables, critical
//! penalties and risk rules. Exactly one version is active at a time; the
//! default set is provisioned on first use.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::model::{RawSignals, RiskLevel};
use super::rules::{Comparison, Factor, FactorRules};
use crate::error::AnalysisError;
use crate::store::WarmupStore;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Name given to the auto-provisioned benchmark.
pub const DEFAULT_BENCHMARK_NAME: &str = "default";

/// Multiplicative penalties applied after weighted deductions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Spam reports at or above this halve the score (by `spam_multiplier`).
    pub spam_reports_at: u32,
    pub spam_multiplier: f64,
    pub block_rate_at: f64,
    pub block_multiplier: f64,
    /// Fraction removed per policy violation.
    pub per_violation: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            spam_reports_at: 3,
            spam_multiplier: 0.5,
            block_rate_at: 0.05,
            block_multiplier: 0.7,
            per_violation: 0.1,
        }
    }
}

impl PenaltyConfig {
    /// Combined multiplier for a signal set, in [0, 1].
    pub fn multiplier(&self, signals: &RawSignals) -> f64 {
        let mut multiplier = 1.0;
        if signals.spam_reports >= self.spam_reports_at {
            multiplier *= self.spam_multiplier;
        }
        if signals.block_rate >= self.block_rate_at {
            multiplier *= self.block_multiplier;
        }
        if signals.policy_violations > 0 {
            multiplier *= (1.0 - f64::from(signals.policy_violations) * self.per_violation).max(0.0);
        }
        multiplier.clamp(0.0, 1.0)
    }
}

/// Signal a risk condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMetric {
    SpamReports,
    BlockRate,
    DeliveryRate,
    ResponseRate,
    PolicyViolations,
    WarningCount,
    HumanLikeScore,
    /// Sent in the last 24h divided by the plan's daily cap.
    VolumeRatio,
}

impl RiskMetric {
    pub fn value(&self, signals: &RawSignals) -> f64 {
        match self {
            Self::SpamReports => f64::from(signals.spam_reports),
            Self::BlockRate => signals.block_rate,
            Self::DeliveryRate => signals.delivery_rate,
            Self::ResponseRate => signals.response_rate,
            Self::PolicyViolations => f64::from(signals.policy_violations),
            Self::WarningCount => f64::from(signals.warning_count),
            Self::HumanLikeScore => signals.human_like_score,
            Self::VolumeRatio => signals.volume_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskCondition {
    pub metric: RiskMetric,
    pub op: Comparison,
    pub threshold: f64,
}

impl RiskCondition {
    const fn new(metric: RiskMetric, op: Comparison, threshold: f64) -> Self {
        Self {
            metric,
            op,
            threshold,
        }
    }

    pub fn holds(&self, signals: &RawSignals) -> bool {
        self.op.holds(self.metric.value(signals), self.threshold)
    }
}

/// Fires `level` when at least `min_matches` conditions hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRule {
    pub level: RiskLevel,
    pub min_matches: usize,
    pub conditions: Vec<RiskCondition>,
}

impl RiskRule {
    pub fn matches(&self, signals: &RawSignals) -> bool {
        let hits = self.conditions.iter().filter(|c| c.holds(signals)).count();
        hits >= self.min_matches.max(1)
    }
}

fn default_risk_rules() -> Vec<RiskRule> {
    use Comparison::*;
    use RiskMetric::*;

    vec![
        RiskRule {
            level: RiskLevel::Critical,
            min_matches: 1,
            conditions: vec![
                RiskCondition::new(SpamReports, AtLeast, 5.0),
                RiskCondition::new(BlockRate, AtLeast, 0.10),
                RiskCondition::new(DeliveryRate, LessThan, 0.80),
                RiskCondition::new(PolicyViolations, GreaterThan, 3.0),
                RiskCondition::new(WarningCount, GreaterThan, 2.0),
            ],
        },
        RiskRule {
            level: RiskLevel::High,
            min_matches: 2,
            conditions: vec![
                RiskCondition::new(SpamReports, AtLeast, 2.0),
                RiskCondition::new(BlockRate, AtLeast, 0.05),
                RiskCondition::new(DeliveryRate, LessThan, 0.90),
                RiskCondition::new(PolicyViolations, GreaterThan, 0.0),
                RiskCondition::new(ResponseRate, LessThan, 0.30),
                RiskCondition::new(VolumeRatio, GreaterThan, 1.5),
            ],
        },
        RiskRule {
            level: RiskLevel::Medium,
            min_matches: 2,
            conditions: vec![
                RiskCondition::new(SpamReports, AtLeast, 1.0),
                RiskCondition::new(BlockRate, AtLeast, 0.02),
                RiskCondition::new(DeliveryRate, LessThan, 0.95),
                RiskCondition::new(ResponseRate, LessThan, 0.50),
                RiskCondition::new(HumanLikeScore, LessThan, 0.7),
            ],
        },
    ]
}

/// Everything a benchmark version configures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub weights: BTreeMap<Factor, f64>,
    pub factors: BTreeMap<Factor, FactorRules>,
    #[serde(default)]
    pub penalties: PenaltyConfig,
    /// Evaluated in order; the first rule that fires decides the level.
    pub risk_rules: Vec<RiskRule>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        let weights = BTreeMap::from([
            (Factor::ResponseRate, 0.20),
            (Factor::DeliveryRate, 0.15),
            (Factor::SpamReports, 0.25),
            (Factor::BlockRate, 0.15),
            (Factor::HumanBehavior, 0.10),
            (Factor::MessageVolume, 0.03),
            (Factor::PolicyCompliance, 0.05),
            (Factor::Engagement, 0.05),
            (Factor::TimingSafety, 0.01),
            (Factor::ContentVariability, 0.01),
        ]);
        let factors = Factor::ALL
            .iter()
            .map(|f| (*f, FactorRules::default_for(*f)))
            .collect();

        Self {
            weights,
            factors,
            penalties: PenaltyConfig::default(),
            risk_rules: default_risk_rules(),
        }
    }
}

impl BenchmarkConfig {
    pub fn weight(&self, factor: Factor) -> f64 {
        self.weights.get(&factor).copied().unwrap_or(0.0)
    }

    /// Rules for a factor, falling back to the default table.
    pub fn rules(&self, factor: Factor) -> FactorRules {
        self.factors
            .get(&factor)
            .cloned()
            .unwrap_or_else(|| FactorRules::default_for(factor))
    }

    /// Reject weight sets that do not describe a proper weighted average.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        for factor in Factor::ALL {
            match self.weights.get(&factor) {
                None => {
                    return Err(AnalysisError::InvalidBenchmark(format!(
                        "missing weight for {factor}"
                    )));
                }
                Some(w) if !w.is_finite() || *w < 0.0 => {
                    return Err(AnalysisError::InvalidBenchmark(format!(
                        "weight for {factor} must be a non-negative number, got {w}"
                    )));
                }
                Some(_) => {}
            }
        }

        let total: f64 = self.weights.values().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(AnalysisError::InvalidBenchmark(format!(
                "weights must sum to 1.0, got {total:.6}"
            )));
        }

        let p = &self.penalties;
        for (name, m) in [
            ("spam_multiplier", p.spam_multiplier),
            ("block_multiplier", p.block_multiplier),
            ("per_violation", p.per_violation),
        ] {
            if !(0.0..=1.0).contains(&m) {
                return Err(AnalysisError::InvalidBenchmark(format!(
                    "{name} must be within [0, 1], got {m}"
                )));
            }
        }

        Ok(())
    }
}

/// One stored benchmark version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    /// Assigned by the store; 0 before insertion.
    pub version: i64,
    pub name: String,
    pub is_active: bool,
    pub config: BenchmarkConfig,
    pub created_at: DateTime<Utc>,
}

impl Benchmark {
    pub fn new(name: impl Into<String>, config: BenchmarkConfig) -> Self {
        Self {
            version: 0,
            name: name.into(),
            is_active: false,
            config,
            created_at: Utc::now(),
        }
    }
}

/// Access to the active benchmark, provisioning defaults when none exists.
pub struct BenchmarkStore {
    store: Arc<dyn WarmupStore>,
    provision_lock: Mutex<()>,
}

impl BenchmarkStore {
    pub fn new(store: Arc<dyn WarmupStore>) -> Self {
        Self {
            store,
            provision_lock: Mutex::new(()),
        }
    }

    /// The active benchmark. Creates and activates the default set if no
    /// version is active yet.
    pub async fn active(&self) -> Result<Benchmark, AnalysisError> {
        if let Some(benchmark) = self.load_active().await? {
            return Ok(benchmark);
        }

        let _guard = self.provision_lock.lock().await;
        if let Some(benchmark) = self.load_active().await? {
            return Ok(benchmark);
        }

        let created = self
            .store
            .insert_benchmark(
                &Benchmark::new(DEFAULT_BENCHMARK_NAME, BenchmarkConfig::default()),
                true,
            )
            .await
            .map_err(|e| AnalysisError::BenchmarkLoad(format!("provision default: {e}")))?;

        info!(version = created.version, "Provisioned default scoring benchmark");
        Ok(created)
    }

    /// Validate and store a new version, optionally making it active.
    pub async fn create(
        &self,
        name: &str,
        config: BenchmarkConfig,
        activate: bool,
    ) -> Result<Benchmark, AnalysisError> {
        config.validate()?;
        let created = self
            .store
            .insert_benchmark(&Benchmark::new(name, config), activate)
            .await?;
        info!(version = created.version, name, activate, "Stored scoring benchmark");
        Ok(created)
    }

    /// Make an existing version the only active one.
    pub async fn activate(&self, version: i64) -> Result<(), AnalysisError> {
        if self.store.activate_benchmark(version).await? {
            info!(version, "Activated scoring benchmark");
            Ok(())
        } else {
            Err(AnalysisError::BenchmarkLoad(format!(
                "benchmark version {version} does not exist"
            )))
        }
    }

    pub async fn list(&self) -> Result<Vec<Benchmark>, AnalysisError> {
        Ok(self.store.list_benchmarks().await?)
    }

    async fn load_active(&self) -> Result<Option<Benchmark>, AnalysisError> {
        let benchmark = self
            .store
            .get_active_benchmark()
            .await
            .map_err(|e| AnalysisError::BenchmarkLoad(e.to_string()))?;

        match benchmark {
            Some(b) => {
                b.config.validate()?;
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn default_weights_sum_to_one() {
        let config = BenchmarkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.weight(Factor::SpamReports), 0.25);
    }

    #[test]
    fn unbalanced_weights_rejected() {
        let mut config = BenchmarkConfig::default();
        config.weights.insert(Factor::ResponseRate, 0.5);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidBenchmark(_)));
    }

    #[test]
    fn missing_weight_rejected() {
        let mut config = BenchmarkConfig::default();
        config.weights.remove(&Factor::Engagement);
        assert!(config.validate().is_err());
    }

    #[test]
    fn penalties_compose() {
        let penalties = PenaltyConfig::default();
        let mut signals = RawSignals::nominal();
        assert_eq!(penalties.multiplier(&signals), 1.0);

        signals.spam_reports = 3;
        signals.block_rate = 0.05;
        assert!((penalties.multiplier(&signals) - 0.35).abs() < 1e-9);

        signals.spam_reports = 0;
        signals.block_rate = 0.0;
        signals.policy_violations = 2;
        assert!((penalties.multiplier(&signals) - 0.8).abs() < 1e-9);

        signals.policy_violations = 20;
        assert_eq!(penalties.multiplier(&signals), 0.0);
    }

    #[test]
    fn high_rule_needs_two_matches() {
        let rules = default_risk_rules();
        let high = &rules[1];
        let mut signals = RawSignals::nominal();
        signals.spam_reports = 2;
        assert!(!high.matches(&signals));
        signals.response_rate = 0.2;
        assert!(high.matches(&signals));
    }

    #[tokio::test]
    async fn active_provisions_default_once() {
        let store = Arc::new(MemoryStore::new());
        let benchmarks = BenchmarkStore::new(store.clone());

        let first = benchmarks.active().await.unwrap();
        let second = benchmarks.active().await.unwrap();
        assert_eq!(first.version, second.version);
        assert!(first.is_active);
        assert_eq!(first.name, DEFAULT_BENCHMARK_NAME);
        assert_eq!(benchmarks.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_and_activate_switches_active_version() {
        let store = Arc::new(MemoryStore::new());
        let benchmarks = BenchmarkStore::new(store);
        let default = benchmarks.active().await.unwrap();

        let mut config = BenchmarkConfig::default();
        config.weights.insert(Factor::ResponseRate, 0.10);
        config.weights.insert(Factor::DeliveryRate, 0.25);
        let created = benchmarks.create("delivery-heavy", config, false).await.unwrap();
        assert!(created.version > default.version);
        assert_eq!(benchmarks.active().await.unwrap().version, default.version);

        benchmarks.activate(created.version).await.unwrap();
        let active = benchmarks.active().await.unwrap();
        assert_eq!(active.version, created.version);

        let all = benchmarks.list().await.unwrap();
        assert_eq!(all.iter().filter(|b| b.is_active).count(), 1);
        assert!(benchmarks.activate(999).await.is_err());
    }
}
