//! Health analysis runs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::benchmark::BenchmarkStore;
use super::model::{HealthMetricsSnapshot, RiskLevel};
use super::risk::{classify, risk_factors};
use super::score::compute_score;
use super::signals::SignalProvider;
use crate::error::AnalysisError;
use crate::store::WarmupStore;
use crate::warmup::state::WarmupStatus;

/// Status reason recorded when the health gate pauses an instance.
pub const CRITICAL_PAUSE_REASON: &str = "critical health risk";

/// Scores instances and keeps the append-only snapshot history.
pub struct HealthAnalyzer {
    store: Arc<dyn WarmupStore>,
    benchmarks: BenchmarkStore,
    signals: Arc<dyn SignalProvider>,
}

impl HealthAnalyzer {
    pub fn new(store: Arc<dyn WarmupStore>, signals: Arc<dyn SignalProvider>) -> Self {
        Self {
            benchmarks: BenchmarkStore::new(Arc::clone(&store)),
            store,
            signals,
        }
    }

    pub fn benchmarks(&self) -> &BenchmarkStore {
        &self.benchmarks
    }

    /// Run one analysis and persist its snapshot.
    ///
    /// Fails without writing anything if the benchmark or the signals cannot
    /// be loaded. A CRITICAL result pauses an active warmup.
    pub async fn analyze(
        &self,
        instance_id: &str,
        org_id: &str,
    ) -> Result<HealthMetricsSnapshot, AnalysisError> {
        let benchmark = self.benchmarks.active().await?;
        let signals = self.signals.collect(instance_id, org_id).await?;

        let breakdown = compute_score(&signals, &benchmark.config);
        let risk_level = classify(&signals, &benchmark.config.risk_rules);
        let factors = risk_factors(&signals);

        let snapshot = HealthMetricsSnapshot {
            id: Uuid::new_v4(),
            instance_id: instance_id.to_string(),
            org_id: org_id.to_string(),
            signals,
            factor_scores: breakdown.factor_scores,
            base_score: breakdown.base_score,
            penalty_multiplier: breakdown.penalty_multiplier,
            health_score: breakdown.health_score,
            risk_level,
            risk_factors: factors,
            benchmark_version: Some(benchmark.version),
            created_at: Utc::now(),
        };

        self.store.append_snapshot(&snapshot).await?;

        info!(
            instance_id,
            org_id,
            health_score = snapshot.health_score,
            risk_level = %snapshot.risk_level,
            benchmark_version = benchmark.version,
            "Health analysis recorded"
        );

        if risk_level == RiskLevel::Critical {
            self.pause_for_critical_risk(instance_id).await;
        }

        Ok(snapshot)
    }

    /// Most recent snapshot, if any.
    pub async fn latest(
        &self,
        instance_id: &str,
    ) -> Result<Option<HealthMetricsSnapshot>, AnalysisError> {
        Ok(self.store.latest_snapshot(instance_id).await?)
    }

    /// Snapshots newest first.
    pub async fn history(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthMetricsSnapshot>, AnalysisError> {
        Ok(self.store.list_snapshots(instance_id, limit).await?)
    }

    async fn pause_for_critical_risk(&self, instance_id: &str) {
        match self
            .store
            .compare_and_set_status(
                instance_id,
                WarmupStatus::Active,
                WarmupStatus::Paused,
                Some(CRITICAL_PAUSE_REASON),
                Utc::now(),
            )
            .await
        {
            Ok(true) => warn!(instance_id, "Critical health risk, warmup paused"),
            Ok(false) => warn!(instance_id, "Critical health risk detected"),
            Err(e) => warn!(instance_id, error = %e, "Failed to pause warmup on critical risk"),
        }
    }
}
