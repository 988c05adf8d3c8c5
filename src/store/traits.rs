//! Unified `WarmupStore` trait: single async interface for all persistence.
//!
//! Every mutation is a single atomic statement (upsert-increment or
//! compare-and-set); callers never read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::health::benchmark::Benchmark;
use crate::health::model::HealthMetricsSnapshot;
use crate::warmup::content::MessageType;
use crate::warmup::state::{WarmupInstanceState, WarmupStatus};
use crate::warmup::stats::{DailyKey, DeliverySignal, MediaStatsDaily};

/// A synthetic conversation partner owned by an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNumber {
    pub org_id: String,
    pub phone_number: String,
    pub active: bool,
}

/// Backend-agnostic persistence for warmup runs, counters and health data.
#[async_trait]
pub trait WarmupStore: Send + Sync {
    // ── Instance state ──────────────────────────────────────────────

    /// Get the persisted state of an instance.
    async fn get_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<WarmupInstanceState>, DatabaseError>;

    /// Move an instance to ACTIVE, creating it if unknown.
    ///
    /// Only applies from INACTIVE, PAUSED or ERROR; elapsed time is kept.
    /// Returns the resulting state, whose status tells whether it applied.
    async fn activate_instance(
        &self,
        instance_id: &str,
        org_id: &str,
        target_duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<WarmupInstanceState, DatabaseError>;

    /// Set `new` only if the current status is `expected`.
    async fn compare_and_set_status(
        &self,
        instance_id: &str,
        expected: WarmupStatus,
        new: WarmupStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Advance an ACTIVE instance by one second. Returns `None` if the
    /// instance is not active.
    async fn tick_progress(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WarmupInstanceState>, DatabaseError>;

    /// List instance states for an organization.
    async fn list_instance_states(
        &self,
        org_id: &str,
    ) -> Result<Vec<WarmupInstanceState>, DatabaseError>;

    /// List instance states in a given status, across organizations.
    async fn list_instances_by_status(
        &self,
        status: WarmupStatus,
    ) -> Result<Vec<WarmupInstanceState>, DatabaseError>;

    // ── Daily counters ──────────────────────────────────────────────

    /// Increment the per-type and total sent counters together.
    async fn increment_sent(
        &self,
        key: &DailyKey,
        kind: MessageType,
        off_hours: bool,
    ) -> Result<(), DatabaseError>;

    /// Increment the per-type and total received counters together.
    async fn increment_received(&self, key: &DailyKey, kind: MessageType)
    -> Result<(), DatabaseError>;

    /// Increment a delivery-signal counter.
    async fn increment_signal(
        &self,
        key: &DailyKey,
        signal: DeliverySignal,
    ) -> Result<(), DatabaseError>;

    /// Counters for a day; zeroed when no row exists.
    async fn get_daily_stats(&self, key: &DailyKey) -> Result<MediaStatsDaily, DatabaseError>;

    /// Counters for an instance over an inclusive day range, oldest first.
    async fn list_daily_stats(
        &self,
        instance_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MediaStatsDaily>, DatabaseError>;

    // ── External numbers ────────────────────────────────────────────

    /// Add a number to an organization's pool (idempotent, reactivates).
    async fn add_external_number(&self, org_id: &str, phone_number: &str)
    -> Result<(), DatabaseError>;

    /// Toggle a number. Returns false if it does not exist.
    async fn set_external_number_active(
        &self,
        org_id: &str,
        phone_number: &str,
        active: bool,
    ) -> Result<bool, DatabaseError>;

    /// List an organization's pool.
    async fn list_external_numbers(
        &self,
        org_id: &str,
        active_only: bool,
    ) -> Result<Vec<ExternalNumber>, DatabaseError>;

    // ── Benchmarks ──────────────────────────────────────────────────

    /// The single active benchmark, if any.
    async fn get_active_benchmark(&self) -> Result<Option<Benchmark>, DatabaseError>;

    /// Store a benchmark under the next version number.
    async fn insert_benchmark(
        &self,
        benchmark: &Benchmark,
        activate: bool,
    ) -> Result<Benchmark, DatabaseError>;

    /// Make `version` the only active benchmark. Returns false if unknown.
    async fn activate_benchmark(&self, version: i64) -> Result<bool, DatabaseError>;

    /// All benchmark versions, newest first.
    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>, DatabaseError>;

    // ── Health snapshots (append-only) ──────────────────────────────

    async fn append_snapshot(&self, snapshot: &HealthMetricsSnapshot) -> Result<(), DatabaseError>;

    async fn latest_snapshot(
        &self,
        instance_id: &str,
    ) -> Result<Option<HealthMetricsSnapshot>, DatabaseError>;

    /// Most recent snapshots first.
    async fn list_snapshots(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthMetricsSnapshot>, DatabaseError>;
}
