//! Process-local `WarmupStore` for tests and ephemeral runs.
//!
//! Each operation holds the lock for its whole read-modify-write, which gives
//! the same atomicity as the single-statement SQL of the libSQL backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DatabaseError;
use crate::health::benchmark::Benchmark;
use crate::health::model::HealthMetricsSnapshot;
use crate::store::traits::{ExternalNumber, WarmupStore};
use crate::warmup::content::MessageType;
use crate::warmup::state::{WarmupInstanceState, WarmupStatus};
use crate::warmup::stats::{DailyKey, DeliverySignal, MediaStatsDaily};

#[derive(Default)]
struct Inner {
    instances: HashMap<String, WarmupInstanceState>,
    daily: HashMap<DailyKey, MediaStatsDaily>,
    /// Insertion-ordered per org.
    external_numbers: HashMap<String, Vec<ExternalNumber>>,
    benchmarks: Vec<Benchmark>,
    snapshots: Vec<HealthMetricsSnapshot>,
}

/// In-memory store guarded by a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DatabaseError> {
        self.inner
            .lock()
            .map_err(|e| DatabaseError::Pool(format!("memory store poisoned: {e}")))
    }
}

#[async_trait]
impl WarmupStore for MemoryStore {
    async fn get_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<WarmupInstanceState>, DatabaseError> {
        Ok(self.lock()?.instances.get(instance_id).cloned())
    }

    async fn activate_instance(
        &self,
        instance_id: &str,
        org_id: &str,
        target_duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<WarmupInstanceState, DatabaseError> {
        let mut inner = self.lock()?;
        let state = inner
            .instances
            .entry(instance_id.to_string())
            .or_insert_with(|| WarmupInstanceState::new(instance_id, org_id, target_duration_secs));

        // Completed runs and already-active runs are left untouched.
        if state.activate(target_duration_secs, now).is_ok() {
            state.org_id = org_id.to_string();
        }
        Ok(state.clone())
    }

    async fn compare_and_set_status(
        &self,
        instance_id: &str,
        expected: WarmupStatus,
        new: WarmupStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        if !expected.can_transition_to(new) {
            return Err(DatabaseError::Constraint(format!(
                "invalid status transition {expected} -> {new}"
            )));
        }

        let mut inner = self.lock()?;
        match inner.instances.get_mut(instance_id) {
            Some(state) if state.status == expected => {
                state
                    .transition_to(new, reason.map(str::to_string), now)
                    .map_err(DatabaseError::Constraint)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn tick_progress(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WarmupInstanceState>, DatabaseError> {
        let mut inner = self.lock()?;
        let Some(state) = inner.instances.get_mut(instance_id) else {
            return Ok(None);
        };
        if state.apply_tick(now) {
            Ok(Some(state.clone()))
        } else {
            Ok(None)
        }
    }

    async fn list_instance_states(
        &self,
        org_id: &str,
    ) -> Result<Vec<WarmupInstanceState>, DatabaseError> {
        let inner = self.lock()?;
        let mut states: Vec<_> = inner
            .instances
            .values()
            .filter(|s| s.org_id == org_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(states)
    }

    async fn list_instances_by_status(
        &self,
        status: WarmupStatus,
    ) -> Result<Vec<WarmupInstanceState>, DatabaseError> {
        let inner = self.lock()?;
        let mut states: Vec<_> = inner
            .instances
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(states)
    }

    async fn increment_sent(
        &self,
        key: &DailyKey,
        kind: MessageType,
        off_hours: bool,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.lock()?;
        inner
            .daily
            .entry(key.clone())
            .or_insert_with(|| MediaStatsDaily::empty(key))
            .record_sent(kind, off_hours);
        Ok(())
    }

    async fn increment_received(
        &self,
        key: &DailyKey,
        kind: MessageType,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.lock()?;
        inner
            .daily
            .entry(key.clone())
            .or_insert_with(|| MediaStatsDaily::empty(key))
            .record_received(kind);
        Ok(())
    }

    async fn increment_signal(
        &self,
        key: &DailyKey,
        signal: DeliverySignal,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.lock()?;
        inner
            .daily
            .entry(key.clone())
            .or_insert_with(|| MediaStatsDaily::empty(key))
            .record_signal(signal);
        Ok(())
    }

    async fn get_daily_stats(&self, key: &DailyKey) -> Result<MediaStatsDaily, DatabaseError> {
        Ok(self
            .lock()?
            .daily
            .get(key)
            .cloned()
            .unwrap_or_else(|| MediaStatsDaily::empty(key)))
    }

    async fn list_daily_stats(
        &self,
        instance_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MediaStatsDaily>, DatabaseError> {
        let inner = self.lock()?;
        let mut days: Vec<_> = inner
            .daily
            .iter()
            .filter(|(k, _)| k.instance_id == instance_id && k.day >= from && k.day <= to)
            .map(|(_, v)| v.clone())
            .collect();
        days.sort_by_key(|d| d.day);
        Ok(days)
    }

    async fn add_external_number(
        &self,
        org_id: &str,
        phone_number: &str,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.lock()?;
        let pool = inner.external_numbers.entry(org_id.to_string()).or_default();
        match pool.iter_mut().find(|n| n.phone_number == phone_number) {
            Some(existing) => existing.active = true,
            None => pool.push(ExternalNumber {
                org_id: org_id.to_string(),
                phone_number: phone_number.to_string(),
                active: true,
            }),
        }
        Ok(())
    }

    async fn set_external_number_active(
        &self,
        org_id: &str,
        phone_number: &str,
        active: bool,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.lock()?;
        let found = inner
            .external_numbers
            .get_mut(org_id)
            .and_then(|pool| pool.iter_mut().find(|n| n.phone_number == phone_number));
        match found {
            Some(number) => {
                number.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_external_numbers(
        &self,
        org_id: &str,
        active_only: bool,
    ) -> Result<Vec<ExternalNumber>, DatabaseError> {
        let inner = self.lock()?;
        Ok(inner
            .external_numbers
            .get(org_id)
            .map(|pool| {
                pool.iter()
                    .filter(|n| !active_only || n.active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_active_benchmark(&self) -> Result<Option<Benchmark>, DatabaseError> {
        Ok(self.lock()?.benchmarks.iter().find(|b| b.is_active).cloned())
    }

    async fn insert_benchmark(
        &self,
        benchmark: &Benchmark,
        activate: bool,
    ) -> Result<Benchmark, DatabaseError> {
        let mut inner = self.lock()?;
        let version = inner.benchmarks.iter().map(|b| b.version).max().unwrap_or(0) + 1;
        if activate {
            for existing in inner.benchmarks.iter_mut() {
                existing.is_active = false;
            }
        }
        let stored = Benchmark {
            version,
            is_active: activate,
            ..benchmark.clone()
        };
        inner.benchmarks.push(stored.clone());
        Ok(stored)
    }

    async fn activate_benchmark(&self, version: i64) -> Result<bool, DatabaseError> {
        let mut inner = self.lock()?;
        if !inner.benchmarks.iter().any(|b| b.version == version) {
            return Ok(false);
        }
        for benchmark in inner.benchmarks.iter_mut() {
            benchmark.is_active = benchmark.version == version;
        }
        Ok(true)
    }

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>, DatabaseError> {
        let mut all = self.lock()?.benchmarks.clone();
        all.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(all)
    }

    async fn append_snapshot(&self, snapshot: &HealthMetricsSnapshot) -> Result<(), DatabaseError> {
        self.lock()?.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        instance_id: &str,
    ) -> Result<Option<HealthMetricsSnapshot>, DatabaseError> {
        Ok(self.list_snapshots(instance_id, 1).await?.into_iter().next())
    }

    async fn list_snapshots(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthMetricsSnapshot>, DatabaseError> {
        let inner = self.lock()?;
        let mut matching: Vec<_> = inner
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.instance_id == instance_id)
            .collect();
        // Newest first; insertion order breaks timestamp ties.
        matching.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, s)| s.clone())
            .collect())
    }
}
