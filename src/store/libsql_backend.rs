//! libSQL backend: async `WarmupStore` implementation.
//!
//! Supports local file and in-memory databases. Counter updates are single
//! upsert statements and status changes are single compare-and-set updates,
//! so concurrent loops, webhooks and ticks never lose increments.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::health::benchmark::{Benchmark, BenchmarkConfig};
use crate::health::model::HealthMetricsSnapshot;
use crate::store::migrations;
use crate::store::traits::{ExternalNumber, WarmupStore};
use crate::warmup::content::MessageType;
use crate::warmup::state::{WarmupInstanceState, WarmupStatus};
use crate::warmup::stats::{DailyKey, DeliverySignal, MediaStatsDaily};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and ephemeral runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_state(&self, instance_id: &str) -> Result<Option<WarmupInstanceState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM warmup_instances WHERE instance_id = ?1"),
                params![instance_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_instance_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let state = row_to_state(&row)
                    .map_err(|e| DatabaseError::Query(format!("instance row parse: {e}")))?;
                Ok(Some(state))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_instance_state: {e}"))),
        }
    }

    async fn query_snapshots(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthMetricsSnapshot>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM health_snapshots WHERE instance_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![instance_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_snapshots: {e}")))?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_snapshots: {e}")))?
        {
            snapshots.push(row_to_snapshot(&row)?);
        }
        Ok(snapshots)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const INSTANCE_COLUMNS: &str = "instance_id, org_id, status, start_time, pause_time, elapsed_seconds, \
     target_duration_seconds, progress_percent, last_active_at, status_reason";

const STATS_COLUMNS: &str = "instance_id, org_id, day, \
     text_sent, audio_sent, sticker_sent, image_sent, video_sent, \
     text_received, audio_received, sticker_received, image_received, video_received, \
     total_sent, total_received, delivered, read_count, failed, blocked, \
     spam_reports, policy_violations, warnings, off_hours_sent";

const BENCHMARK_COLUMNS: &str = "version, name, is_active, config, created_at";

/// Flip `is_active` so only `?1` is set. Touches nothing when `?1` does not exist.
const ACTIVATE_BENCHMARK_SQL: &str = "UPDATE health_benchmarks \
     SET is_active = CASE WHEN version = ?1 THEN 1 ELSE 0 END \
     WHERE EXISTS (SELECT 1 FROM health_benchmarks WHERE version = ?1)";

const SNAPSHOT_COLUMNS: &str = "id, instance_id, org_id, health_score, risk_level, risk_factors, \
     signals, factor_scores, base_score, penalty_multiplier, benchmark_version, created_at";

/// Canonical timestamp format for all written columns.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn get_count(row: &libsql::Row, idx: i32) -> Result<u64, libsql::Error> {
    Ok(row.get::<i64>(idx)?.max(0) as u64)
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

/// Map a libsql Row to a WarmupInstanceState.
///
/// Column order matches INSTANCE_COLUMNS.
fn row_to_state(row: &libsql::Row) -> Result<WarmupInstanceState, libsql::Error> {
    let status_str: String = row.get(2)?;
    let start_time: Option<String> = row.get::<String>(3).ok();
    let pause_time: Option<String> = row.get::<String>(4).ok();
    let last_active_at: Option<String> = row.get::<String>(8).ok();

    Ok(WarmupInstanceState {
        instance_id: row.get(0)?,
        org_id: row.get(1)?,
        status: status_str.parse().unwrap_or(WarmupStatus::Inactive),
        start_time: parse_optional_datetime(&start_time),
        pause_time: parse_optional_datetime(&pause_time),
        elapsed_seconds: get_count(row, 5)?,
        target_duration_seconds: get_count(row, 6)?,
        progress_percent: row.get(7)?,
        last_active_at: parse_optional_datetime(&last_active_at),
        status_reason: row.get::<String>(9).ok(),
    })
}

/// Map a libsql Row to daily counters.
///
/// Column order matches STATS_COLUMNS; per-type counters start at index 3
/// (sent) and 8 (received) in selection order.
fn row_to_stats(row: &libsql::Row) -> Result<MediaStatsDaily, libsql::Error> {
    let day_str: String = row.get(2)?;
    let mut stats = MediaStatsDaily {
        instance_id: row.get(0)?,
        org_id: row.get(1)?,
        day: NaiveDate::parse_from_str(&day_str, "%Y-%m-%d").ok(),
        total_sent: get_count(row, 13)?,
        total_received: get_count(row, 14)?,
        delivered: get_count(row, 15)?,
        read: get_count(row, 16)?,
        failed: get_count(row, 17)?,
        blocked: get_count(row, 18)?,
        spam_reports: get_count(row, 19)?,
        policy_violations: get_count(row, 20)?,
        warnings: get_count(row, 21)?,
        off_hours_sent: get_count(row, 22)?,
        ..Default::default()
    };

    for (i, kind) in MessageType::SELECTION_ORDER.iter().enumerate() {
        let sent = get_count(row, 3 + i as i32)?;
        if sent > 0 {
            stats.sent_by_type.insert(*kind, sent);
        }
        let received = get_count(row, 8 + i as i32)?;
        if received > 0 {
            stats.received_by_type.insert(*kind, received);
        }
    }

    Ok(stats)
}

fn row_to_benchmark(row: &libsql::Row) -> Result<Benchmark, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("benchmark row parse: {e}"));
    let config_str: String = row.get(3).map_err(parse)?;
    let created_str: String = row.get(4).map_err(parse)?;
    let config: BenchmarkConfig = from_json(&config_str, "benchmark config")?;

    Ok(Benchmark {
        version: row.get(0).map_err(parse)?,
        name: row.get(1).map_err(parse)?,
        is_active: row.get::<i64>(2).map_err(parse)? != 0,
        config,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_snapshot(row: &libsql::Row) -> Result<HealthMetricsSnapshot, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("snapshot row parse: {e}"));
    let id_str: String = row.get(0).map_err(parse)?;
    let risk_str: String = row.get(4).map_err(parse)?;
    let factors_str: String = row.get(5).map_err(parse)?;
    let signals_str: String = row.get(6).map_err(parse)?;
    let factor_scores_str: String = row.get(7).map_err(parse)?;
    let created_str: String = row.get(11).map_err(parse)?;

    Ok(HealthMetricsSnapshot {
        id: id_str
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("snapshot id: {e}")))?,
        instance_id: row.get(1).map_err(parse)?,
        org_id: row.get(2).map_err(parse)?,
        health_score: row.get(3).map_err(parse)?,
        risk_level: risk_str.parse().map_err(DatabaseError::Serialization)?,
        risk_factors: from_json(&factors_str, "risk factors")?,
        signals: from_json(&signals_str, "signals")?,
        factor_scores: from_json(&factor_scores_str, "factor scores")?,
        base_score: row.get(8).map_err(parse)?,
        penalty_multiplier: row.get(9).map_err(parse)?,
        benchmark_version: row.get::<i64>(10).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl WarmupStore for LibSqlBackend {
    // ── Instance state ──────────────────────────────────────────────

    async fn get_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<Option<WarmupInstanceState>, DatabaseError> {
        self.query_state(instance_id).await
    }

    async fn activate_instance(
        &self,
        instance_id: &str,
        org_id: &str,
        target_duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<WarmupInstanceState, DatabaseError> {
        let now_str = ts(now);
        self.conn()
            .execute(
                "INSERT INTO warmup_instances (instance_id, org_id, status, start_time, elapsed_seconds, \
                     target_duration_seconds, progress_percent, last_active_at, updated_at) \
                 VALUES (?1, ?2, 'active', ?3, 0, ?4, 0, ?3, ?3) \
                 ON CONFLICT(instance_id) DO UPDATE SET \
                     status = 'active', \
                     org_id = excluded.org_id, \
                     start_time = COALESCE(warmup_instances.start_time, excluded.start_time), \
                     pause_time = NULL, \
                     status_reason = NULL, \
                     target_duration_seconds = excluded.target_duration_seconds, \
                     progress_percent = MIN(warmup_instances.elapsed_seconds * 100.0 \
                         / MAX(excluded.target_duration_seconds, 1), 100.0), \
                     last_active_at = excluded.last_active_at, \
                     updated_at = excluded.updated_at \
                 WHERE warmup_instances.status IN ('inactive', 'paused', 'error')",
                params![instance_id, org_id, now_str, target_duration_secs as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("activate_instance: {e}")))?;

        let state = self
            .query_state(instance_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "warmup_instance".into(),
                id: instance_id.to_string(),
            })?;

        debug!(instance_id, status = %state.status, "Instance activation applied");
        Ok(state)
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

        let count = self
            .conn()
            .execute(
                "UPDATE warmup_instances SET status = ?1, status_reason = ?2, \
                     pause_time = CASE WHEN ?1 = 'paused' THEN ?3 ELSE pause_time END, \
                     updated_at = ?3 \
                 WHERE instance_id = ?4 AND status = ?5",
                params![new.as_str(), opt_text(reason), ts(now), instance_id, expected.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_set_status: {e}")))?;

        if count > 0 {
            debug!(instance_id, from = %expected, to = %new, "Instance status changed");
        }
        Ok(count > 0)
    }

    async fn tick_progress(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WarmupInstanceState>, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE warmup_instances SET \
                     elapsed_seconds = elapsed_seconds + 1, \
                     progress_percent = MIN((elapsed_seconds + 1) * 100.0 \
                         / MAX(target_duration_seconds, 1), 100.0), \
                     last_active_at = ?1, \
                     updated_at = ?1 \
                 WHERE instance_id = ?2 AND status = 'active'",
                params![ts(now), instance_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("tick_progress: {e}")))?;

        if count == 0 {
            return Ok(None);
        }
        self.query_state(instance_id).await
    }

    async fn list_instance_states(
        &self,
        org_id: &str,
    ) -> Result<Vec<WarmupInstanceState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM warmup_instances WHERE org_id = ?1 ORDER BY instance_id"
                ),
                params![org_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_instance_states: {e}")))?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_state(&row) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!("Skipping instance row with parse error: {e}"),
            }
        }
        Ok(states)
    }

    async fn list_instances_by_status(
        &self,
        status: WarmupStatus,
    ) -> Result<Vec<WarmupInstanceState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM warmup_instances WHERE status = ?1 ORDER BY instance_id"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_instances_by_status: {e}")))?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_state(&row) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!("Skipping instance row with parse error: {e}"),
            }
        }
        Ok(states)
    }

    // ── Daily counters ──────────────────────────────────────────────

    async fn increment_sent(
        &self,
        key: &DailyKey,
        kind: MessageType,
        off_hours: bool,
    ) -> Result<(), DatabaseError> {
        let column = format!("{}_sent", kind.column_prefix());
        let sql = format!(
            "INSERT INTO media_stats_daily (instance_id, org_id, day, {column}, total_sent, off_hours_sent, updated_at) \
             VALUES (?1, ?2, ?3, 1, 1, ?4, ?5) \
             ON CONFLICT(instance_id, org_id, day) DO UPDATE SET \
                 {column} = {column} + 1, \
                 total_sent = total_sent + 1, \
                 off_hours_sent = off_hours_sent + excluded.off_hours_sent, \
                 updated_at = excluded.updated_at"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    key.instance_id.as_str(),
                    key.org_id.as_str(),
                    key.day.to_string(),
                    i64::from(off_hours),
                    ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_sent: {e}")))?;
        Ok(())
    }

    async fn increment_received(
        &self,
        key: &DailyKey,
        kind: MessageType,
    ) -> Result<(), DatabaseError> {
        let column = format!("{}_received", kind.column_prefix());
        let sql = format!(
            "INSERT INTO media_stats_daily (instance_id, org_id, day, {column}, total_received, updated_at) \
             VALUES (?1, ?2, ?3, 1, 1, ?4) \
             ON CONFLICT(instance_id, org_id, day) DO UPDATE SET \
                 {column} = {column} + 1, \
                 total_received = total_received + 1, \
                 updated_at = excluded.updated_at"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    key.instance_id.as_str(),
                    key.org_id.as_str(),
                    key.day.to_string(),
                    ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_received: {e}")))?;
        Ok(())
    }

    async fn increment_signal(
        &self,
        key: &DailyKey,
        signal: DeliverySignal,
    ) -> Result<(), DatabaseError> {
        let column = signal.column();
        let sql = format!(
            "INSERT INTO media_stats_daily (instance_id, org_id, day, {column}, updated_at) \
             VALUES (?1, ?2, ?3, 1, ?4) \
             ON CONFLICT(instance_id, org_id, day) DO UPDATE SET \
                 {column} = {column} + 1, \
                 updated_at = excluded.updated_at"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    key.instance_id.as_str(),
                    key.org_id.as_str(),
                    key.day.to_string(),
                    ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_signal: {e}")))?;
        Ok(())
    }

    async fn get_daily_stats(&self, key: &DailyKey) -> Result<MediaStatsDaily, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATS_COLUMNS} FROM media_stats_daily \
                     WHERE instance_id = ?1 AND org_id = ?2 AND day = ?3"
                ),
                params![key.instance_id.as_str(), key.org_id.as_str(), key.day.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_daily_stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_stats(&row)
                .map_err(|e| DatabaseError::Query(format!("stats row parse: {e}"))),
            Ok(None) => Ok(MediaStatsDaily::empty(key)),
            Err(e) => Err(DatabaseError::Query(format!("get_daily_stats: {e}"))),
        }
    }

    async fn list_daily_stats(
        &self,
        instance_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MediaStatsDaily>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STATS_COLUMNS} FROM media_stats_daily \
                     WHERE instance_id = ?1 AND day >= ?2 AND day <= ?3 ORDER BY day ASC"
                ),
                params![instance_id, from.to_string(), to.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_daily_stats: {e}")))?;

        let mut days = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_stats(&row) {
                Ok(stats) => days.push(stats),
                Err(e) => tracing::warn!("Skipping stats row with parse error: {e}"),
            }
        }
        Ok(days)
    }

    // ── External numbers ────────────────────────────────────────────

    async fn add_external_number(
        &self,
        org_id: &str,
        phone_number: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO external_numbers (org_id, phone_number, active, created_at) \
                 VALUES (?1, ?2, 1, ?3) \
                 ON CONFLICT(org_id, phone_number) DO UPDATE SET active = 1",
                params![org_id, phone_number, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_external_number: {e}")))?;
        Ok(())
    }

    async fn set_external_number_active(
        &self,
        org_id: &str,
        phone_number: &str,
        active: bool,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE external_numbers SET active = ?1 WHERE org_id = ?2 AND phone_number = ?3",
                params![i64::from(active), org_id, phone_number],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_external_number_active: {e}")))?;
        Ok(count > 0)
    }

    async fn list_external_numbers(
        &self,
        org_id: &str,
        active_only: bool,
    ) -> Result<Vec<ExternalNumber>, DatabaseError> {
        let sql = if active_only {
            "SELECT org_id, phone_number, active FROM external_numbers \
             WHERE org_id = ?1 AND active = 1 ORDER BY created_at ASC, rowid ASC"
        } else {
            "SELECT org_id, phone_number, active FROM external_numbers \
             WHERE org_id = ?1 ORDER BY created_at ASC, rowid ASC"
        };
        let mut rows = self
            .conn()
            .query(sql, params![org_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_external_numbers: {e}")))?;

        let mut numbers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let parsed = (|| -> Result<ExternalNumber, libsql::Error> {
                Ok(ExternalNumber {
                    org_id: row.get(0)?,
                    phone_number: row.get(1)?,
                    active: row.get::<i64>(2)? != 0,
                })
            })();
            match parsed {
                Ok(number) => numbers.push(number),
                Err(e) => tracing::warn!("Skipping external number row with parse error: {e}"),
            }
        }
        Ok(numbers)
    }

    // ── Benchmarks ──────────────────────────────────────────────────

    async fn get_active_benchmark(&self) -> Result<Option<Benchmark>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BENCHMARK_COLUMNS} FROM health_benchmarks \
                     WHERE is_active = 1 ORDER BY version DESC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_benchmark: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_benchmark(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_benchmark: {e}"))),
        }
    }

    async fn insert_benchmark(
        &self,
        benchmark: &Benchmark,
        activate: bool,
    ) -> Result<Benchmark, DatabaseError> {
        let config = to_json(&benchmark.config, "benchmark config")?;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_benchmark begin: {e}")))?;

        let inserted = async {
            let mut rows = tx
                .query(
                    "INSERT INTO health_benchmarks (name, is_active, config, created_at) \
                     VALUES (?1, 0, ?2, ?3) RETURNING version",
                    params![benchmark.name.as_str(), config, ts(benchmark.created_at)],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_benchmark: {e}")))?;

            let version: i64 = match rows.next().await {
                Ok(Some(row)) => row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("insert_benchmark version: {e}")))?,
                Ok(None) => {
                    return Err(DatabaseError::Query(
                        "insert_benchmark: no version returned".into(),
                    ));
                }
                Err(e) => return Err(DatabaseError::Query(format!("insert_benchmark: {e}"))),
            };
            drop(rows);

            if activate {
                tx.execute(ACTIVATE_BENCHMARK_SQL, params![version])
                    .await
                    .map_err(|e| DatabaseError::Query(format!("insert_benchmark activate: {e}")))?;
            }
            Ok::<_, DatabaseError>(version)
        }
        .await;

        let version = match inserted {
            Ok(version) => version,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "insert_benchmark rollback failed");
                }
                return Err(e);
            }
        };

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_benchmark commit: {e}")))?;

        Ok(Benchmark {
            version,
            is_active: activate,
            ..benchmark.clone()
        })
    }

    async fn activate_benchmark(&self, version: i64) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(ACTIVATE_BENCHMARK_SQL, params![version])
            .await
            .map_err(|e| DatabaseError::Query(format!("activate_benchmark: {e}")))?;
        Ok(count > 0)
    }

    async fn list_benchmarks(&self) -> Result<Vec<Benchmark>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {BENCHMARK_COLUMNS} FROM health_benchmarks ORDER BY version DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_benchmarks: {e}")))?;

        let mut benchmarks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            benchmarks.push(row_to_benchmark(&row)?);
        }
        Ok(benchmarks)
    }

    // ── Health snapshots ────────────────────────────────────────────

    async fn append_snapshot(&self, snapshot: &HealthMetricsSnapshot) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO health_snapshots ({SNAPSHOT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    snapshot.id.to_string(),
                    snapshot.instance_id.as_str(),
                    snapshot.org_id.as_str(),
                    snapshot.health_score,
                    snapshot.risk_level.to_string(),
                    to_json(&snapshot.risk_factors, "risk factors")?,
                    to_json(&snapshot.signals, "signals")?,
                    to_json(&snapshot.factor_scores, "factor scores")?,
                    snapshot.base_score,
                    snapshot.penalty_multiplier,
                    opt_integer(snapshot.benchmark_version),
                    ts(snapshot.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_snapshot: {e}")))?;

        debug!(
            instance_id = %snapshot.instance_id,
            snapshot_id = %snapshot.id,
            "Health snapshot stored"
        );
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        instance_id: &str,
    ) -> Result<Option<HealthMetricsSnapshot>, DatabaseError> {
        Ok(self.query_snapshots(instance_id, 1).await?.into_iter().next())
    }

    async fn list_snapshots(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthMetricsSnapshot>, DatabaseError> {
        self.query_snapshots(instance_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::model::{RawSignals, RiskLevel};
    use uuid::Uuid;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn key(day: &str) -> DailyKey {
        DailyKey::new(
            "inst-1",
            "org-1",
            NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap(),
        )
    }

    fn snapshot(instance_id: &str, risk_level: RiskLevel, created_at: DateTime<Utc>) -> HealthMetricsSnapshot {
        HealthMetricsSnapshot {
            id: Uuid::new_v4(),
            instance_id: instance_id.into(),
            org_id: "org-1".into(),
            signals: RawSignals::nominal(),
            factor_scores: Vec::new(),
            base_score: 100.0,
            penalty_multiplier: 1.0,
            health_score: 100.0,
            risk_level,
            risk_factors: vec!["Spam reports received: 1".into()],
            benchmark_version: Some(1),
            created_at,
        }
    }

    // ── Instance state ──────────────────────────────────────────────

    #[tokio::test]
    async fn activate_creates_and_resumes() {
        let db = test_db().await;
        let now = Utc::now();

        let state = db.activate_instance("inst-1", "org-1", 100, now).await.unwrap();
        assert_eq!(state.status, WarmupStatus::Active);
        assert_eq!(state.elapsed_seconds, 0);
        assert!(state.start_time.is_some());

        for _ in 0..25 {
            db.tick_progress("inst-1", now).await.unwrap().unwrap();
        }
        assert!(
            db.compare_and_set_status("inst-1", WarmupStatus::Active, WarmupStatus::Paused, Some("stopped"), now)
                .await
                .unwrap()
        );
        let paused = db.get_instance_state("inst-1").await.unwrap().unwrap();
        assert_eq!(paused.status, WarmupStatus::Paused);
        assert_eq!(paused.status_reason.as_deref(), Some("stopped"));
        assert!(paused.pause_time.is_some());

        let resumed = db.activate_instance("inst-1", "org-1", 100, now).await.unwrap();
        assert_eq!(resumed.status, WarmupStatus::Active);
        assert_eq!(resumed.elapsed_seconds, 25);
        assert!((resumed.progress_percent - 25.0).abs() < 1e-9);
        assert!(resumed.pause_time.is_none());
    }

    #[tokio::test]
    async fn activate_does_not_reopen_completed() {
        let db = test_db().await;
        let now = Utc::now();
        db.activate_instance("inst-1", "org-1", 1, now).await.unwrap();
        db.tick_progress("inst-1", now).await.unwrap();
        db.compare_and_set_status("inst-1", WarmupStatus::Active, WarmupStatus::Completed, None, now)
            .await
            .unwrap();

        let state = db.activate_instance("inst-1", "org-1", 1, now).await.unwrap();
        assert_eq!(state.status, WarmupStatus::Completed);
    }

    #[tokio::test]
    async fn tick_clamps_progress_and_ignores_inactive() {
        let db = test_db().await;
        let now = Utc::now();
        assert!(db.tick_progress("missing", now).await.unwrap().is_none());

        db.activate_instance("inst-1", "org-1", 10, now).await.unwrap();
        let mut last = None;
        for _ in 0..12 {
            last = db.tick_progress("inst-1", now).await.unwrap();
        }
        let state = last.unwrap();
        assert_eq!(state.elapsed_seconds, 12);
        assert_eq!(state.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn compare_and_set_requires_expected_status() {
        let db = test_db().await;
        let now = Utc::now();
        db.activate_instance("inst-1", "org-1", 10, now).await.unwrap();

        assert!(
            !db.compare_and_set_status("inst-1", WarmupStatus::Paused, WarmupStatus::Active, None, now)
                .await
                .unwrap()
        );
        assert!(
            db.compare_and_set_status("inst-1", WarmupStatus::Active, WarmupStatus::Error, Some("failures"), now)
                .await
                .unwrap()
        );
        assert!(
            db.compare_and_set_status("inst-1", WarmupStatus::Completed, WarmupStatus::Active, None, now)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn list_instance_states_by_org() {
        let db = test_db().await;
        let now = Utc::now();
        db.activate_instance("a", "org-1", 10, now).await.unwrap();
        db.activate_instance("b", "org-1", 10, now).await.unwrap();
        db.activate_instance("c", "org-2", 10, now).await.unwrap();

        let states = db.list_instance_states("org-1").await.unwrap();
        let ids: Vec<_> = states.iter().map(|s| s.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    // ── Daily counters ──────────────────────────────────────────────

    #[tokio::test]
    async fn counters_upsert_and_stay_consistent() {
        let db = test_db().await;
        let k = key("2026-03-01");

        db.increment_sent(&k, MessageType::Text, false).await.unwrap();
        db.increment_sent(&k, MessageType::Text, true).await.unwrap();
        db.increment_sent(&k, MessageType::Video, false).await.unwrap();
        db.increment_received(&k, MessageType::Audio).await.unwrap();
        db.increment_signal(&k, DeliverySignal::Delivered).await.unwrap();
        db.increment_signal(&k, DeliverySignal::Read).await.unwrap();

        let stats = db.get_daily_stats(&k).await.unwrap();
        assert_eq!(stats.total_sent, 3);
        assert_eq!(stats.total_sent, stats.sent_by_type_sum());
        assert_eq!(stats.sent(MessageType::Text), 2);
        assert_eq!(stats.sent(MessageType::Video), 1);
        assert_eq!(stats.received(MessageType::Audio), 1);
        assert_eq!(stats.off_hours_sent, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.read, 1);
        assert_eq!(stats.day, Some(k.day));
    }

    #[tokio::test]
    async fn missing_day_is_zeroed() {
        let db = test_db().await;
        let k = key("2026-03-02");
        let stats = db.get_daily_stats(&k).await.unwrap();
        assert_eq!(stats, MediaStatsDaily::empty(&k));
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let db = Arc::new(test_db().await);
        let k = key("2026-03-03");

        let mut handles = Vec::new();
        for i in 0..20 {
            let db = Arc::clone(&db);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let kind = if i % 2 == 0 { MessageType::Text } else { MessageType::Sticker };
                db.increment_sent(&k, kind, false).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = db.get_daily_stats(&k).await.unwrap();
        assert_eq!(stats.total_sent, 20);
        assert_eq!(stats.sent(MessageType::Text), 10);
        assert_eq!(stats.sent(MessageType::Sticker), 10);
    }

    #[tokio::test]
    async fn list_daily_stats_range() {
        let db = test_db().await;
        for day in ["2026-03-01", "2026-03-02", "2026-03-05"] {
            db.increment_sent(&key(day), MessageType::Text, false).await.unwrap();
        }
        let from = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        let days = db.list_daily_stats("inst-1", from, to).await.unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].day, Some(from));
    }

    // ── External numbers ────────────────────────────────────────────

    #[tokio::test]
    async fn external_numbers_toggle() {
        let db = test_db().await;
        db.add_external_number("org-1", "5511999990001").await.unwrap();
        db.add_external_number("org-1", "5511999990002").await.unwrap();
        db.add_external_number("org-1", "5511999990001").await.unwrap();

        assert_eq!(db.list_external_numbers("org-1", true).await.unwrap().len(), 2);
        assert!(
            db.set_external_number_active("org-1", "5511999990002", false)
                .await
                .unwrap()
        );
        let active = db.list_external_numbers("org-1", true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].phone_number, "5511999990001");
        assert_eq!(db.list_external_numbers("org-1", false).await.unwrap().len(), 2);
        assert!(
            !db.set_external_number_active("org-1", "000", true)
                .await
                .unwrap()
        );
    }

    // ── Benchmarks ──────────────────────────────────────────────────

    #[tokio::test]
    async fn single_active_benchmark() {
        let db = test_db().await;
        assert!(db.get_active_benchmark().await.unwrap().is_none());

        let first = db
            .insert_benchmark(&Benchmark::new("default", BenchmarkConfig::default()), true)
            .await
            .unwrap();
        let second = db
            .insert_benchmark(&Benchmark::new("strict", BenchmarkConfig::default()), false)
            .await
            .unwrap();
        assert!(second.version > first.version);
        assert_eq!(db.get_active_benchmark().await.unwrap().unwrap().version, first.version);

        assert!(db.activate_benchmark(second.version).await.unwrap());
        let active = db.get_active_benchmark().await.unwrap().unwrap();
        assert_eq!(active.version, second.version);
        assert_eq!(active.config, BenchmarkConfig::default());

        let all = db.list_benchmarks().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|b| b.is_active).count(), 1);

        assert!(!db.activate_benchmark(42).await.unwrap());
        assert_eq!(db.get_active_benchmark().await.unwrap().unwrap().version, second.version);
    }

    #[tokio::test]
    async fn failed_activation_leaves_no_orphan_benchmark() {
        let db = test_db().await;
        let first = db
            .insert_benchmark(&Benchmark::new("default", BenchmarkConfig::default()), true)
            .await
            .unwrap();

        db.conn()
            .execute_batch(
                "CREATE TRIGGER block_activation BEFORE UPDATE ON health_benchmarks \
                 BEGIN SELECT RAISE(ABORT, 'activation blocked'); END;",
            )
            .await
            .unwrap();

        let err = db
            .insert_benchmark(&Benchmark::new("strict", BenchmarkConfig::default()), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("activation blocked"), "{err}");

        let all = db.list_benchmarks().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, first.version);
        assert!(all[0].is_active);

        // The connection is usable again once the trigger is gone.
        db.conn().execute_batch("DROP TRIGGER block_activation;").await.unwrap();
        let third = db
            .insert_benchmark(&Benchmark::new("strict", BenchmarkConfig::default()), true)
            .await
            .unwrap();
        assert_eq!(db.get_active_benchmark().await.unwrap().unwrap().version, third.version);
    }

    // ── Snapshots ───────────────────────────────────────────────────

    #[tokio::test]
    async fn snapshots_are_newest_first() {
        let db = test_db().await;
        let t0 = Utc::now();
        let older = snapshot("inst-1", RiskLevel::Low, t0);
        let newer = snapshot("inst-1", RiskLevel::Critical, t0 + chrono::Duration::seconds(5));
        db.append_snapshot(&older).await.unwrap();
        db.append_snapshot(&newer).await.unwrap();
        db.append_snapshot(&snapshot("other", RiskLevel::Low, t0)).await.unwrap();

        let latest = db.latest_snapshot("inst-1").await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
        assert_eq!(latest.risk_level, RiskLevel::Critical);
        assert_eq!(latest.signals, RawSignals::nominal());
        assert_eq!(latest.benchmark_version, Some(1));

        let all = db.list_snapshots("inst-1", 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id, older.id);
        assert!(db.latest_snapshot("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warmup.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.activate_instance("inst-1", "org-1", 60, Utc::now()).await.unwrap();
            db.increment_sent(&key("2026-03-01"), MessageType::Image, false)
                .await
                .unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let state = db.get_instance_state("inst-1").await.unwrap().unwrap();
        assert_eq!(state.status, WarmupStatus::Active);
        let stats = db.get_daily_stats(&key("2026-03-01")).await.unwrap();
        assert_eq!(stats.sent(MessageType::Image), 1);
    }
}
