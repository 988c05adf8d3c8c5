//! Schema for the libSQL backend.
//!
//! Versions are recorded in `schema_versions`. Each pending step runs in one
//! batch together with its version row, so a failed step leaves no trace.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "warmup_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS warmup_instances (
                instance_id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'inactive',
                start_time TEXT,
                pause_time TEXT,
                elapsed_seconds INTEGER NOT NULL DEFAULT 0,
                target_duration_seconds INTEGER NOT NULL,
                progress_percent REAL NOT NULL DEFAULT 0,
                last_active_at TEXT,
                status_reason TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_warmup_instances_org ON warmup_instances(org_id);
            CREATE INDEX IF NOT EXISTS idx_warmup_instances_status ON warmup_instances(status);

            CREATE TABLE IF NOT EXISTS media_stats_daily (
                instance_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                day TEXT NOT NULL,
                text_sent INTEGER NOT NULL DEFAULT 0,
                audio_sent INTEGER NOT NULL DEFAULT 0,
                sticker_sent INTEGER NOT NULL DEFAULT 0,
                image_sent INTEGER NOT NULL DEFAULT 0,
                video_sent INTEGER NOT NULL DEFAULT 0,
                text_received INTEGER NOT NULL DEFAULT 0,
                audio_received INTEGER NOT NULL DEFAULT 0,
                sticker_received INTEGER NOT NULL DEFAULT 0,
                image_received INTEGER NOT NULL DEFAULT 0,
                video_received INTEGER NOT NULL DEFAULT 0,
                total_sent INTEGER NOT NULL DEFAULT 0,
                total_received INTEGER NOT NULL DEFAULT 0,
                delivered INTEGER NOT NULL DEFAULT 0,
                read_count INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0,
                spam_reports INTEGER NOT NULL DEFAULT 0,
                policy_violations INTEGER NOT NULL DEFAULT 0,
                warnings INTEGER NOT NULL DEFAULT 0,
                off_hours_sent INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (instance_id, org_id, day)
            );
            CREATE INDEX IF NOT EXISTS idx_media_stats_daily_day ON media_stats_daily(day);

            CREATE TABLE IF NOT EXISTS external_numbers (
                org_id TEXT NOT NULL,
                phone_number TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (org_id, phone_number)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "health_scoring",
        sql: r#"
            CREATE TABLE IF NOT EXISTS health_benchmarks (
                version INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_benchmarks_active ON health_benchmarks(is_active);

            CREATE TABLE IF NOT EXISTS health_snapshots (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                health_score REAL NOT NULL,
                risk_level TEXT NOT NULL,
                risk_factors TEXT NOT NULL DEFAULT '[]',
                signals TEXT NOT NULL,
                factor_scores TEXT NOT NULL DEFAULT '[]',
                base_score REAL NOT NULL,
                penalty_multiplier REAL NOT NULL,
                benchmark_version INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_snapshots_instance
                ON health_snapshots(instance_id, created_at);
        "#,
    },
];

fn migration_error(context: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the newest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_error("create schema_versions", e))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_versions (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Best effort: the batch may have stopped inside the transaction.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(migration_error(
                &format!("schema step {} ({})", step.version, step.name),
                e,
            ));
        }
        tracing::info!(version = step.version, name = step.name, "Applied schema step");
    }

    Ok(())
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| migration_error("query schema version", e))?;

    match rows.next().await.map_err(|e| migration_error("read schema version", e))? {
        Some(row) => row.get(0).map_err(|e| migration_error("parse schema version", e)),
        None => Ok(0),
    }
}
