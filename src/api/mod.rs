//! HTTP control surface.
//!
//! Handlers validate input and delegate to the scheduler, the analyzer or the
//! store. No business logic lives here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::{OrgContext, WarmupConfig};
use crate::error::{AnalysisError, ConfigError, DatabaseError, WarmupError};
use crate::health::{BenchmarkConfig, HealthAnalyzer};
use crate::store::WarmupStore;
use crate::warmup::behavior::Target;
use crate::warmup::dispatcher::{WebhookOutcome, normalize_target};
use crate::warmup::{InstanceScheduler, WebhookEvent};

const DEFAULT_SNAPSHOT_LIMIT: usize = 20;
const MAX_SNAPSHOT_LIMIT: usize = 500;
const MAX_STATS_DAYS: i64 = 90;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<InstanceScheduler>,
    pub analyzer: Arc<HealthAnalyzer>,
    pub store: Arc<dyn WarmupStore>,
}

/// Build the API router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/warmup/start", post(start_warmup))
        .route("/api/warmup/running", get(list_running))
        .route("/api/warmup/{instance}/stop", post(stop_warmup))
        .route("/api/warmup/{instance}/status", get(warmup_status))
        .route("/api/warmup/{instance}/stats", get(warmup_stats))
        .route("/api/health/benchmarks", get(list_benchmarks).post(create_benchmark))
        .route("/api/health/benchmarks/{version}/activate", post(activate_benchmark))
        .route("/api/health/{instance}/analyze", post(analyze_instance))
        .route("/api/health/{instance}/snapshots", get(list_snapshots))
        .route("/api/webhook/{instance}", post(webhook))
        .route("/api/orgs/{org}/warmups", get(list_org_warmups))
        .route(
            "/api/orgs/{org}/external-numbers",
            get(list_external_numbers).post(add_external_number),
        )
        .route(
            "/api/orgs/{org}/external-numbers/{number}",
            delete(deactivate_external_number),
        )
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn database_error(e: &DatabaseError) -> Response {
    match e {
        DatabaseError::NotFound { .. } => error(StatusCode::NOT_FOUND, e.to_string()),
        _ => {
            warn!(error = %e, "Database error in request");
            error(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        }
    }
}

fn warmup_error(e: &WarmupError) -> Response {
    let status = match e {
        WarmupError::AlreadyRunning { .. }
        | WarmupError::Stopping { .. }
        | WarmupError::InvalidTransition { .. }
        | WarmupError::CriticalRisk { .. } => StatusCode::CONFLICT,
        WarmupError::NotRunning { .. } => StatusCode::NOT_FOUND,
        WarmupError::Config(
            ConfigError::NoDestinations { .. }
            | ConfigError::NoContent { .. }
            | ConfigError::PlanLimitExceeded { .. },
        ) => StatusCode::UNPROCESSABLE_ENTITY,
        WarmupError::Config(_) => StatusCode::BAD_REQUEST,
        WarmupError::Database(db) => return database_error(db),
    };
    error(status, e.to_string())
}

fn analysis_error(e: &AnalysisError) -> Response {
    match e {
        AnalysisError::InvalidBenchmark(_) => error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        AnalysisError::SignalCollection { .. } => error(StatusCode::BAD_GATEWAY, e.to_string()),
        AnalysisError::Persist(db) => database_error(db),
        AnalysisError::BenchmarkLoad(_) => {
            warn!(error = %e, "Benchmark load failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "warmup-orchestrator",
        "running": state.scheduler.running_count().await,
    }))
}

// ── Warmup ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartRequest {
    org_id: String,
    config: WarmupConfig,
}

async fn start_warmup(State(state): State<AppState>, Json(body): Json<StartRequest>) -> Response {
    let org = OrgContext::new(body.org_id);
    match state.scheduler.start(body.config, &org).await {
        Ok(run) => (StatusCode::CREATED, Json(json!(run))).into_response(),
        Err(e) => {
            info!(org_id = %org.org_id, error = %e, "Warmup start rejected");
            warmup_error(&e)
        }
    }
}

async fn stop_warmup(State(state): State<AppState>, Path(instance): Path<String>) -> Response {
    match state.scheduler.stop(&instance).await {
        Ok(run) => Json(json!(run)).into_response(),
        Err(e) => warmup_error(&e),
    }
}

async fn list_running(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.running_instances().await)
}

async fn warmup_status(State(state): State<AppState>, Path(instance): Path<String>) -> Response {
    match state.scheduler.status(&instance).await {
        Ok(Some(run)) => Json(json!({
            "state": run,
            "running": state.scheduler.is_running(&instance).await,
        }))
        .into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("no warmup for instance {instance}")),
        Err(e) => warmup_error(&e),
    }
}

/// Every persisted warmup of an organization, running or not.
async fn list_org_warmups(State(state): State<AppState>, Path(org): Path<String>) -> Response {
    match state.store.list_instance_states(&org).await {
        Ok(states) => Json(states).into_response(),
        Err(e) => database_error(&e),
    }
}

#[derive(Deserialize)]
struct StatsQuery {
    days: Option<i64>,
}

/// Daily counters for the last `days` UTC days (today included).
async fn warmup_stats(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let days = query.days.unwrap_or(1).clamp(1, MAX_STATS_DAYS);
    let to = Utc::now().date_naive();
    let from = to - ChronoDuration::days(days - 1);
    match state.store.list_daily_stats(&instance, from, to).await {
        Ok(stats) => Json(json!({ "instance_id": instance, "from": from, "to": to, "days": stats }))
            .into_response(),
        Err(e) => database_error(&e),
    }
}

// ── Health analysis ─────────────────────────────────────────────────────

async fn analyze_instance(State(state): State<AppState>, Path(instance): Path<String>) -> Response {
    let org_id = match state.store.get_instance_state(&instance).await {
        Ok(Some(run)) => run.org_id,
        Ok(None) => return error(StatusCode::NOT_FOUND, format!("no warmup for instance {instance}")),
        Err(e) => return database_error(&e),
    };

    match state.analyzer.analyze(&instance, &org_id).await {
        Ok(snapshot) => Json(json!(snapshot)).into_response(),
        Err(e) => analysis_error(&e),
    }
}

#[derive(Deserialize)]
struct SnapshotQuery {
    limit: Option<usize>,
}

async fn list_snapshots(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SNAPSHOT_LIMIT)
        .clamp(1, MAX_SNAPSHOT_LIMIT);
    match state.analyzer.history(&instance, limit).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(e) => analysis_error(&e),
    }
}

async fn list_benchmarks(State(state): State<AppState>) -> Response {
    match state.analyzer.benchmarks().list().await {
        Ok(all) => Json(all).into_response(),
        Err(e) => analysis_error(&e),
    }
}

#[derive(Deserialize)]
struct CreateBenchmarkRequest {
    name: String,
    #[serde(default)]
    config: BenchmarkConfig,
    #[serde(default)]
    activate: bool,
}

async fn create_benchmark(
    State(state): State<AppState>,
    Json(body): Json<CreateBenchmarkRequest>,
) -> Response {
    match state
        .analyzer
        .benchmarks()
        .create(&body.name, body.config, body.activate)
        .await
    {
        Ok(benchmark) => (StatusCode::CREATED, Json(json!(benchmark))).into_response(),
        Err(e) => analysis_error(&e),
    }
}

async fn activate_benchmark(State(state): State<AppState>, Path(version): Path<i64>) -> Response {
    match state.analyzer.benchmarks().activate(version).await {
        Ok(()) => Json(json!({ "active_version": version })).into_response(),
        Err(AnalysisError::BenchmarkLoad(message)) => error(StatusCode::NOT_FOUND, message),
        Err(e) => analysis_error(&e),
    }
}

// ── Webhook ─────────────────────────────────────────────────────────────

async fn webhook(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let event = match WebhookEvent::parse(body) {
        Ok(event) => event,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid webhook payload: {e}")),
    };

    let dispatcher = state.scheduler.dispatcher();
    match dispatcher.handle_webhook(&instance, &event).await {
        Ok(outcome) => {
            let recorded = match outcome {
                WebhookOutcome::Received(kind) => json!({ "received": kind }),
                WebhookOutcome::Signal(signal) => json!({ "signal": signal }),
                WebhookOutcome::Ignored => json!(null),
            };
            Json(json!({ "recorded": recorded })).into_response()
        }
        Err(e) => database_error(&e),
    }
}

// ── External numbers ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExternalNumbersQuery {
    #[serde(default)]
    active_only: bool,
}

async fn list_external_numbers(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Query(query): Query<ExternalNumbersQuery>,
) -> Response {
    match state.store.list_external_numbers(&org, query.active_only).await {
        Ok(numbers) => Json(numbers).into_response(),
        Err(e) => database_error(&e),
    }
}

#[derive(Deserialize)]
struct AddNumberRequest {
    phone_number: String,
}

async fn add_external_number(
    State(state): State<AppState>,
    Path(org): Path<String>,
    Json(body): Json<AddNumberRequest>,
) -> Response {
    let target = Target::External {
        phone_number: body.phone_number,
    };
    let number = match normalize_target(&target) {
        Ok(recipient) => recipient.number,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.store.add_external_number(&org, &number).await {
        Ok(()) => {
            info!(org_id = %org, phone_number = %number, "External number added");
            (
                StatusCode::CREATED,
                Json(json!({ "org_id": org, "phone_number": number, "active": true })),
            )
                .into_response()
        }
        Err(e) => database_error(&e),
    }
}

async fn deactivate_external_number(
    State(state): State<AppState>,
    Path((org, number)): Path<(String, String)>,
) -> Response {
    match state.store.set_external_number_active(&org, &number, false).await {
        Ok(true) => Json(json!({ "org_id": org, "phone_number": number, "active": false })).into_response(),
        Ok(false) => error(StatusCode::NOT_FOUND, format!("unknown external number {number}")),
        Err(e) => database_error(&e),
    }
}
