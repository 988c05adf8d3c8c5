use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use warmup_orchestrator::api::{self, AppState};
use warmup_orchestrator::config::ServiceConfig;
use warmup_orchestrator::health::{HealthAnalyzer, StoreSignalProvider, spawn_health_monitor};
use warmup_orchestrator::plans::{PlanResolver, StaticPlanResolver};
use warmup_orchestrator::sendapi::{EvolutionClient, SendApi};
use warmup_orchestrator::store::{LibSqlBackend, WarmupStore};
use warmup_orchestrator::warmup::{InstanceScheduler, SchedulerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("Invalid service configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📱 Warmup orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);
    eprintln!("   Evolution API: {}", config.evolution_url);
    eprintln!("   Default plan: {}", config.default_plan);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn WarmupStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────────
    let api: Arc<dyn SendApi> = Arc::new(EvolutionClient::new(
        config.evolution_url.clone(),
        config.evolution_api_key.clone(),
    ));
    let plans: Arc<dyn PlanResolver> = Arc::new(StaticPlanResolver::from_pairs(
        config.default_plan,
        config.org_plans.clone(),
    ));

    let scheduler = Arc::new(InstanceScheduler::new(
        Arc::clone(&store),
        api,
        Arc::clone(&plans),
        SchedulerOptions {
            send_timeout: config.send_timeout,
            ..Default::default()
        },
    ));

    // ── Startup Recovery: no loop survives a restart ──────────────────────
    match scheduler.recover_orphaned().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Paused {n} warmups left active by a previous run"),
        Err(e) => tracing::warn!(error = %e, "Startup recovery failed"),
    }

    // ── Health ───────────────────────────────────────────────────────────
    let signals = Arc::new(StoreSignalProvider::new(Arc::clone(&store), plans));
    let analyzer = Arc::new(HealthAnalyzer::new(Arc::clone(&store), signals));
    analyzer
        .benchmarks()
        .active()
        .await
        .context("Failed to load scoring benchmark")?;

    let shutdown = CancellationToken::new();
    let monitor_handle = spawn_health_monitor(
        Arc::clone(&analyzer),
        Arc::clone(&scheduler),
        config.health_interval,
        shutdown.clone(),
    );
    eprintln!("   Health checks: every {}s", config.health_interval.as_secs());

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::routes(AppState {
        scheduler: Arc::clone(&scheduler),
        analyzer,
        store,
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server started");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    tracing::info!("Shutting down");
    shutdown.cancel();
    scheduler.stop_all().await;
    if let Err(e) = monitor_handle.await {
        tracing::warn!(error = %e, "Health monitor ended abnormally");
    }

    Ok(())
}

/// Stderr logging, plus a daily-rolling file when a log directory is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "warmupd.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
