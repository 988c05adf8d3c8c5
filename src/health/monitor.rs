//! Periodic health analysis of running warmups.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::analyzer::HealthAnalyzer;
use crate::warmup::scheduler::InstanceScheduler;

/// Spawn the health monitor background loop.
///
/// Every `interval` it analyses each instance with a registered loop. The
/// first pass runs one interval after start.
pub fn spawn_health_monitor(
    analyzer: Arc<HealthAnalyzer>,
    scheduler: Arc<InstanceScheduler>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Health monitor started (interval: {}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    run_health_cycle(&analyzer, &scheduler).await;
                }
            }
        }

        info!("Health monitor stopped");
    })
}

/// Analyse every running instance once.
pub async fn run_health_cycle(analyzer: &HealthAnalyzer, scheduler: &InstanceScheduler) -> usize {
    let running = scheduler.running_instances().await;
    if running.is_empty() {
        debug!("Health cycle: no running instances");
        return 0;
    }

    let mut analysed = 0;
    for instance in running {
        match analyzer
            .analyze(&instance.instance_id, &instance.org_id)
            .await
        {
            Ok(snapshot) => {
                analysed += 1;
                debug!(
                    instance_id = %instance.instance_id,
                    health_score = snapshot.health_score,
                    risk_level = %snapshot.risk_level,
                    "Health cycle analysed instance"
                );
            }
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Health analysis failed");
            }
        }
    }
    analysed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrgContext, PeerInstance, WarmupConfig};
    use crate::error::{AnalysisError, SendError};
    use crate::health::model::RawSignals;
    use crate::health::signals::SignalProvider;
    use crate::plans::{PlanTier, StaticPlanResolver};
    use crate::sendapi::SendApi;
    use crate::store::{MemoryStore, WarmupStore};
    use crate::warmup::content::{ContentLibrary, MediaItem, MessageType};
    use crate::warmup::scheduler::SchedulerOptions;
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl SendApi for AcceptAll {
        async fn send_text(&self, _: &str, _: &str, _: &str) -> Result<String, SendError> {
            Ok("id".into())
        }
        async fn send_media(&self, _: &str, _: &str, _: MessageType, _: &MediaItem) -> Result<String, SendError> {
            Ok("id".into())
        }
        async fn send_audio(&self, _: &str, _: &str, _: &str) -> Result<String, SendError> {
            Ok("id".into())
        }
        async fn send_sticker(&self, _: &str, _: &str, _: &str) -> Result<String, SendError> {
            Ok("id".into())
        }
        async fn send_reaction(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String, SendError> {
            Ok("id".into())
        }
    }

    struct Signals(Option<RawSignals>);

    #[async_trait]
    impl SignalProvider for Signals {
        async fn collect(&self, instance_id: &str, _: &str) -> Result<RawSignals, AnalysisError> {
            self.0.clone().ok_or_else(|| AnalysisError::SignalCollection {
                instance_id: instance_id.to_string(),
                reason: "offline".into(),
            })
        }
    }

    fn setup(signals: Option<RawSignals>) -> (Arc<dyn WarmupStore>, Arc<InstanceScheduler>, Arc<HealthAnalyzer>) {
        let store: Arc<dyn WarmupStore> = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(InstanceScheduler::new(
            store.clone(),
            Arc::new(AcceptAll),
            Arc::new(StaticPlanResolver::new(PlanTier::Enterprise)),
            SchedulerOptions {
                rng_seed: Some(3),
                ..Default::default()
            },
        ));
        let analyzer = Arc::new(HealthAnalyzer::new(store.clone(), Arc::new(Signals(signals))));
        (store, scheduler, analyzer)
    }

    fn config(instance_id: &str) -> WarmupConfig {
        WarmupConfig {
            instance_id: instance_id.into(),
            min_delay_secs: 600,
            max_delay_secs: 600,
            human_behavior: false,
            peers: vec![PeerInstance {
                instance_id: "peer".into(),
                phone_number: "5511900000009".into(),
            }],
            content: ContentLibrary {
                texts: vec!["oi".into()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_analyses_running_instances() {
        let (store, scheduler, analyzer) = setup(Some(RawSignals::nominal()));
        assert_eq!(run_health_cycle(&analyzer, &scheduler).await, 0);

        scheduler.start(config("inst-a"), &OrgContext::new("org")).await.unwrap();
        assert_eq!(run_health_cycle(&analyzer, &scheduler).await, 1);
        assert!(store.latest_snapshot("inst-a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_analysis_is_skipped() {
        let (store, scheduler, analyzer) = setup(None);
        scheduler.start(config("inst-a"), &OrgContext::new("org")).await.unwrap();

        assert_eq!(run_health_cycle(&analyzer, &scheduler).await, 0);
        assert!(store.latest_snapshot("inst-a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_on_shutdown() {
        let (_, scheduler, analyzer) = setup(Some(RawSignals::nominal()));
        let shutdown = CancellationToken::new();
        let handle = spawn_health_monitor(analyzer, scheduler, Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_records_a_snapshot_each_interval() {
        let (store, scheduler, analyzer) = setup(Some(RawSignals::nominal()));
        scheduler.start(config("inst-a"), &OrgContext::new("org")).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_health_monitor(analyzer, scheduler.clone(), Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.list_snapshots("inst-a", 10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(store.list_snapshots("inst-a", 10).await.unwrap().len(), 2);

        shutdown.cancel();
        handle.await.unwrap();
        scheduler.stop_all().await;
    }
}
