//! Instance scheduler: one behaviour loop and one progress tick per instance.
//!
//! `start()` runs every pre-flight check synchronously, persists the ACTIVE
//! status and spawns two tasks sharing a cancellation token:
//! - the 1-second progress tick, which also completes the run once the
//!   target duration is reached
//! - the behaviour loop, which sends messages until it is cancelled, the
//!   persisted status leaves ACTIVE, or the daily limit is hit
//!
//! The registry entry lives until the loop task itself exits, so a stopped
//! loop that is still finishing its in-flight delay blocks a restart.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::behavior::{BehaviorModel, Target};
use super::content::MessageType;
use super::dispatcher::{MessageDispatcher, SentMessage};
use super::rate_limit::{LimitCheck, RateLimiter, effective_daily_limit};
use super::sampler::WeightedSampler;
use super::state::{WarmupInstanceState, WarmupStatus};
use crate::config::{OrgContext, WarmupConfig};
use crate::error::{ConfigError, WarmupError};
use crate::health::model::RiskLevel;
use crate::plans::PlanResolver;
use crate::sendapi::{Presence, SendApi};
use crate::store::WarmupStore;

pub const STOP_REASON: &str = "stopped by operator";
pub const DAILY_LIMIT_REASON: &str = "daily limit reached";
pub const COMPLETED_REASON: &str = "target duration reached";
pub const SHUTDOWN_REASON: &str = "service shutdown";
pub const RESTART_REASON: &str = "service restarted";
pub const PANIC_REASON: &str = "warmup loop crashed";

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long `stop_all` waits for loops sitting in a delay.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Pause before retrying an iteration that had nothing to send.
const EMPTY_ITERATION_DELAY: Duration = Duration::from_secs(5);

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on a single send API call.
    pub send_timeout: Duration,
    /// Base seed for reproducible loops; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            rng_seed: None,
        }
    }
}

/// A registered loop, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInstance {
    pub instance_id: String,
    pub org_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Stop requested, loop still draining.
    pub stopping: bool,
}

struct RunningLoop {
    run_id: Uuid,
    org_id: String,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    loop_handle: JoinHandle<()>,
    tick_handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, RunningLoop>>>;

/// Owns every warmup loop in the process.
pub struct InstanceScheduler {
    store: Arc<dyn WarmupStore>,
    plans: Arc<dyn PlanResolver>,
    dispatcher: Arc<MessageDispatcher>,
    limiter: Arc<RateLimiter>,
    registry: Registry,
    options: SchedulerOptions,
    runs_started: AtomicU64,
}

impl InstanceScheduler {
    pub fn new(
        store: Arc<dyn WarmupStore>,
        api: Arc<dyn SendApi>,
        plans: Arc<dyn PlanResolver>,
        options: SchedulerOptions,
    ) -> Self {
        let dispatcher = Arc::new(MessageDispatcher::new(
            api,
            store.clone(),
            options.send_timeout,
        ));
        Self {
            limiter: Arc::new(RateLimiter::new(store.clone())),
            store,
            plans,
            dispatcher,
            registry: Arc::new(Mutex::new(HashMap::new())),
            options,
            runs_started: AtomicU64::new(0),
        }
    }

    /// Dispatcher shared by the loops, also used for webhook ingestion.
    pub fn dispatcher(&self) -> Arc<MessageDispatcher> {
        self.dispatcher.clone()
    }

    /// Start (or resume) the warmup for `config.instance_id`.
    ///
    /// Returns once the run is persisted as ACTIVE and its tasks are
    /// spawned; it never waits for the run itself.
    pub async fn start(
        &self,
        config: WarmupConfig,
        org: &OrgContext,
    ) -> Result<WarmupInstanceState, WarmupError> {
        config.validate()?;
        let plan = self.plans.resolve(&org.org_id).await?;
        let instance_id = config.instance_id.clone();

        // Held until the new loop is registered.
        let mut registry = self.registry.lock().await;

        if let Some(existing) = registry.get(&instance_id) {
            return Err(if existing.token.is_cancelled() {
                WarmupError::Stopping { instance_id }
            } else {
                WarmupError::AlreadyRunning { instance_id }
            });
        }

        let running_for_org = registry
            .values()
            .filter(|r| r.org_id == org.org_id)
            .count();
        RateLimiter::check_start(&plan, running_for_org)?;

        let pool: Vec<String> = self
            .store
            .list_external_numbers(&org.org_id, true)
            .await?
            .into_iter()
            .map(|n| n.phone_number)
            .collect();
        let pool_size = pool.len();
        let external = RateLimiter::cap_external_numbers(pool, &plan);
        if external.len() < pool_size {
            warn!(
                instance_id = %instance_id,
                org_id = %org.org_id,
                pool_size,
                allowed = external.len(),
                "External number pool truncated to plan limit"
            );
        }

        let has_peers = config.peers.iter().any(|p| p.instance_id != instance_id);
        if !has_peers && config.groups.is_empty() && external.is_empty() {
            return Err(ConfigError::NoDestinations { instance_id }.into());
        }

        let weights = RateLimiter::allowed_weights(&config.weights, &plan);
        let sendable: Vec<MessageType> = MessageType::SELECTION_ORDER
            .into_iter()
            .filter(|k| weights.get(*k) > 0.0)
            .collect();
        if !config.content.has_content_for(&sendable) {
            return Err(ConfigError::NoContent { instance_id }.into());
        }

        if let Some(state) = self.store.get_instance_state(&instance_id).await? {
            if state.status == WarmupStatus::Completed {
                return Err(WarmupError::InvalidTransition {
                    instance_id,
                    from: state.status.to_string(),
                    to: WarmupStatus::Active.to_string(),
                });
            }
        }

        if let Some(snapshot) = self.store.latest_snapshot(&instance_id).await? {
            if snapshot.risk_level == RiskLevel::Critical {
                return Err(WarmupError::CriticalRisk { instance_id });
            }
        }

        let now = Utc::now();
        let state = self
            .store
            .activate_instance(&instance_id, &org.org_id, config.target_duration_secs, now)
            .await?;
        if state.status != WarmupStatus::Active {
            return Err(WarmupError::InvalidTransition {
                instance_id,
                from: state.status.to_string(),
                to: WarmupStatus::Active.to_string(),
            });
        }

        let run_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let daily_limit = effective_daily_limit(&plan, &config);
        let behavior = BehaviorModel::new(self.next_sampler(), config.human_behavior);

        let run = Arc::new(WarmupRun {
            run_id,
            instance_id: instance_id.clone(),
            org_id: org.org_id.clone(),
            config: WarmupConfig { weights, ..config },
            external,
            daily_limit,
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            limiter: self.limiter.clone(),
            registry: self.registry.clone(),
            token: token.clone(),
        });

        let tick_handle = tokio::spawn(run.clone().tick());
        let loop_handle = tokio::spawn(run.run(behavior));

        registry.insert(
            instance_id.clone(),
            RunningLoop {
                run_id,
                org_id: org.org_id.clone(),
                started_at: now,
                token,
                loop_handle,
                tick_handle,
            },
        );
        drop(registry);

        info!(
            instance_id = %instance_id,
            org_id = %org.org_id,
            run_id = %run_id,
            plan = %plan.tier,
            elapsed_seconds = state.elapsed_seconds,
            daily_limit = ?daily_limit,
            "Warmup started"
        );

        Ok(state)
    }

    /// Stop a running warmup.
    ///
    /// The tick stops at once; the loop finishes whatever send or delay it is
    /// in and exits at its next check. Also pauses a persisted ACTIVE run that
    /// has no loop in this process.
    pub async fn stop(&self, instance_id: &str) -> Result<WarmupInstanceState, WarmupError> {
        let token = self
            .registry
            .lock()
            .await
            .get(instance_id)
            .map(|r| r.token.clone());
        if let Some(token) = &token {
            token.cancel();
        }

        let paused = self
            .store
            .compare_and_set_status(
                instance_id,
                WarmupStatus::Active,
                WarmupStatus::Paused,
                Some(STOP_REASON),
                Utc::now(),
            )
            .await?;

        if token.is_none() && !paused {
            return Err(WarmupError::NotRunning {
                instance_id: instance_id.to_string(),
            });
        }

        info!(instance_id, "Warmup stop requested");

        self.store
            .get_instance_state(instance_id)
            .await?
            .ok_or_else(|| WarmupError::NotRunning {
                instance_id: instance_id.to_string(),
            })
    }

    /// Stop every loop and wait for the tasks to drain. Loops still in a
    /// delay after the grace period are aborted.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, RunningLoop)> = self.registry.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        for (_, run) in &drained {
            run.token.cancel();
        }

        let now = Utc::now();
        let mut handles = Vec::with_capacity(drained.len() * 2);
        for (instance_id, run) in drained {
            if let Err(e) = self
                .store
                .compare_and_set_status(
                    &instance_id,
                    WarmupStatus::Active,
                    WarmupStatus::Paused,
                    Some(SHUTDOWN_REASON),
                    now,
                )
                .await
            {
                warn!(instance_id = %instance_id, error = %e, "Failed to pause warmup on shutdown");
            }
            handles.push(run.tick_handle);
            handles.push(run.loop_handle);
        }

        let count = handles.len() / 2;
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Warmup task ended abnormally");
                    }
                }
                info!(count, "All warmup loops stopped");
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                warn!(
                    count,
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "Warmup loops still draining after grace period, aborted"
                );
            }
        }
    }

    /// Pause runs left ACTIVE by a previous process. Nothing survives a
    /// restart, so an ACTIVE row without a loop here is orphaned.
    pub async fn recover_orphaned(&self) -> Result<usize, WarmupError> {
        let active = self
            .store
            .list_instances_by_status(WarmupStatus::Active)
            .await?;
        let registry = self.registry.lock().await;

        let mut recovered = 0;
        for state in active {
            if registry.contains_key(&state.instance_id) {
                continue;
            }
            let paused = self
                .store
                .compare_and_set_status(
                    &state.instance_id,
                    WarmupStatus::Active,
                    WarmupStatus::Paused,
                    Some(RESTART_REASON),
                    Utc::now(),
                )
                .await?;
            if paused {
                recovered += 1;
                info!(instance_id = %state.instance_id, "Paused orphaned warmup");
            }
        }
        Ok(recovered)
    }

    /// Persisted state of an instance.
    pub async fn status(&self, instance_id: &str) -> Result<Option<WarmupInstanceState>, WarmupError> {
        Ok(self.store.get_instance_state(instance_id).await?)
    }

    pub async fn is_running(&self, instance_id: &str) -> bool {
        self.registry.lock().await.contains_key(instance_id)
    }

    pub async fn running_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Registered loops, ordered by instance id.
    pub async fn running_instances(&self) -> Vec<RunningInstance> {
        let registry = self.registry.lock().await;
        let mut running: Vec<_> = registry
            .iter()
            .map(|(id, r)| RunningInstance {
                instance_id: id.clone(),
                org_id: r.org_id.clone(),
                run_id: r.run_id,
                started_at: r.started_at,
                stopping: r.token.is_cancelled(),
            })
            .collect();
        running.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        running
    }

    fn next_sampler(&self) -> WeightedSampler {
        let n = self.runs_started.fetch_add(1, Ordering::Relaxed);
        WeightedSampler::new(self.options.rng_seed.map(|seed| seed.wrapping_add(n)))
    }
}

/// Why a behaviour loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    StatusChanged(WarmupStatus),
    Missing,
    DailyLimit,
    TooManyFailures,
    Panicked,
}

/// Everything one run's tasks share.
struct WarmupRun {
    run_id: Uuid,
    instance_id: String,
    org_id: String,
    /// Weights already restricted to the plan's types.
    config: WarmupConfig,
    external: Vec<String>,
    daily_limit: Option<u64>,
    store: Arc<dyn WarmupStore>,
    dispatcher: Arc<MessageDispatcher>,
    limiter: Arc<RateLimiter>,
    registry: Registry,
    token: CancellationToken,
}

impl WarmupRun {
    /// Progress tick: one elapsed second per interval while ACTIVE.
    async fn tick(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.store.tick_progress(&self.instance_id, Utc::now()).await {
                Ok(Some(state)) if state.target_reached() => {
                    self.complete(&state).await;
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(instance_id = %self.instance_id, "Run no longer active, tick stopped");
                    break;
                }
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "Progress tick failed");
                }
            }
        }
    }

    async fn complete(&self, state: &WarmupInstanceState) {
        match self
            .store
            .compare_and_set_status(
                &self.instance_id,
                WarmupStatus::Active,
                WarmupStatus::Completed,
                Some(COMPLETED_REASON),
                Utc::now(),
            )
            .await
        {
            Ok(true) => info!(
                instance_id = %self.instance_id,
                elapsed_seconds = state.elapsed_seconds,
                "Warmup completed"
            ),
            Ok(false) => debug!(instance_id = %self.instance_id, "Run left ACTIVE before completion"),
            Err(e) => warn!(instance_id = %self.instance_id, error = %e, "Failed to mark warmup completed"),
        }
        self.token.cancel();
    }

    /// Behaviour loop task body. Deregisters the run however `drive` ends.
    async fn run(self: Arc<Self>, mut behavior: BehaviorModel) {
        let exit = match AssertUnwindSafe(self.drive(&mut behavior)).catch_unwind().await {
            Ok(exit) => exit,
            Err(_) => {
                error!(instance_id = %self.instance_id, run_id = %self.run_id, "Warmup loop panicked");
                self.mark_error(PANIC_REASON).await;
                LoopExit::Panicked
            }
        };
        self.token.cancel();

        {
            let mut registry = self.registry.lock().await;
            if registry
                .get(&self.instance_id)
                .is_some_and(|r| r.run_id == self.run_id)
            {
                registry.remove(&self.instance_id);
            }
        }

        info!(
            instance_id = %self.instance_id,
            run_id = %self.run_id,
            exit = ?exit,
            "Warmup loop exited"
        );
    }

    async fn drive(&self, behavior: &mut BehaviorModel) -> LoopExit {
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                return LoopExit::Cancelled;
            }

            match self.store.get_instance_state(&self.instance_id).await {
                Ok(Some(state)) if state.status == WarmupStatus::Active => {}
                Ok(Some(state)) => return LoopExit::StatusChanged(state.status),
                Ok(None) => return LoopExit::Missing,
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "Status re-read failed, continuing");
                }
            }

            if self.daily_limit_breached().await {
                return LoopExit::DailyLimit;
            }

            let targets = behavior.select_destination(&self.config, &self.external);
            let kind = behavior.select_message_type(&self.config.weights);
            let content = behavior.select_content(kind, &self.config.content);
            let Some(content) = content.filter(|_| !targets.is_empty()) else {
                debug!(
                    instance_id = %self.instance_id,
                    kind = %kind,
                    targets = targets.len(),
                    "Nothing to send this iteration"
                );
                sleep(EMPTY_ITERATION_DELAY).await;
                continue;
            };

            for target in &targets {
                if self.token.is_cancelled() {
                    return LoopExit::Cancelled;
                }
                if self.daily_limit_breached().await {
                    return LoopExit::DailyLimit;
                }

                self.simulate_typing(behavior, target, kind).await;

                match self
                    .dispatcher
                    .send(&self.instance_id, &self.org_id, target, kind, &content)
                    .await
                {
                    Ok(sent) => {
                        consecutive_failures = 0;
                        if behavior.should_react(kind, self.config.reaction_chance) {
                            self.react(behavior, target, &sent).await;
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            instance_id = %self.instance_id,
                            target = target.label(),
                            kind = %kind,
                            consecutive_failures,
                            error = %e,
                            "Send failed"
                        );
                        if consecutive_failures > self.config.max_consecutive_failures {
                            self.mark_error(&format!("{consecutive_failures} consecutive send failures"))
                                .await;
                            return LoopExit::TooManyFailures;
                        }
                        sleep(behavior.backoff_delay()).await;
                    }
                }
            }

            sleep(behavior.inter_message_delay(&self.config)).await;
        }
    }

    /// Check the daily cap; on breach, pause the run.
    ///
    /// A counter read failure is tolerated: the loop keeps going.
    async fn daily_limit_breached(&self) -> bool {
        let check = match self
            .limiter
            .check_daily_limit(&self.instance_id, &self.org_id, self.daily_limit)
            .await
        {
            Ok(check) => check,
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "Daily limit check failed");
                return false;
            }
        };
        if check.allowed {
            return false;
        }

        self.pause_for_limit(check).await;
        true
    }

    async fn pause_for_limit(&self, check: LimitCheck) {
        match self
            .store
            .compare_and_set_status(
                &self.instance_id,
                WarmupStatus::Active,
                WarmupStatus::Paused,
                Some(DAILY_LIMIT_REASON),
                Utc::now(),
            )
            .await
        {
            Ok(_) => info!(
                instance_id = %self.instance_id,
                sent_today = check.sent_today,
                limit = ?check.limit,
                "Daily limit reached, warmup paused"
            ),
            Err(e) => warn!(instance_id = %self.instance_id, error = %e, "Failed to pause at daily limit"),
        }
    }

    async fn mark_error(&self, reason: &str) {
        match self
            .store
            .compare_and_set_status(
                &self.instance_id,
                WarmupStatus::Active,
                WarmupStatus::Error,
                Some(reason),
                Utc::now(),
            )
            .await
        {
            Ok(true) => warn!(instance_id = %self.instance_id, reason, "Warmup moved to error"),
            Ok(false) => debug!(instance_id = %self.instance_id, "Run left ACTIVE before error"),
            Err(e) => warn!(instance_id = %self.instance_id, error = %e, "Failed to mark warmup errored"),
        }
    }

    /// Show typing/recording presence and wait it out.
    async fn simulate_typing(&self, behavior: &mut BehaviorModel, target: &Target, kind: MessageType) {
        let delay = behavior.typing_delay(kind);
        if delay.is_zero() {
            return;
        }
        if let Err(e) = self
            .dispatcher
            .send_presence(&self.instance_id, target, Presence::for_message(kind), delay)
            .await
        {
            debug!(instance_id = %self.instance_id, error = %e, "Presence update failed");
        }
        sleep(delay).await;
    }

    /// React to a message just sent. Failures here are not send failures.
    async fn react(&self, behavior: &mut BehaviorModel, target: &Target, sent: &SentMessage) {
        sleep(behavior.reaction_wait()).await;

        let typing = behavior.reaction_typing_delay();
        if !typing.is_zero() {
            if let Err(e) = self
                .dispatcher
                .send_presence(&self.instance_id, target, Presence::Composing, typing)
                .await
            {
                debug!(instance_id = %self.instance_id, error = %e, "Presence update failed");
            }
            sleep(typing).await;
        }

        let emoji = behavior.pick_emoji(&self.config.content);
        match self
            .dispatcher
            .send_reaction(&self.instance_id, sent, &emoji)
            .await
        {
            Ok(()) => debug!(instance_id = %self.instance_id, emoji = %emoji, "Reaction sent"),
            Err(e) => debug!(instance_id = %self.instance_id, error = %e, "Reaction failed"),
        }
    }
}
