//! Plan-based rate limiting.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::{MessageWeights, WarmupConfig};
use crate::error::{ConfigError, DatabaseError};
use crate::plans::{PlanLimits, limit_to_option};
use crate::store::WarmupStore;
use crate::warmup::content::MessageType;
use crate::warmup::stats::DailyKey;

/// Outcome of a daily limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub sent_today: u64,
    /// `None` = unlimited.
    pub limit: Option<u64>,
    pub allowed: bool,
}

/// The smaller of the plan's and the run's daily cap.
pub fn effective_daily_limit(plan: &PlanLimits, config: &WarmupConfig) -> Option<u64> {
    match (plan.daily_cap(), limit_to_option(config.daily_message_limit)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Enforces plan limits against the daily counters.
pub struct RateLimiter {
    store: Arc<dyn WarmupStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WarmupStore>) -> Self {
        Self { store }
    }

    /// Compare today's sends with `limit`.
    pub async fn check_daily_limit(
        &self,
        instance_id: &str,
        org_id: &str,
        limit: Option<u64>,
    ) -> Result<LimitCheck, DatabaseError> {
        let key = DailyKey::for_time(instance_id, org_id, Utc::now());
        let stats = self.store.get_daily_stats(&key).await?;
        let sent_today = stats.total_sent;
        Ok(LimitCheck {
            sent_today,
            limit,
            allowed: limit.is_none_or(|cap| sent_today < cap),
        })
    }

    /// Reject a start that would exceed the org's concurrent instance cap.
    pub fn check_start(plan: &PlanLimits, running_for_org: usize) -> Result<(), ConfigError> {
        match limit_to_option(plan.instances_limit) {
            Some(limit) if running_for_org as u64 >= limit => Err(ConfigError::PlanLimitExceeded {
                resource: "instances".into(),
                used: running_for_org as i64,
                limit: plan.instances_limit,
            }),
            _ => Ok(()),
        }
    }

    /// Truncate the external pool to the plan's allowance.
    pub fn cap_external_numbers(mut pool: Vec<String>, plan: &PlanLimits) -> Vec<String> {
        if let Some(limit) = limit_to_option(plan.external_numbers_limit) {
            pool.truncate(limit as usize);
        }
        pool
    }

    /// Zero the weights of types the plan does not allow.
    pub fn allowed_weights(weights: &MessageWeights, plan: &PlanLimits) -> MessageWeights {
        let mut allowed = *weights;
        for kind in MessageType::SELECTION_ORDER {
            if !plan.allows(kind) {
                allowed.set(kind, 0.0);
            }
        }
        allowed
    }
}
