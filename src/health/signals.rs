//! Raw signal collection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};

use super::model::RawSignals;
use crate::error::AnalysisError;
use crate::plans::PlanResolver;
use crate::store::WarmupStore;
use crate::warmup::content::MessageType;
use crate::warmup::stats::{DailyKey, MediaStatsDaily};

/// Source of raw signals for one instance.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn collect(&self, instance_id: &str, org_id: &str) -> Result<RawSignals, AnalysisError>;
}

/// Derives signals from the daily counters recorded by the dispatcher.
pub struct StoreSignalProvider {
    store: Arc<dyn WarmupStore>,
    plans: Arc<dyn PlanResolver>,
}

impl StoreSignalProvider {
    pub fn new(store: Arc<dyn WarmupStore>, plans: Arc<dyn PlanResolver>) -> Self {
        Self { store, plans }
    }
}

#[async_trait]
impl SignalProvider for StoreSignalProvider {
    async fn collect(&self, instance_id: &str, org_id: &str) -> Result<RawSignals, AnalysisError> {
        let collection_error = |reason: String| AnalysisError::SignalCollection {
            instance_id: instance_id.to_string(),
            reason,
        };

        let now = Utc::now();
        let key = DailyKey::for_time(instance_id, org_id, now);
        let stats = self
            .store
            .get_daily_stats(&key)
            .await
            .map_err(|e| collection_error(format!("daily stats: {e}")))?;
        let previous_key = DailyKey::for_time(instance_id, org_id, now - Duration::days(1));
        let previous = self
            .store
            .get_daily_stats(&previous_key)
            .await
            .map_err(|e| collection_error(format!("previous day stats: {e}")))?;
        let plan = self
            .plans
            .resolve(org_id)
            .await
            .map_err(|e| collection_error(format!("plan: {e}")))?;

        let mut signals = signals_from_stats(&stats, plan.daily_cap());
        signals.messages_sent_24h = sent_in_last_24h(&stats, &previous, now);
        Ok(signals)
    }
}

/// Sends in the 24 hours before `now`.
///
/// Counters are kept per UTC day, so the part of yesterday still inside
/// the window is estimated by assuming its sends were spread evenly.
pub fn sent_in_last_24h(today: &MediaStatsDaily, yesterday: &MediaStatsDaily, now: DateTime<Utc>) -> u64 {
    let elapsed = f64::from(now.num_seconds_from_midnight()) / 86_400.0;
    let carried = (yesterday.total_sent as f64 * (1.0 - elapsed)).round() as u64;
    today.total_sent.saturating_add(carried)
}

/// Turn one day of counters into raw signals. Rates are nominal when
/// nothing was sent.
pub fn signals_from_stats(stats: &MediaStatsDaily, max_daily: Option<u64>) -> RawSignals {
    let mut signals = RawSignals::nominal();
    signals.spam_reports = saturating_u32(stats.spam_reports);
    signals.policy_violations = saturating_u32(stats.policy_violations);
    signals.warning_count = saturating_u32(stats.warnings);
    signals.messages_sent_24h = stats.total_sent;
    signals.max_daily_messages = max_daily;

    if stats.total_sent == 0 {
        return signals;
    }

    let sent = stats.total_sent as f64;
    let ratio = |n: u64| (n as f64 / sent).clamp(0.0, 1.0);

    signals.response_rate = ratio(stats.total_received);
    signals.delivery_rate = ratio(stats.delivered);
    signals.block_rate = ratio(stats.blocked);
    signals.engagement_rate = ((stats.total_received + stats.read) as f64 / sent).min(1.0);
    signals.peak_hour_ratio = 1.0 - ratio(stats.off_hours_sent);
    signals.content_variability =
        stats.distinct_sent_types() as f64 / MessageType::SELECTION_ORDER.len() as f64;
    signals.human_like_score = 0.5 * signals.content_variability
        + 0.3 * signals.response_rate.min(1.0)
        + 0.2 * signals.peak_hour_ratio;

    signals
}

fn saturating_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::{PlanTier, StaticPlanResolver};
    use crate::store::MemoryStore;
    use crate::warmup::stats::DeliverySignal;

    #[test]
    fn idle_instance_is_nominal() {
        let signals = signals_from_stats(&MediaStatsDaily::default(), Some(50));
        assert_eq!(signals.response_rate, 1.0);
        assert_eq!(signals.max_daily_messages, Some(50));
        assert_eq!(signals.messages_sent_24h, 0);
    }

    #[test]
    fn rates_derive_from_counters() {
        let mut stats = MediaStatsDaily::default();
        for _ in 0..8 {
            stats.record_sent(MessageType::Text, false);
        }
        stats.record_sent(MessageType::Audio, true);
        stats.record_sent(MessageType::Image, false);
        for _ in 0..5 {
            stats.record_received(MessageType::Text);
            stats.record_signal(DeliverySignal::Delivered);
        }
        stats.record_signal(DeliverySignal::Blocked);
        stats.record_signal(DeliverySignal::Read);

        let signals = signals_from_stats(&stats, None);
        assert!((signals.response_rate - 0.5).abs() < 1e-9);
        assert!((signals.delivery_rate - 0.5).abs() < 1e-9);
        assert!((signals.block_rate - 0.1).abs() < 1e-9);
        assert!((signals.engagement_rate - 0.6).abs() < 1e-9);
        assert!((signals.peak_hour_ratio - 0.9).abs() < 1e-9);
        assert!((signals.content_variability - 0.6).abs() < 1e-9);
        let expected_human = 0.5 * 0.6 + 0.3 * 0.5 + 0.2 * 0.9;
        assert!((signals.human_like_score - expected_human).abs() < 1e-9);
    }

    #[tokio::test]
    async fn store_provider_reads_today() {
        let store = Arc::new(MemoryStore::new());
        let key = DailyKey::for_time("inst", "org", Utc::now());
        store
            .increment_sent(&key, MessageType::Text, false)
            .await
            .unwrap();
        store
            .increment_signal(&key, DeliverySignal::SpamReport)
            .await
            .unwrap();

        let provider = StoreSignalProvider::new(
            store,
            Arc::new(StaticPlanResolver::new(PlanTier::Starter)),
        );
        let signals = provider.collect("inst", "org").await.unwrap();
        assert_eq!(signals.messages_sent_24h, 1);
        assert_eq!(signals.spam_reports, 1);
        assert_eq!(signals.max_daily_messages, Some(200));
    }

    fn sent(n: u64) -> MediaStatsDaily {
        let mut stats = MediaStatsDaily::default();
        for _ in 0..n {
            stats.record_sent(MessageType::Text, false);
        }
        stats
    }

    #[test]
    fn rolling_window_carries_the_tail_of_yesterday() {
        let at = |h: u32| {
            chrono::NaiveDate::from_ymd_opt(2025, 3, 10)
                .and_then(|d| d.and_hms_opt(h, 0, 0))
                .unwrap()
                .and_utc()
        };

        // Just after midnight almost all of yesterday is still in the window.
        assert_eq!(sent_in_last_24h(&sent(0), &sent(100), at(0)), 100);
        assert_eq!(sent_in_last_24h(&sent(3), &sent(100), at(6)), 78);
        assert_eq!(sent_in_last_24h(&sent(40), &sent(100), at(18)), 65);
        assert_eq!(sent_in_last_24h(&sent(40), &sent(0), at(23)), 40);
    }

    #[tokio::test]
    async fn yesterdays_sends_count_toward_the_window() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let yesterday = DailyKey::for_time("inst", "org", now - Duration::days(1));
        for _ in 0..96 {
            store
                .increment_sent(&yesterday, MessageType::Text, false)
                .await
                .unwrap();
        }

        let provider = StoreSignalProvider::new(
            store,
            Arc::new(StaticPlanResolver::new(PlanTier::Starter)),
        );
        let before = Utc::now();
        let signals = provider.collect("inst", "org").await.unwrap();
        let after = Utc::now();

        let idle = MediaStatsDaily::default();
        let upper = sent_in_last_24h(&idle, &sent(96), before);
        let lower = sent_in_last_24h(&idle, &sent(96), after);
        assert!(
            (lower..=upper).contains(&signals.messages_sent_24h),
            "{} not in {lower}..={upper}",
            signals.messages_sent_24h
        );
        // Rates still describe today only.
        assert_eq!(signals.response_rate, 1.0);
    }
}
