//! Daily per-instance counters.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::content::MessageType;

/// First and last hour (UTC, exclusive end) considered normal activity.
pub const PEAK_HOURS: (u32, u32) = (8, 22);

/// Key of one daily counter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyKey {
    pub instance_id: String,
    pub org_id: String,
    pub day: NaiveDate,
}

impl DailyKey {
    pub fn new(instance_id: impl Into<String>, org_id: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            instance_id: instance_id.into(),
            org_id: org_id.into(),
            day,
        }
    }

    /// Key for the UTC day containing `now`.
    pub fn for_time(instance_id: &str, org_id: &str, now: DateTime<Utc>) -> Self {
        Self::new(instance_id, org_id, now.date_naive())
    }
}

/// Whether a send at `now` falls outside peak hours.
pub fn is_off_hours(now: DateTime<Utc>) -> bool {
    let hour = now.hour();
    hour < PEAK_HOURS.0 || hour >= PEAK_HOURS.1
}

/// Delivery/trust signals reported by the network through webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySignal {
    Delivered,
    Read,
    Failed,
    Blocked,
    SpamReport,
    PolicyViolation,
    Warning,
}

impl DeliverySignal {
    /// Column incremented for this signal.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read_count",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::SpamReport => "spam_reports",
            Self::PolicyViolation => "policy_violations",
            Self::Warning => "warnings",
        }
    }
}

/// Counters for one (instance, org, day). Only ever incremented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStatsDaily {
    pub instance_id: String,
    pub org_id: String,
    pub day: Option<NaiveDate>,
    pub sent_by_type: BTreeMap<MessageType, u64>,
    pub received_by_type: BTreeMap<MessageType, u64>,
    pub total_sent: u64,
    pub total_received: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    pub blocked: u64,
    pub spam_reports: u64,
    pub policy_violations: u64,
    pub warnings: u64,
    pub off_hours_sent: u64,
}

impl MediaStatsDaily {
    /// Zeroed counters for a key.
    pub fn empty(key: &DailyKey) -> Self {
        Self {
            instance_id: key.instance_id.clone(),
            org_id: key.org_id.clone(),
            day: Some(key.day),
            ..Default::default()
        }
    }

    pub fn sent(&self, kind: MessageType) -> u64 {
        self.sent_by_type.get(&kind).copied().unwrap_or(0)
    }

    pub fn received(&self, kind: MessageType) -> u64 {
        self.received_by_type.get(&kind).copied().unwrap_or(0)
    }

    /// Sum of the per-type sent counters.
    pub fn sent_by_type_sum(&self) -> u64 {
        self.sent_by_type.values().sum()
    }

    /// Number of distinct types sent at least once.
    pub fn distinct_sent_types(&self) -> usize {
        self.sent_by_type.values().filter(|n| **n > 0).count()
    }

    pub fn record_sent(&mut self, kind: MessageType, off_hours: bool) {
        *self.sent_by_type.entry(kind).or_insert(0) += 1;
        self.total_sent += 1;
        if off_hours {
            self.off_hours_sent += 1;
        }
    }

    pub fn record_received(&mut self, kind: MessageType) {
        *self.received_by_type.entry(kind).or_insert(0) += 1;
        self.total_received += 1;
    }

    pub fn record_signal(&mut self, signal: DeliverySignal) {
        let counter = match signal {
            DeliverySignal::Delivered => &mut self.delivered,
            DeliverySignal::Read => &mut self.read,
            DeliverySignal::Failed => &mut self.failed,
            DeliverySignal::Blocked => &mut self.blocked,
            DeliverySignal::SpamReport => &mut self.spam_reports,
            DeliverySignal::PolicyViolation => &mut self.policy_violations,
            DeliverySignal::Warning => &mut self.warnings,
        };
        *counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn off_hours_boundaries() {
        let at = |h| Utc.with_ymd_and_hms(2026, 3, 1, h, 30, 0).unwrap();
        assert!(is_off_hours(at(3)));
        assert!(!is_off_hours(at(8)));
        assert!(!is_off_hours(at(21)));
        assert!(is_off_hours(at(22)));
    }

    #[test]
    fn totals_track_per_type_counters() {
        let key = DailyKey::new("inst", "org", NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        let mut stats = MediaStatsDaily::empty(&key);
        stats.record_sent(MessageType::Text, false);
        stats.record_sent(MessageType::Text, true);
        stats.record_sent(MessageType::Audio, false);
        stats.record_received(MessageType::Image);

        assert_eq!(stats.total_sent, stats.sent_by_type_sum());
        assert_eq!(stats.sent(MessageType::Text), 2);
        assert_eq!(stats.off_hours_sent, 1);
        assert_eq!(stats.distinct_sent_types(), 2);
        assert_eq!(stats.total_received, 1);
    }

    #[test]
    fn signals_increment_their_counter() {
        let mut stats = MediaStatsDaily::default();
        stats.record_signal(DeliverySignal::SpamReport);
        stats.record_signal(DeliverySignal::SpamReport);
        stats.record_signal(DeliverySignal::Read);
        assert_eq!(stats.spam_reports, 2);
        assert_eq!(stats.read, 1);
        assert_eq!(DeliverySignal::Read.column(), "read_count");
    }
}
