//! Risk classification and operator-facing risk factors.

use super::benchmark::RiskRule;
use super::model::{RawSignals, RiskLevel};

/// First rule that fires decides the level; LOW when none does.
pub fn classify(signals: &RawSignals, rules: &[RiskRule]) -> RiskLevel {
    rules
        .iter()
        .find(|rule| rule.matches(signals))
        .map(|rule| rule.level)
        .unwrap_or(RiskLevel::Low)
}

/// One entry per breached soft threshold. Explanatory only.
pub fn risk_factors(signals: &RawSignals) -> Vec<String> {
    let mut factors = Vec::new();

    if signals.response_rate < 0.5 {
        factors.push(format!(
            "Low response rate: {:.1}%",
            signals.response_rate * 100.0
        ));
    }
    if signals.delivery_rate < 0.95 {
        factors.push(format!(
            "Low delivery rate: {:.1}%",
            signals.delivery_rate * 100.0
        ));
    }
    if signals.block_rate >= 0.02 {
        factors.push(format!("High block rate: {:.1}%", signals.block_rate * 100.0));
    }
    if signals.spam_reports > 0 {
        factors.push(format!("Spam reports received: {}", signals.spam_reports));
    }
    if signals.policy_violations > 0 {
        factors.push(format!("Policy violations: {}", signals.policy_violations));
    }
    if signals.warning_count > 0 {
        factors.push(format!("Account warnings: {}", signals.warning_count));
    }
    if signals.human_like_score < 0.7 {
        factors.push(format!(
            "Low human-like behavior score: {:.2}",
            signals.human_like_score
        ));
    }
    if let Some(max) = signals.max_daily_messages {
        if signals.messages_sent_24h > max {
            factors.push(format!(
                "Daily volume above plan cap: {} of {}",
                signals.messages_sent_24h, max
            ));
        }
    }
    if signals.engagement_rate < 0.1 {
        factors.push(format!(
            "Low engagement: {:.1}%",
            signals.engagement_rate * 100.0
        ));
    }
    if signals.peak_hour_ratio < 0.75 {
        factors.push(format!(
            "Off-hours activity: {:.1}% of sends",
            (1.0 - signals.peak_hour_ratio) * 100.0
        ));
    }
    if signals.content_variability < 0.4 {
        factors.push(format!(
            "Low content variety: {:.1}%",
            signals.content_variability * 100.0
        ));
    }

    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::benchmark::BenchmarkConfig;

    fn level(signals: &RawSignals) -> RiskLevel {
        classify(signals, &BenchmarkConfig::default().risk_rules)
    }

    #[test]
    fn healthy_instance_is_low_risk() {
        let signals = RawSignals {
            response_rate: 0.8,
            delivery_rate: 0.97,
            block_rate: 0.01,
            spam_reports: 0,
            policy_violations: 0,
            warning_count: 0,
            human_like_score: 0.9,
            messages_sent_24h: 500,
            max_daily_messages: Some(1000),
            engagement_rate: 0.5,
            peak_hour_ratio: 1.0,
            content_variability: 0.8,
        };
        assert_eq!(level(&signals), RiskLevel::Low);
        assert!(risk_factors(&signals).is_empty());
    }

    #[test]
    fn heavy_spam_alone_is_critical() {
        let mut signals = RawSignals::nominal();
        signals.spam_reports = 6;
        assert_eq!(level(&signals), RiskLevel::Critical);
    }

    #[test]
    fn each_critical_condition_fires_alone() {
        let cases: [fn(&mut RawSignals); 5] = [
            |s| s.spam_reports = 5,
            |s| s.block_rate = 0.10,
            |s| s.delivery_rate = 0.79,
            |s| s.policy_violations = 4,
            |s| s.warning_count = 3,
        ];
        for mutate in cases {
            let mut signals = RawSignals::nominal();
            mutate(&mut signals);
            assert_eq!(level(&signals), RiskLevel::Critical, "{signals:?}");
        }
    }

    #[test]
    fn high_requires_two_conditions() {
        let mut signals = RawSignals::nominal();
        signals.delivery_rate = 0.85;
        // A single breach reaches neither HIGH nor MEDIUM.
        assert_eq!(level(&signals), RiskLevel::Low);

        signals.response_rate = 0.25;
        assert_eq!(level(&signals), RiskLevel::High);
    }

    #[test]
    fn volume_over_cap_counts_toward_high() {
        let mut signals = RawSignals::nominal();
        signals.max_daily_messages = Some(100);
        signals.messages_sent_24h = 160;
        signals.policy_violations = 1;
        assert_eq!(level(&signals), RiskLevel::High);
    }

    #[test]
    fn medium_requires_two_conditions() {
        let mut signals = RawSignals::nominal();
        signals.spam_reports = 1;
        assert_eq!(level(&signals), RiskLevel::Low);
        signals.human_like_score = 0.6;
        assert_eq!(level(&signals), RiskLevel::Medium);
    }

    #[test]
    fn factors_interpolate_values() {
        let mut signals = RawSignals::nominal();
        signals.response_rate = 0.25;
        signals.spam_reports = 2;
        let factors = risk_factors(&signals);
        assert!(factors.contains(&"Low response rate: 25.0%".to_string()));
        assert!(factors.contains(&"Spam reports received: 2".to_string()));
    }
}
