//! Warmup run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an instance's warmup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStatus {
    /// Never started.
    Inactive,
    /// Loop is running.
    Active,
    /// Stopped by an operator, the daily limit or a health gate.
    Paused,
    /// Target duration reached.
    Completed,
    /// Too many consecutive failures; needs a manual restart.
    Error,
}

impl WarmupStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WarmupStatus) -> bool {
        use WarmupStatus::*;

        matches!(
            (self, target),
            (Inactive, Active)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Error)
                | (Paused, Active)
                // Manual restart
                | (Error, Active)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WarmupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WarmupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown warmup status: {other}")),
        }
    }
}

/// Persisted state of one instance's warmup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupInstanceState {
    pub instance_id: String,
    pub org_id: String,
    pub status: WarmupStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub target_duration_seconds: u64,
    pub progress_percent: f64,
    pub last_active_at: Option<DateTime<Utc>>,
    /// Why the status last changed, when known.
    pub status_reason: Option<String>,
}

impl WarmupInstanceState {
    /// Fresh, never-started state.
    pub fn new(
        instance_id: impl Into<String>,
        org_id: impl Into<String>,
        target_duration_seconds: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            org_id: org_id.into(),
            status: WarmupStatus::Inactive,
            start_time: None,
            pause_time: None,
            elapsed_seconds: 0,
            target_duration_seconds,
            progress_percent: 0.0,
            last_active_at: None,
            status_reason: None,
        }
    }

    /// Mark the run active, keeping accumulated elapsed time.
    pub fn activate(&mut self, target_duration_seconds: u64, now: DateTime<Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(WarmupStatus::Active) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status,
                WarmupStatus::Active
            ));
        }
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.status = WarmupStatus::Active;
        self.pause_time = None;
        self.status_reason = None;
        self.target_duration_seconds = target_duration_seconds;
        self.progress_percent = progress_percent(self.elapsed_seconds, target_duration_seconds);
        self.last_active_at = Some(now);
        Ok(())
    }

    /// Apply one progress tick. Only active runs advance.
    pub fn apply_tick(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != WarmupStatus::Active {
            return false;
        }
        self.elapsed_seconds += 1;
        self.progress_percent = progress_percent(self.elapsed_seconds, self.target_duration_seconds);
        self.last_active_at = Some(now);
        true
    }

    /// Transition with a reason, stamping the pause time where relevant.
    pub fn transition_to(
        &mut self,
        new_status: WarmupStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }
        self.status = new_status;
        self.status_reason = reason;
        if new_status == WarmupStatus::Paused {
            self.pause_time = Some(now);
        }
        Ok(())
    }

    pub fn target_reached(&self) -> bool {
        self.elapsed_seconds >= self.target_duration_seconds
    }
}

/// `min(elapsed / target * 100, 100)`.
pub fn progress_percent(elapsed: u64, target: u64) -> f64 {
    if target == 0 {
        return 100.0;
    }
    (elapsed as f64 / target as f64 * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(WarmupStatus::Inactive.can_transition_to(WarmupStatus::Active));
        assert!(WarmupStatus::Active.can_transition_to(WarmupStatus::Paused));
        assert!(WarmupStatus::Paused.can_transition_to(WarmupStatus::Active));
        assert!(WarmupStatus::Active.can_transition_to(WarmupStatus::Completed));
        assert!(WarmupStatus::Active.can_transition_to(WarmupStatus::Error));
        assert!(WarmupStatus::Error.can_transition_to(WarmupStatus::Active));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!WarmupStatus::Completed.can_transition_to(WarmupStatus::Active));
        assert!(!WarmupStatus::Inactive.can_transition_to(WarmupStatus::Paused));
        assert!(!WarmupStatus::Paused.can_transition_to(WarmupStatus::Completed));
        assert!(!WarmupStatus::Active.can_transition_to(WarmupStatus::Active));
    }

    #[test]
    fn progress_reaches_and_stays_at_100() {
        let now = Utc::now();
        let mut state = WarmupInstanceState::new("inst", "org", 10);
        state.activate(10, now).unwrap();

        for _ in 0..10 {
            assert!(state.apply_tick(now));
        }
        assert_eq!(state.progress_percent, 100.0);
        assert!(state.target_reached());

        for _ in 0..5 {
            state.apply_tick(now);
        }
        assert_eq!(state.progress_percent, 100.0);
        assert_eq!(state.elapsed_seconds, 15);
    }

    #[test]
    fn tick_ignored_when_not_active() {
        let now = Utc::now();
        let mut state = WarmupInstanceState::new("inst", "org", 10);
        assert!(!state.apply_tick(now));
        assert_eq!(state.elapsed_seconds, 0);
    }

    #[test]
    fn resume_keeps_elapsed() {
        let now = Utc::now();
        let mut state = WarmupInstanceState::new("inst", "org", 100);
        state.activate(100, now).unwrap();
        for _ in 0..25 {
            state.apply_tick(now);
        }
        state
            .transition_to(WarmupStatus::Paused, Some("stopped".into()), now)
            .unwrap();
        assert!(state.pause_time.is_some());

        state.activate(100, now).unwrap();
        assert_eq!(state.elapsed_seconds, 25);
        assert_eq!(state.progress_percent, 25.0);
        assert!(state.pause_time.is_none());
    }

    #[test]
    fn completed_cannot_restart() {
        let now = Utc::now();
        let mut state = WarmupInstanceState::new("inst", "org", 1);
        state.activate(1, now).unwrap();
        state.apply_tick(now);
        state
            .transition_to(WarmupStatus::Completed, None, now)
            .unwrap();
        assert!(state.activate(1, now).is_err());
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&WarmupStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        let parsed: WarmupStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, WarmupStatus::Paused);
        assert_eq!("error".parse::<WarmupStatus>().unwrap(), WarmupStatus::Error);
    }
}
