//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::plans::PlanTier;
use crate::warmup::content::{ContentLibrary, MessageType};

/// Upper bound for the inter-message delay bounds.
pub const MAX_DELAY_SECS: u64 = 86_400;

/// Per-type send weights. Consumed as cumulative thresholds; they need not
/// sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageWeights {
    pub text: f64,
    pub audio: f64,
    pub sticker: f64,
    pub image: f64,
    pub video: f64,
}

impl MessageWeights {
    pub fn get(&self, kind: MessageType) -> f64 {
        match kind {
            MessageType::Text => self.text,
            MessageType::Audio => self.audio,
            MessageType::Sticker => self.sticker,
            MessageType::Image => self.image,
            MessageType::Video => self.video,
        }
    }

    pub fn set(&mut self, kind: MessageType, weight: f64) {
        match kind {
            MessageType::Text => self.text = weight,
            MessageType::Audio => self.audio = weight,
            MessageType::Sticker => self.sticker = weight,
            MessageType::Image => self.image = weight,
            MessageType::Video => self.video = weight,
        }
    }

    pub fn total(&self) -> f64 {
        MessageType::SELECTION_ORDER
            .iter()
            .map(|k| self.get(*k))
            .sum()
    }
}

impl Default for MessageWeights {
    fn default() -> Self {
        Self {
            text: 0.55,
            audio: 0.15,
            sticker: 0.10,
            image: 0.15,
            video: 0.05,
        }
    }
}

/// Another warmed instance used as a conversation partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInstance {
    pub instance_id: String,
    pub phone_number: String,
}

/// Immutable parameters of one warmup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub instance_id: String,
    pub weights: MessageWeights,
    /// Inter-message delay bounds, in seconds.
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    pub group_chance: f64,
    pub external_numbers_chance: f64,
    pub reaction_chance: f64,
    /// Daily send cap for this run (-1 = defer to the plan).
    pub daily_message_limit: i64,
    pub target_duration_secs: u64,
    pub human_behavior: bool,
    /// Consecutive send failures tolerated before the run moves to ERROR.
    pub max_consecutive_failures: u32,
    pub peers: Vec<PeerInstance>,
    pub groups: Vec<String>,
    pub content: ContentLibrary,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            weights: MessageWeights::default(),
            min_delay_secs: 60,
            max_delay_secs: 300,
            group_chance: 0.2,
            external_numbers_chance: 0.3,
            reaction_chance: 0.3,
            daily_message_limit: -1,
            target_duration_secs: 21 * 24 * 3600,
            human_behavior: true,
            max_consecutive_failures: 10,
            peers: Vec::new(),
            groups: Vec::new(),
            content: ContentLibrary::default(),
        }
    }
}

impl WarmupConfig {
    /// Validate values that would make the run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "instance_id".into(),
                hint: "Every warmup run belongs to one instance.".into(),
            });
        }
        if self.min_delay_secs > self.max_delay_secs {
            return Err(ConfigError::InvalidValue {
                key: "min_delay_secs".into(),
                message: format!(
                    "min delay {}s exceeds max delay {}s",
                    self.min_delay_secs, self.max_delay_secs
                ),
            });
        }
        if self.max_delay_secs > MAX_DELAY_SECS {
            return Err(ConfigError::InvalidValue {
                key: "max_delay_secs".into(),
                message: format!(
                    "max delay {}s exceeds the {MAX_DELAY_SECS}s ceiling",
                    self.max_delay_secs
                ),
            });
        }
        if self.target_duration_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "target_duration_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        for (key, value) in [
            ("group_chance", self.group_chance),
            ("external_numbers_chance", self.external_numbers_chance),
            ("reaction_chance", self.reaction_chance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("probability {value} is outside [0, 1]"),
                });
            }
        }
        for kind in MessageType::SELECTION_ORDER {
            let weight = self.weights.get(kind);
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("weights.{kind}"),
                    message: format!("weight {weight} must be a non-negative number"),
                });
            }
        }
        if self.daily_message_limit < -1 {
            return Err(ConfigError::InvalidValue {
                key: "daily_message_limit".into(),
                message: "use -1 for unlimited".into(),
            });
        }
        Ok(())
    }
}

/// Caller context for a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgContext {
    pub org_id: String,
}

impl OrgContext {
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
        }
    }
}

/// Process-level configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub evolution_url: String,
    pub evolution_api_key: SecretString,
    pub send_timeout: Duration,
    pub default_plan: PlanTier,
    /// Per-organization plan overrides, e.g. `acme=pro,globex=free`.
    pub org_plans: Vec<(String, PlanTier)>,
    pub health_interval: Duration,
    pub log_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let evolution_url = std::env::var("EVOLUTION_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("EVOLUTION_API_URL".into()))?;
        let evolution_api_key = std::env::var("EVOLUTION_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("EVOLUTION_API_KEY".into()))?;

        let db_path = std::env::var("WARMUP_DB_PATH")
            .unwrap_or_else(|_| "./data/warmup.db".to_string())
            .into();

        let http_port: u16 = std::env::var("WARMUP_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8090);

        let send_timeout_secs: u64 = std::env::var("WARMUP_SEND_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let health_interval_secs: u64 = std::env::var("WARMUP_HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(900);

        let default_plan = match std::env::var("WARMUP_DEFAULT_PLAN") {
            Ok(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "WARMUP_DEFAULT_PLAN".into(),
                message,
            })?,
            Err(_) => PlanTier::Free,
        };

        let org_plans = match std::env::var("WARMUP_ORG_PLANS") {
            Ok(raw) => parse_org_plans(&raw)?,
            Err(_) => Vec::new(),
        };

        let log_dir = std::env::var("WARMUP_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            db_path,
            http_port,
            evolution_url,
            evolution_api_key: SecretString::from(evolution_api_key),
            send_timeout: Duration::from_secs(send_timeout_secs),
            default_plan,
            org_plans,
            health_interval: Duration::from_secs(health_interval_secs),
            log_dir,
        })
    }
}

/// Parse `org=tier` pairs separated by commas.
pub fn parse_org_plans(raw: &str) -> Result<Vec<(String, PlanTier)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (org, tier) = pair.split_once('=').ok_or_else(|| {
                ConfigError::ParseError(format!("expected org=tier, got '{pair}'"))
            })?;
            let tier: PlanTier = tier.trim().parse().map_err(|message| {
                ConfigError::InvalidValue {
                    key: "WARMUP_ORG_PLANS".into(),
                    message,
                }
            })?;
            Ok((org.trim().to_string(), tier))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> WarmupConfig {
        WarmupConfig {
            instance_id: "inst-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_validates_once_named() {
        assert!(WarmupConfig::default().validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_delay_bounds() {
        let config = WarmupConfig {
            min_delay_secs: 30,
            max_delay_secs: 10,
            ..valid_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_delay_secs"));
    }

    #[test]
    fn rejects_delays_past_one_day() {
        let config = WarmupConfig {
            min_delay_secs: 0,
            max_delay_secs: u64::MAX / 100,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "max_delay_secs"
        ));

        let one_day = WarmupConfig {
            min_delay_secs: MAX_DELAY_SECS,
            max_delay_secs: MAX_DELAY_SECS,
            ..valid_config()
        };
        assert!(one_day.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let config = WarmupConfig {
            reaction_chance: 1.5,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "reaction_chance"
        ));
    }

    #[test]
    fn rejects_negative_weight() {
        let mut config = valid_config();
        config.weights.audio = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn weights_total() {
        let weights = MessageWeights {
            text: 0.5,
            audio: 0.1,
            sticker: 0.0,
            image: 0.1,
            video: 0.0,
        };
        assert!((weights.total() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: WarmupConfig = serde_json::from_str(
            r#"{"instance_id": "inst-9", "groups": ["120363@g.us"], "content": {"texts": ["hi"]}}"#,
        )
        .unwrap();
        assert_eq!(config.instance_id, "inst-9");
        assert_eq!(config.max_delay_secs, 300);
        assert!(config.human_behavior);
        assert_eq!(config.content.texts, vec!["hi".to_string()]);
    }

    #[test]
    fn org_plans_parse() {
        let plans = parse_org_plans("acme=pro, globex = free,").unwrap();
        assert_eq!(
            plans,
            vec![
                ("acme".to_string(), PlanTier::Pro),
                ("globex".to_string(), PlanTier::Free)
            ]
        );
        assert!(parse_org_plans("acme").is_err());
        assert!(parse_org_plans("acme=platinum").is_err());
    }
}
