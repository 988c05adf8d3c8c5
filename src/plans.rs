//! Plan tiers and the limits resolver.
//!
//! Numeric limits use `-1` for "unlimited", matching how limits are stored
//! by the billing side.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::warmup::content::MessageType;

/// Subscription tier of an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    /// Limits granted by this tier.
    pub fn limits(&self) -> PlanLimits {
        use MessageType::*;

        match self {
            Self::Free => PlanLimits {
                tier: *self,
                messages_per_day: 50,
                instances_limit: 1,
                external_numbers_limit: 5,
                allowed_types: vec![Text, Sticker],
            },
            Self::Starter => PlanLimits {
                tier: *self,
                messages_per_day: 200,
                instances_limit: 3,
                external_numbers_limit: 20,
                allowed_types: vec![Text, Audio, Sticker, Image],
            },
            Self::Pro => PlanLimits {
                tier: *self,
                messages_per_day: 1000,
                instances_limit: 10,
                external_numbers_limit: 100,
                allowed_types: MessageType::SELECTION_ORDER.to_vec(),
            },
            Self::Enterprise => PlanLimits {
                tier: *self,
                messages_per_day: -1,
                instances_limit: -1,
                external_numbers_limit: -1,
                allowed_types: MessageType::SELECTION_ORDER.to_vec(),
            },
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan tier: {other}")),
        }
    }
}

/// Limits that gate a warmup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub tier: PlanTier,
    pub messages_per_day: i64,
    pub instances_limit: i64,
    pub external_numbers_limit: i64,
    pub allowed_types: Vec<MessageType>,
}

impl PlanLimits {
    pub fn allows(&self, kind: MessageType) -> bool {
        self.allowed_types.contains(&kind)
    }

    /// Daily cap as an option (`None` = unlimited).
    pub fn daily_cap(&self) -> Option<u64> {
        limit_to_option(self.messages_per_day)
    }
}

/// Convert a `-1 = unlimited` limit into an option.
pub fn limit_to_option(limit: i64) -> Option<u64> {
    if limit < 0 { None } else { Some(limit as u64) }
}

/// Maps a caller to its plan limits.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn resolve(&self, org_id: &str) -> Result<PlanLimits, ConfigError>;
}

/// Resolver backed by a fixed org → tier table.
pub struct StaticPlanResolver {
    default_tier: PlanTier,
    overrides: HashMap<String, PlanTier>,
}

impl StaticPlanResolver {
    pub fn new(default_tier: PlanTier) -> Self {
        Self {
            default_tier,
            overrides: HashMap::new(),
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>, tier: PlanTier) -> Self {
        self.overrides.insert(org_id.into(), tier);
        self
    }

    pub fn from_pairs(default_tier: PlanTier, pairs: impl IntoIterator<Item = (String, PlanTier)>) -> Self {
        Self {
            default_tier,
            overrides: pairs.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn resolve(&self, org_id: &str) -> Result<PlanLimits, ConfigError> {
        if org_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "org_id".into(),
                hint: "Plans are resolved per organization.".into(),
            });
        }
        let tier = self
            .overrides
            .get(org_id)
            .copied()
            .unwrap_or(self.default_tier);
        Ok(tier.limits())
    }
}
