//! Human-mimicking behaviour: who to talk to, what to send, how long to wait.

use std::time::Duration;

use serde::Serialize;

use super::content::{Content, ContentLibrary, MessageType};
use super::sampler::WeightedSampler;
use crate::config::{MessageWeights, WarmupConfig};

/// Reactions used when the library carries no emojis.
pub const DEFAULT_EMOJIS: &[&str] = &["👍", "❤️", "😂", "😮", "🙏", "👏", "🔥", "😊"];

/// Backoff after a failed send, in seconds.
pub const BACKOFF_SECS: (u64, u64) = (2, 5);

/// Pause between a text send and the reaction to it, in seconds.
pub const REACTION_WAIT_SECS: (u64, u64) = (2, 4);

const REACTION_TYPING_SECS: (u64, u64) = (1, 3);

/// Most external numbers addressed in one iteration.
const MAX_EXTERNAL_TARGETS: usize = 3;

/// "Typing" or "recording" time before a message of this kind, in seconds.
pub fn typing_range(kind: MessageType) -> (u64, u64) {
    match kind {
        MessageType::Text => (2, 6),
        MessageType::Image => (3, 8),
        MessageType::Video => (4, 10),
        MessageType::Audio => (5, 15),
        MessageType::Sticker => (1, 3),
    }
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Group { group_id: String },
    External { phone_number: String },
    Peer { instance_id: String, phone_number: String },
}

impl Target {
    /// Raw address handed to the dispatcher for normalisation.
    pub fn address(&self) -> &str {
        match self {
            Self::Group { group_id } => group_id,
            Self::External { phone_number } | Self::Peer { phone_number, .. } => phone_number,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Group { .. } => "group",
            Self::External { .. } => "external",
            Self::Peer { .. } => "peer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Groups,
    External,
    Peers,
}

const POOL_ORDER: [Pool; 3] = [Pool::Groups, Pool::External, Pool::Peers];

/// Decision-making for one warmup loop.
pub struct BehaviorModel {
    sampler: WeightedSampler,
    human_behavior: bool,
}

impl BehaviorModel {
    pub fn new(sampler: WeightedSampler, human_behavior: bool) -> Self {
        Self {
            sampler,
            human_behavior,
        }
    }

    /// Choose this iteration's targets.
    ///
    /// Group with `group_chance`, else 1–3 external numbers with
    /// `external_numbers_chance`, else one peer. An empty pool falls through
    /// to the next one (groups, external, peers, wrapping around). Returns no
    /// targets only when every pool is empty.
    pub fn select_destination(&mut self, config: &WarmupConfig, external: &[String]) -> Vec<Target> {
        let peers: Vec<_> = config
            .peers
            .iter()
            .filter(|p| p.instance_id != config.instance_id)
            .collect();

        let preferred = if self.sampler.chance(config.group_chance) {
            Pool::Groups
        } else if self.sampler.chance(config.external_numbers_chance) {
            Pool::External
        } else {
            Pool::Peers
        };

        let start = POOL_ORDER.iter().position(|p| *p == preferred).unwrap_or(0);
        for offset in 0..POOL_ORDER.len() {
            match POOL_ORDER[(start + offset) % POOL_ORDER.len()] {
                Pool::Groups => {
                    if let Some(group) = self.sampler.pick(&config.groups) {
                        return vec![Target::Group {
                            group_id: group.clone(),
                        }];
                    }
                }
                Pool::External => {
                    if !external.is_empty() {
                        let count = self
                            .sampler
                            .range_u64(1, MAX_EXTERNAL_TARGETS as u64) as usize;
                        return self
                            .sampler
                            .pick_many(external, count)
                            .into_iter()
                            .map(|n| Target::External {
                                phone_number: n.clone(),
                            })
                            .collect();
                    }
                }
                Pool::Peers => {
                    if let Some(peer) = self.sampler.pick(&peers) {
                        return vec![Target::Peer {
                            instance_id: peer.instance_id.clone(),
                            phone_number: peer.phone_number.clone(),
                        }];
                    }
                }
            }
        }

        Vec::new()
    }

    pub fn select_message_type(&mut self, weights: &MessageWeights) -> MessageType {
        self.sampler.message_type(weights)
    }

    /// Uniform pick from the pool for `kind`.
    pub fn select_content(&mut self, kind: MessageType, library: &ContentLibrary) -> Option<Content> {
        let index = self.sampler.index(library.pool_len(kind))?;
        library.get(kind, index)
    }

    /// Presence time before sending a message of `kind`.
    pub fn typing_delay(&mut self, kind: MessageType) -> Duration {
        if !self.human_behavior {
            return Duration::ZERO;
        }
        let (min, max) = typing_range(kind);
        self.sampler.duration_secs(min, max)
    }

    /// Presence time before a reaction.
    pub fn reaction_typing_delay(&mut self) -> Duration {
        if !self.human_behavior {
            return Duration::ZERO;
        }
        self.sampler
            .duration_secs(REACTION_TYPING_SECS.0, REACTION_TYPING_SECS.1)
    }

    /// Whether to react to a message just sent.
    pub fn should_react(&mut self, kind: MessageType, reaction_chance: f64) -> bool {
        self.human_behavior && kind == MessageType::Text && self.sampler.chance(reaction_chance)
    }

    pub fn reaction_wait(&mut self) -> Duration {
        self.sampler
            .duration_secs(REACTION_WAIT_SECS.0, REACTION_WAIT_SECS.1)
    }

    pub fn pick_emoji(&mut self, library: &ContentLibrary) -> String {
        match self.sampler.pick(&library.emojis) {
            Some(emoji) => emoji.clone(),
            None => self
                .sampler
                .pick(DEFAULT_EMOJIS)
                .copied()
                .unwrap_or("👍")
                .to_string(),
        }
    }

    /// Pause between iterations, drawn from the configured bounds.
    pub fn inter_message_delay(&mut self, config: &WarmupConfig) -> Duration {
        self.sampler
            .duration_secs(config.min_delay_secs, config.max_delay_secs)
    }

    pub fn backoff_delay(&mut self) -> Duration {
        self.sampler.duration_secs(BACKOFF_SECS.0, BACKOFF_SECS.1)
    }
}
