//! Outbound messaging API used by the warmup loops.

mod evolution;

pub use evolution::EvolutionClient;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SendError;
use crate::warmup::content::{MediaItem, MessageType};

/// Chat presence shown to the recipient while a message is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    Composing,
    Recording,
    Paused,
}

impl Presence {
    /// Presence matching the kind of message being prepared.
    pub fn for_message(kind: MessageType) -> Self {
        match kind {
            MessageType::Audio => Self::Recording,
            _ => Self::Composing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Composing => "composing",
            Self::Recording => "recording",
            Self::Paused => "paused",
        }
    }
}

/// A messaging gateway that can act on behalf of an instance.
///
/// Every send returns the provider's message id. Targets are already
/// normalised: digits for numbers, `…@g.us` for groups.
#[async_trait]
pub trait SendApi: Send + Sync {
    async fn send_text(&self, instance: &str, number: &str, text: &str) -> Result<String, SendError>;

    /// Image or video through the generic media endpoint.
    async fn send_media(
        &self,
        instance: &str,
        number: &str,
        kind: MessageType,
        media: &MediaItem,
    ) -> Result<String, SendError>;

    async fn send_audio(&self, instance: &str, number: &str, audio: &str) -> Result<String, SendError>;

    async fn send_sticker(
        &self,
        instance: &str,
        number: &str,
        sticker: &str,
    ) -> Result<String, SendError>;

    async fn send_reaction(
        &self,
        instance: &str,
        remote_jid: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<String, SendError>;

    /// Show a presence for `duration`. Gateways without presence support
    /// can keep the default no-op.
    async fn send_presence(
        &self,
        _instance: &str,
        _number: &str,
        _presence: Presence,
        _duration: Duration,
    ) -> Result<(), SendError> {
        Ok(())
    }
}
