//! Evolution API client.
//!
//! Thin reqwest wrapper over the gateway's REST endpoints. Each instance is
//! addressed by name in the path; authentication is a shared `apikey` header.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Presence, SendApi};
use crate::error::SendError;
use crate::warmup::content::{MediaItem, MessageType};

#[derive(Debug, Deserialize)]
struct SendResponse {
    key: Option<MessageKey>,
}

#[derive(Debug, Deserialize)]
struct MessageKey {
    id: Option<String>,
}

/// Client for an Evolution API server.
pub struct EvolutionClient {
    base_url: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl EvolutionClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str, instance: &str) -> String {
        format!("{}/{path}/{instance}", self.base_url)
    }

    async fn post(&self, instance: &str, path: &str, body: &Value) -> Result<reqwest::Response, SendError> {
        let resp = self
            .client
            .post(self.api_url(path, instance))
            .header("apikey", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::RequestFailed {
                instance: instance.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(instance, path, status, "Evolution API rejected request");
            return Err(SendError::Rejected {
                instance: instance.to_string(),
                status,
                body,
            });
        }

        Ok(resp)
    }

    /// POST a send request and extract the created message id.
    async fn send(&self, instance: &str, path: &str, body: Value) -> Result<String, SendError> {
        let resp = self.post(instance, path, &body).await?;
        let parsed: SendResponse = resp.json().await.map_err(|e| SendError::InvalidResponse {
            instance: instance.to_string(),
            reason: e.to_string(),
        })?;

        parsed
            .key
            .and_then(|k| k.id)
            .ok_or_else(|| SendError::InvalidResponse {
                instance: instance.to_string(),
                reason: "response has no key.id".into(),
            })
    }
}

#[async_trait]
impl SendApi for EvolutionClient {
    async fn send_text(&self, instance: &str, number: &str, text: &str) -> Result<String, SendError> {
        self.send(
            instance,
            "message/sendText",
            json!({ "number": number, "text": text }),
        )
        .await
    }

    async fn send_media(
        &self,
        instance: &str,
        number: &str,
        kind: MessageType,
        media: &MediaItem,
    ) -> Result<String, SendError> {
        if !kind.is_generic_media() {
            return Err(SendError::ContentMismatch {
                kind: kind.to_string(),
            });
        }

        let mut body = json!({
            "number": number,
            "mediatype": kind.to_string(),
            "media": media.media,
        });
        if let Some(caption) = &media.caption {
            body["caption"] = json!(caption);
        }
        if let Some(filename) = &media.filename {
            body["fileName"] = json!(filename);
        }

        self.send(instance, "message/sendMedia", body).await
    }

    async fn send_audio(&self, instance: &str, number: &str, audio: &str) -> Result<String, SendError> {
        self.send(
            instance,
            "message/sendWhatsAppAudio",
            json!({ "number": number, "audio": audio }),
        )
        .await
    }

    async fn send_sticker(
        &self,
        instance: &str,
        number: &str,
        sticker: &str,
    ) -> Result<String, SendError> {
        self.send(
            instance,
            "message/sendSticker",
            json!({ "number": number, "sticker": sticker }),
        )
        .await
    }

    async fn send_reaction(
        &self,
        instance: &str,
        remote_jid: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<String, SendError> {
        self.send(
            instance,
            "message/sendReaction",
            json!({
                "key": { "remoteJid": remote_jid, "fromMe": true, "id": message_id },
                "reaction": emoji,
            }),
        )
        .await
    }

    async fn send_presence(
        &self,
        instance: &str,
        number: &str,
        presence: Presence,
        duration: Duration,
    ) -> Result<(), SendError> {
        self.post(
            instance,
            "chat/sendPresence",
            &json!({
                "number": number,
                "presence": presence.as_str(),
                "delay": duration.as_millis() as u64,
            }),
        )
        .await?;
        Ok(())
    }
}
