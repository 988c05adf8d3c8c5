//! Webhook payloads pushed by the gateway.
//!
//! Only the fields the counters need are modelled; everything else in the
//! envelope is ignored.

use serde::Deserialize;
use serde_json::Value;

use super::content::MessageType;
use super::stats::DeliverySignal;

/// A parsed webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// `messages.upsert`
    Message(InboundMessage),
    /// `messages.update`
    StatusUpdate(StatusUpdate),
    /// `account.signal`: trust signals (blocks, spam reports, warnings).
    AccountSignal(AccountSignal),
    /// Any event this service does not count.
    Ignored(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl WebhookEvent {
    /// Parse a raw webhook body.
    pub fn parse(body: Value) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_value(body)?;
        let event = match envelope.event.as_str() {
            "messages.upsert" | "MESSAGES_UPSERT" => Self::Message(serde_json::from_value(envelope.data)?),
            "messages.update" | "MESSAGES_UPDATE" => {
                Self::StatusUpdate(serde_json::from_value(envelope.data)?)
            }
            "account.signal" => Self::AccountSignal(serde_json::from_value(envelope.data)?),
            _ => Self::Ignored(envelope.event),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    pub id: Option<String>,
}

/// Message body variants. Exactly one is normally present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub conversation: Option<String>,
    pub extended_text_message: Option<Value>,
    pub image_message: Option<Value>,
    pub audio_message: Option<Value>,
    pub video_message: Option<Value>,
    pub sticker_message: Option<Value>,
    pub reaction_message: Option<Value>,
    pub document_message: Option<Value>,
}

impl MessagePayload {
    /// Counted message type; `None` for reactions, documents and unknown bodies.
    pub fn classify(&self) -> Option<MessageType> {
        if self.reaction_message.is_some() || self.document_message.is_some() {
            return None;
        }
        if self.conversation.is_some() || self.extended_text_message.is_some() {
            Some(MessageType::Text)
        } else if self.image_message.is_some() {
            Some(MessageType::Image)
        } else if self.audio_message.is_some() {
            Some(MessageType::Audio)
        } else if self.video_message.is_some() {
            Some(MessageType::Video)
        } else if self.sticker_message.is_some() {
            Some(MessageType::Sticker)
        } else {
            None
        }
    }
}

/// An incoming (or echoed) message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessagePayload>,
}

impl InboundMessage {
    /// Type to count as received, if any. Own echoes are never counted.
    pub fn received_type(&self) -> Option<MessageType> {
        if self.key.from_me {
            return None;
        }
        self.message.as_ref()?.classify()
    }
}

/// Delivery status change for a sent message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub key_id: Option<String>,
    pub status: String,
}

impl StatusUpdate {
    pub fn signal(&self) -> Option<DeliverySignal> {
        match self.status.to_ascii_uppercase().as_str() {
            "DELIVERY_ACK" => Some(DeliverySignal::Delivered),
            "READ" | "PLAYED" => Some(DeliverySignal::Read),
            "ERROR" => Some(DeliverySignal::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccountSignal {
    pub signal: DeliverySignal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_upsert() {
        let event = WebhookEvent::parse(json!({
            "event": "messages.upsert",
            "instance": "inst-a",
            "data": {
                "key": { "remoteJid": "5511900000001@s.whatsapp.net", "fromMe": false, "id": "ABC" },
                "pushName": "Ana",
                "message": { "conversation": "oi" }
            }
        }))
        .unwrap();

        let WebhookEvent::Message(msg) = event else {
            panic!("expected message event");
        };
        assert_eq!(msg.received_type(), Some(MessageType::Text));
        assert_eq!(msg.key.id.as_deref(), Some("ABC"));
    }

    #[test]
    fn own_echoes_reactions_and_documents_are_not_counted() {
        let echo: InboundMessage = serde_json::from_value(json!({
            "key": { "fromMe": true },
            "message": { "conversation": "oi" }
        }))
        .unwrap();
        assert_eq!(echo.received_type(), None);

        let reaction: InboundMessage = serde_json::from_value(json!({
            "key": { "fromMe": false },
            "message": { "reactionMessage": { "text": "👍" } }
        }))
        .unwrap();
        assert_eq!(reaction.received_type(), None);

        let document: InboundMessage = serde_json::from_value(json!({
            "message": { "documentMessage": { "fileName": "a.pdf" } }
        }))
        .unwrap();
        assert_eq!(document.received_type(), None);
    }

    #[test]
    fn media_bodies_classify_by_type() {
        for (field, kind) in [
            ("imageMessage", MessageType::Image),
            ("audioMessage", MessageType::Audio),
            ("videoMessage", MessageType::Video),
            ("stickerMessage", MessageType::Sticker),
            ("extendedTextMessage", MessageType::Text),
        ] {
            let mut body = serde_json::Map::new();
            body.insert(field.to_string(), json!({}));
            let msg: InboundMessage = serde_json::from_value(json!({ "message": body })).unwrap();
            assert_eq!(msg.received_type(), Some(kind), "{field}");
        }
    }

    #[test]
    fn status_updates_map_to_signals() {
        let event = WebhookEvent::parse(json!({
            "event": "messages.update",
            "data": { "keyId": "ABC", "status": "READ" }
        }))
        .unwrap();
        let WebhookEvent::StatusUpdate(update) = event else {
            panic!("expected status update");
        };
        assert_eq!(update.signal(), Some(DeliverySignal::Read));

        let ack = StatusUpdate {
            key_id: None,
            status: "DELIVERY_ACK".into(),
        };
        assert_eq!(ack.signal(), Some(DeliverySignal::Delivered));
        let server = StatusUpdate {
            key_id: None,
            status: "SERVER_ACK".into(),
        };
        assert_eq!(server.signal(), None);
    }

    #[test]
    fn account_signals_and_unknown_events() {
        let event = WebhookEvent::parse(json!({
            "event": "account.signal",
            "data": { "signal": "spam_report" }
        }))
        .unwrap();
        assert_eq!(
            event,
            WebhookEvent::AccountSignal(AccountSignal {
                signal: DeliverySignal::SpamReport
            })
        );

        let other = WebhookEvent::parse(json!({ "event": "connection.update", "data": {} })).unwrap();
        assert_eq!(other, WebhookEvent::Ignored("connection.update".into()));
    }
}
