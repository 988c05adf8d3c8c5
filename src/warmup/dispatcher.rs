//! Message dispatcher.
//!
//! Turns a behaviour decision into a send API call and keeps the daily
//! counters in step with what actually went out. Also the entry point for
//! webhook-driven counters (received messages and delivery signals).

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::time::timeout;

use super::behavior::Target;
use super::content::{Content, MessageType};
use super::inbound::{InboundMessage, WebhookEvent};
use super::stats::{DailyKey, DeliverySignal, is_off_hours};
use crate::error::{DatabaseError, SendError};
use crate::sendapi::{Presence, SendApi};
use crate::store::WarmupStore;

static PHONE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8,15}$").expect("phone number pattern is valid"));

const GROUP_SUFFIX: &str = "@g.us";
const USER_SUFFIX: &str = "@s.whatsapp.net";

/// A normalised send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// What the send API expects in its `number` field.
    pub number: String,
    /// Chat JID used to address reactions.
    pub remote_jid: String,
}

/// Normalise a target: bare digits for numbers, `…@g.us` for groups.
pub fn normalize_target(target: &Target) -> Result<Recipient, SendError> {
    let raw = target.address().trim();
    if matches!(target, Target::Group { .. }) || raw.ends_with(GROUP_SUFFIX) {
        let id = raw.trim_end_matches(GROUP_SUFFIX);
        if id.is_empty() {
            return Err(SendError::InvalidTarget(raw.to_string()));
        }
        let jid = format!("{id}{GROUP_SUFFIX}");
        return Ok(Recipient {
            number: jid.clone(),
            remote_jid: jid,
        });
    }

    let digits: String = raw
        .trim_end_matches(USER_SUFFIX)
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    if !PHONE_NUMBER.is_match(&digits) {
        return Err(SendError::InvalidTarget(raw.to_string()));
    }
    Ok(Recipient {
        remote_jid: format!("{digits}{USER_SUFFIX}"),
        number: digits,
    })
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub recipient: Recipient,
}

/// What a webhook delivery changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Received(MessageType),
    Signal(DeliverySignal),
    Ignored,
}

pub struct MessageDispatcher {
    api: Arc<dyn SendApi>,
    store: Arc<dyn WarmupStore>,
    send_timeout: Duration,
}

impl MessageDispatcher {
    pub fn new(api: Arc<dyn SendApi>, store: Arc<dyn WarmupStore>, send_timeout: Duration) -> Self {
        Self {
            api,
            store,
            send_timeout,
        }
    }

    /// Send `content` as a `kind` message and count it.
    ///
    /// Counters move only after the API confirmed the send. A counter write
    /// that fails afterwards is logged; the message already went out.
    pub async fn send(
        &self,
        instance_id: &str,
        org_id: &str,
        target: &Target,
        kind: MessageType,
        content: &Content,
    ) -> Result<SentMessage, SendError> {
        let recipient = normalize_target(target)?;
        let number = recipient.number.as_str();

        let call = async {
            match (kind, content) {
                (MessageType::Text, Content::Text(text)) => {
                    self.api.send_text(instance_id, number, text).await
                }
                (MessageType::Audio, Content::Media(item)) => {
                    self.api.send_audio(instance_id, number, &item.media).await
                }
                (MessageType::Sticker, Content::Media(item)) => {
                    self.api.send_sticker(instance_id, number, &item.media).await
                }
                (MessageType::Image | MessageType::Video, Content::Media(item)) => {
                    self.api.send_media(instance_id, number, kind, item).await
                }
                _ => Err(SendError::ContentMismatch {
                    kind: kind.to_string(),
                }),
            }
        };

        let message_id = self.with_timeout(instance_id, call).await?;

        let now = Utc::now();
        let key = DailyKey::for_time(instance_id, org_id, now);
        if let Err(e) = self.store.increment_sent(&key, kind, is_off_hours(now)).await {
            tracing::warn!(
                instance_id,
                kind = %kind,
                error = %e,
                "Message sent but counter update failed"
            );
        }

        tracing::debug!(
            instance_id,
            target = target.label(),
            kind = %kind,
            message_id = %message_id,
            "Message sent"
        );

        Ok(SentMessage {
            message_id,
            recipient,
        })
    }

    /// React to a message this instance sent. Not counted.
    pub async fn send_reaction(
        &self,
        instance_id: &str,
        sent: &SentMessage,
        emoji: &str,
    ) -> Result<(), SendError> {
        let call = self.api.send_reaction(
            instance_id,
            &sent.recipient.remote_jid,
            &sent.message_id,
            emoji,
        );
        self.with_timeout(instance_id, call).await?;
        Ok(())
    }

    /// Show a presence to the target. Not counted.
    pub async fn send_presence(
        &self,
        instance_id: &str,
        target: &Target,
        presence: Presence,
        duration: Duration,
    ) -> Result<(), SendError> {
        let recipient = normalize_target(target)?;
        let call = self
            .api
            .send_presence(instance_id, &recipient.number, presence, duration);
        self.with_timeout(instance_id, call).await
    }

    /// Count an incoming message. Returns the counted type, if any.
    pub async fn record_inbound(
        &self,
        instance_id: &str,
        message: &InboundMessage,
    ) -> Result<Option<MessageType>, DatabaseError> {
        let Some(kind) = message.received_type() else {
            return Ok(None);
        };
        let key = self.today_key(instance_id).await?;
        self.store.increment_received(&key, kind).await?;
        Ok(Some(kind))
    }

    /// Count a delivery or trust signal.
    pub async fn record_delivery(
        &self,
        instance_id: &str,
        signal: DeliverySignal,
    ) -> Result<(), DatabaseError> {
        let key = self.today_key(instance_id).await?;
        self.store.increment_signal(&key, signal).await
    }

    /// Apply a parsed webhook to the counters.
    pub async fn handle_webhook(
        &self,
        instance_id: &str,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, DatabaseError> {
        let signal = match event {
            WebhookEvent::Message(message) => {
                return Ok(self
                    .record_inbound(instance_id, message)
                    .await?
                    .map_or(WebhookOutcome::Ignored, WebhookOutcome::Received));
            }
            WebhookEvent::StatusUpdate(update) => update.signal(),
            WebhookEvent::AccountSignal(account) => Some(account.signal),
            WebhookEvent::Ignored(name) => {
                tracing::trace!(instance_id, event = %name, "Ignoring webhook event");
                None
            }
        };

        match signal {
            Some(signal) => {
                self.record_delivery(instance_id, signal).await?;
                Ok(WebhookOutcome::Signal(signal))
            }
            None => Ok(WebhookOutcome::Ignored),
        }
    }

    /// Today's counter key; the org comes from the persisted run state.
    async fn today_key(&self, instance_id: &str) -> Result<DailyKey, DatabaseError> {
        let state = self
            .store
            .get_instance_state(instance_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "warmup_instance".into(),
                id: instance_id.to_string(),
            })?;
        Ok(DailyKey::for_time(instance_id, &state.org_id, Utc::now()))
    }

    async fn with_timeout<T>(
        &self,
        instance_id: &str,
        call: impl Future<Output = Result<T, SendError>>,
    ) -> Result<T, SendError> {
        match timeout(self.send_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout {
                instance: instance_id.to_string(),
                timeout: self.send_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::warmup::content::MediaItem;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<String>>,
        fail: bool,
        hang: bool,
    }

    impl RecordingApi {
        async fn record(&self, call: String) -> Result<String, SendError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(SendError::Rejected {
                    instance: "inst".into(),
                    status: 500,
                    body: "boom".into(),
                });
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push(call);
            Ok(format!("msg-{}", calls.len()))
        }
    }

    #[async_trait]
    impl SendApi for RecordingApi {
        async fn send_text(&self, _: &str, number: &str, text: &str) -> Result<String, SendError> {
            self.record(format!("text:{number}:{text}")).await
        }
        async fn send_media(
            &self,
            _: &str,
            number: &str,
            kind: MessageType,
            media: &MediaItem,
        ) -> Result<String, SendError> {
            self.record(format!("{kind}:{number}:{}", media.media)).await
        }
        async fn send_audio(&self, _: &str, number: &str, audio: &str) -> Result<String, SendError> {
            self.record(format!("audio:{number}:{audio}")).await
        }
        async fn send_sticker(&self, _: &str, number: &str, sticker: &str) -> Result<String, SendError> {
            self.record(format!("sticker:{number}:{sticker}")).await
        }
        async fn send_reaction(
            &self,
            _: &str,
            jid: &str,
            id: &str,
            emoji: &str,
        ) -> Result<String, SendError> {
            self.record(format!("reaction:{jid}:{id}:{emoji}")).await
        }
    }

    fn peer(number: &str) -> Target {
        Target::Peer {
            instance_id: "inst-b".into(),
            phone_number: number.into(),
        }
    }

    fn dispatcher(api: Arc<RecordingApi>, store: Arc<MemoryStore>) -> MessageDispatcher {
        MessageDispatcher::new(api, store, Duration::from_secs(5))
    }

    #[test]
    fn normalizes_numbers_and_groups() {
        let r = normalize_target(&peer("+55 (11) 90000-0001")).unwrap();
        assert_eq!(r.number, "5511900000001");
        assert_eq!(r.remote_jid, "5511900000001@s.whatsapp.net");

        let r = normalize_target(&peer("5511900000001@s.whatsapp.net")).unwrap();
        assert_eq!(r.number, "5511900000001");

        let group = Target::Group {
            group_id: "120363000000000001".into(),
        };
        assert_eq!(normalize_target(&group).unwrap().number, "120363000000000001@g.us");

        assert!(matches!(
            normalize_target(&peer("12345")),
            Err(SendError::InvalidTarget(_))
        ));
        let empty_group = Target::Group {
            group_id: "@g.us".into(),
        };
        assert!(normalize_target(&empty_group).is_err());
    }

    #[tokio::test]
    async fn successful_sends_are_counted_by_type() {
        let api = Arc::new(RecordingApi::default());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(api.clone(), store.clone());

        let sent = dispatcher
            .send("inst", "org", &peer("5511900000001"), MessageType::Text, &Content::Text("oi".into()))
            .await
            .unwrap();
        assert_eq!(sent.message_id, "msg-1");
        dispatcher
            .send(
                "inst",
                "org",
                &peer("5511900000001"),
                MessageType::Image,
                &Content::Media(MediaItem::new("https://cdn.example/a.jpg")),
            )
            .await
            .unwrap();

        let stats = store
            .get_daily_stats(&DailyKey::for_time("inst", "org", Utc::now()))
            .await
            .unwrap();
        assert_eq!(stats.total_sent, 2);
        assert_eq!(stats.sent(MessageType::Text), 1);
        assert_eq!(stats.sent(MessageType::Image), 1);
        assert_eq!(stats.total_sent, stats.sent_by_type_sum());

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(calls[0], "text:5511900000001:oi");
        assert_eq!(calls[1], "image:5511900000001:https://cdn.example/a.jpg");
    }

    #[tokio::test]
    async fn failures_leave_counters_untouched() {
        let api = Arc::new(RecordingApi {
            fail: true,
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(api, store.clone());

        let err = dispatcher
            .send("inst", "org", &peer("5511900000001"), MessageType::Text, &Content::Text("oi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Rejected { status: 500, .. }));

        let mismatch = dispatcher
            .send("inst", "org", &peer("5511900000001"), MessageType::Text, &Content::Media(MediaItem::new("x")))
            .await
            .unwrap_err();
        assert!(matches!(mismatch, SendError::ContentMismatch { .. }));

        let stats = store
            .get_daily_stats(&DailyKey::for_time("inst", "org", Utc::now()))
            .await
            .unwrap();
        assert_eq!(stats.total_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out() {
        let api = Arc::new(RecordingApi {
            hang: true,
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(api, store);

        let err = dispatcher
            .send("inst", "org", &peer("5511900000001"), MessageType::Text, &Content::Text("oi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn reactions_are_not_counted() {
        let api = Arc::new(RecordingApi::default());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(api.clone(), store.clone());

        let sent = dispatcher
            .send("inst", "org", &peer("5511900000001"), MessageType::Text, &Content::Text("oi".into()))
            .await
            .unwrap();
        dispatcher.send_reaction("inst", &sent, "👍").await.unwrap();

        let stats = store
            .get_daily_stats(&DailyKey::for_time("inst", "org", Utc::now()))
            .await
            .unwrap();
        assert_eq!(stats.total_sent, 1);
        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(calls[1], "reaction:5511900000001@s.whatsapp.net:msg-1:👍");
    }

    #[tokio::test]
    async fn webhooks_update_received_and_signal_counters() {
        let api = Arc::new(RecordingApi::default());
        let store = Arc::new(MemoryStore::new());
        store.activate_instance("inst", "org", 100, Utc::now()).await.unwrap();
        let dispatcher = dispatcher(api, store.clone());

        let inbound = WebhookEvent::parse(serde_json::json!({
            "event": "messages.upsert",
            "data": { "key": { "fromMe": false }, "message": { "audioMessage": {} } }
        }))
        .unwrap();
        assert_eq!(
            dispatcher.handle_webhook("inst", &inbound).await.unwrap(),
            WebhookOutcome::Received(MessageType::Audio)
        );

        let read = WebhookEvent::parse(serde_json::json!({
            "event": "messages.update",
            "data": { "status": "READ" }
        }))
        .unwrap();
        assert_eq!(
            dispatcher.handle_webhook("inst", &read).await.unwrap(),
            WebhookOutcome::Signal(DeliverySignal::Read)
        );

        dispatcher
            .record_delivery("inst", DeliverySignal::Blocked)
            .await
            .unwrap();

        let stats = store
            .get_daily_stats(&DailyKey::for_time("inst", "org", Utc::now()))
            .await
            .unwrap();
        assert_eq!(stats.received(MessageType::Audio), 1);
        assert_eq!(stats.total_received, 1);
        assert_eq!(stats.read, 1);
        assert_eq!(stats.blocked, 1);
    }

    #[tokio::test]
    async fn webhook_for_unknown_instance_is_not_found() {
        let dispatcher = dispatcher(Arc::new(RecordingApi::default()), Arc::new(MemoryStore::new()));
        let err = dispatcher
            .record_delivery("ghost", DeliverySignal::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
