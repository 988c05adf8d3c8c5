//! Message types and the content library sampled by the behaviour model.

use serde::{Deserialize, Serialize};

/// Kind of message a warmup loop sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Audio,
    Sticker,
    Image,
    Video,
}

impl MessageType {
    /// Order in which cumulative selection thresholds are consumed.
    pub const SELECTION_ORDER: [MessageType; 5] = [
        MessageType::Text,
        MessageType::Audio,
        MessageType::Sticker,
        MessageType::Image,
        MessageType::Video,
    ];

    /// Column prefix used by the daily counter tables.
    pub fn column_prefix(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Sticker => "sticker",
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    /// Media types sent through the generic media endpoint.
    pub fn is_generic_media(&self) -> bool {
        matches!(self, Self::Image | Self::Video)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.column_prefix())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "audio" => Ok(Self::Audio),
            "sticker" => Ok(Self::Sticker),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A media item: a URL or base64 payload with optional caption and filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub media: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl MediaItem {
    pub fn new(media: impl Into<String>) -> Self {
        Self {
            media: media.into(),
            caption: None,
            filename: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// Content chosen for a single send.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Media(MediaItem),
}

/// Pools of content the loop samples from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentLibrary {
    pub texts: Vec<String>,
    pub images: Vec<MediaItem>,
    pub audios: Vec<MediaItem>,
    pub videos: Vec<MediaItem>,
    pub stickers: Vec<MediaItem>,
    pub emojis: Vec<String>,
}

impl ContentLibrary {
    /// Number of items available for a message type.
    pub fn pool_len(&self, kind: MessageType) -> usize {
        match kind {
            MessageType::Text => self.texts.len(),
            MessageType::Audio => self.audios.len(),
            MessageType::Sticker => self.stickers.len(),
            MessageType::Image => self.images.len(),
            MessageType::Video => self.videos.len(),
        }
    }

    /// Whether any of the given types has content.
    pub fn has_content_for(&self, kinds: &[MessageType]) -> bool {
        kinds.iter().any(|k| self.pool_len(*k) > 0)
    }

    /// Get the content at `index` in the pool for `kind`.
    pub fn get(&self, kind: MessageType, index: usize) -> Option<Content> {
        match kind {
            MessageType::Text => self.texts.get(index).cloned().map(Content::Text),
            MessageType::Audio => self.audios.get(index).cloned().map(Content::Media),
            MessageType::Sticker => self.stickers.get(index).cloned().map(Content::Media),
            MessageType::Image => self.images.get(index).cloned().map(Content::Media),
            MessageType::Video => self.videos.get(index).cloned().map(Content::Media),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_parse_and_display() {
        assert_eq!("Audio".parse::<MessageType>().unwrap(), MessageType::Audio);
        assert_eq!(MessageType::Sticker.to_string(), "sticker");
        assert!("document".parse::<MessageType>().is_err());
    }

    #[test]
    fn library_pool_lookup() {
        let library = ContentLibrary {
            texts: vec!["oi".into(), "tudo bem?".into()],
            images: vec![MediaItem::new("https://cdn.example/a.jpg").with_caption("look")],
            ..Default::default()
        };

        assert_eq!(library.pool_len(MessageType::Text), 2);
        assert_eq!(library.pool_len(MessageType::Video), 0);
        assert!(library.has_content_for(&[MessageType::Video, MessageType::Image]));
        assert!(!library.has_content_for(&[MessageType::Audio]));
        assert_eq!(
            library.get(MessageType::Text, 1),
            Some(Content::Text("tudo bem?".into()))
        );
        assert!(library.get(MessageType::Sticker, 0).is_none());
    }

    #[test]
    fn library_deserializes_with_missing_pools() {
        let library: ContentLibrary =
            serde_json::from_str(r#"{"texts": ["hello"], "emojis": ["👍"]}"#).unwrap();
        assert_eq!(library.texts.len(), 1);
        assert!(library.audios.is_empty());
    }
}
