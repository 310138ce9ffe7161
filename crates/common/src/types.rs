use serde::{Deserialize, Serialize};

/// Whether a conversation is one-on-one or a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

impl ChatType {
    #[must_use]
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Direct)
    }
}

/// Coarse media classification used by the media pipeline and the
/// per-platform senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Voice,
    Video,
    File,
}

impl MediaKind {
    /// Label spliced into envelope bodies (`[image] saved:...`).
    #[must_use]
    pub fn body_label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

/// One inbound attachment, after the media pipeline has run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: Option<MediaKind>,
    /// Platform-side origin: a URL or an opaque media id.
    pub source: String,
    /// Absolute path after archiving, when the download succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    /// Voice transcript (platform recognition or ASR).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// Channel-neutral inbound message handed to the host runtime.
///
/// `message_id` is the host's de-duplication key and must be unique within
/// an account's retention window. `body` carries media references in the
/// stable `saved:<abs-path>` form once files have been archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub message_id: String,
    pub timestamp_ms: i64,
    pub chat_type: ChatType,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// The user for DMs, the group/conversation for group chats.
    pub peer_id: String,
    pub body: String,
    pub raw_body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub was_mentioned: bool,
    pub channel: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_sid: Option<String>,
}

impl InboundEnvelope {
    /// Fallback id for platforms that deliver no stable message id.
    #[must_use]
    pub fn synthetic_message_id(conversation_id: &str, now_ms: i64) -> String {
        format!("{conversation_id}_{now_ms}")
    }
}

/// Outbound media reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// A URL or an absolute local path.
    pub url: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Host reply content: text, optionally with one media item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
}

impl ReplyPayload {
    #[must_use]
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_through_json() {
        let env = InboundEnvelope {
            message_id: "m1".into(),
            timestamp_ms: 1_700_000_000_000,
            chat_type: ChatType::Group,
            sender_id: "u1".into(),
            sender_name: Some("Alice".into()),
            peer_id: "cv1".into(),
            body: "[image] saved:/var/media/inbound/2026-08-01/img_1_aa.jpg".into(),
            raw_body: "hello".into(),
            attachments: vec![Attachment {
                kind: Some(MediaKind::Image),
                source: "mid123".into(),
                saved_path: Some("/var/media/inbound/2026-08-01/img_1_aa.jpg".into()),
                transcript: None,
            }],
            was_mentioned: true,
            channel: "dingtalk".into(),
            account_id: "default".into(),
            message_sid: None,
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: InboundEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, "m1");
        assert_eq!(back.chat_type, ChatType::Group);
        assert_eq!(back.attachments.len(), 1);
    }

    #[test]
    fn synthetic_id_includes_conversation_and_time() {
        assert_eq!(
            InboundEnvelope::synthetic_message_id("cv1", 42),
            "cv1_42"
        );
    }

    #[test]
    fn chat_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChatType::Direct).unwrap(), "\"direct\"");
    }
}
