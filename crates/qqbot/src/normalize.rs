//! C2C and group-at message normalization, with optional ASR for voice
//! attachments.

use {
    bytes::Bytes,
    serde::Deserialize,
    sinobridge_asr::TranscribeRequest,
    sinobridge_channels::gating,
    sinobridge_common::types::{Attachment, ChatType, InboundEnvelope, MediaKind},
    sinobridge_media::DownloadRequest,
    tracing::{debug, warn},
};

use crate::{CHANNEL_ID, error::Result, state::AccountState};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageEvent {
    pub id: String,
    pub content: Option<String>,
    pub timestamp: Option<String>,
    pub author: Author,
    /// Present on group messages only.
    pub group_openid: Option<String>,
    pub attachments: Vec<MessageAttachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Author {
    pub id: String,
    pub user_openid: Option<String>,
    pub member_openid: Option<String>,
    pub username: Option<String>,
}

impl Author {
    #[must_use]
    pub fn open_id(&self) -> &str {
        self.user_openid
            .as_deref()
            .or(self.member_openid.as_deref())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageAttachment {
    pub content_type: String,
    pub url: String,
    pub filename: Option<String>,
    pub size: Option<u64>,
}

/// What one message event turns into.
#[derive(Debug)]
pub enum NormalizeOutcome {
    Envelope(InboundEnvelope),
    /// User-visible text sent back instead of dispatching (ASR failures,
    /// oversized media).
    Notice { text: String },
    Skip(&'static str),
}

pub fn parse_message(data: &serde_json::Value) -> Result<MessageEvent> {
    Ok(serde_json::from_value(data.clone())?)
}

pub async fn build_envelope(
    state: &AccountState,
    message: MessageEvent,
    is_group: bool,
) -> Result<NormalizeOutcome> {
    let sender_id = message.author.open_id().to_string();
    let peer_id = if is_group {
        message
            .group_openid
            .clone()
            .unwrap_or_else(|| sender_id.clone())
    } else {
        sender_id.clone()
    };

    let mut parts: Vec<String> = Vec::new();
    if let Some(content) = message.content.as_deref().map(str::trim)
        && !content.is_empty()
    {
        parts.push(content.to_string());
    }

    let mut attachments: Vec<Attachment> = Vec::new();
    for attachment in &message.attachments {
        let kind = classify_attachment(attachment);
        match fetch_attachment(state, attachment, kind).await {
            Ok((saved_path, body_part)) => {
                let mut transcript = None;
                let mut body_part = body_part;
                if kind == MediaKind::Voice {
                    match transcribe_voice(state, &saved_path).await {
                        Ok(Some(text)) => {
                            body_part.push_str(&format!("\n[recognition] {text}"));
                            transcript = Some(text);
                        },
                        Ok(None) => {},
                        Err(e) => {
                            // The user spoke and nothing was understood;
                            // tell them instead of silently dropping.
                            warn!(account_id = state.account_id, error = %e, "asr failed");
                            return Ok(NormalizeOutcome::Notice {
                                text: "语音识别失败，请重试或发送文字消息。".into(),
                            });
                        },
                    }
                }
                attachments.push(Attachment {
                    kind: Some(kind),
                    source: attachment.url.clone(),
                    saved_path: Some(saved_path),
                    transcript,
                });
                parts.push(body_part);
            },
            Err(e) if matches!(&e, crate::Error::Media(m) if m.is_size_limit()) => {
                let limit_mb = state.media.config().max_bytes / (1024 * 1024);
                return Ok(NormalizeOutcome::Notice {
                    text: format!("文件超过 {limit_mb}MB 上限，未能接收。"),
                });
            },
            Err(e) => {
                warn!(account_id = state.account_id, error = %e, "attachment fetch failed");
                parts.push(format!("[{}] (download failed)", kind.body_label()));
            },
        }
    }

    let chat_type = if is_group {
        ChatType::Group
    } else {
        ChatType::Direct
    };
    // Group deliveries imply an @-mention of the bot.
    let was_mentioned = is_group;
    if parts.is_empty() && !gating::dispatch_when_empty(chat_type, was_mentioned) {
        return Ok(NormalizeOutcome::Skip("no content"));
    }
    let body = parts.join("\n");

    let now_ms = now_ms();
    let timestamp_ms = message
        .timestamp
        .as_deref()
        .and_then(parse_rfc3339_ms)
        .unwrap_or(now_ms);
    let message_id = if message.id.is_empty() {
        InboundEnvelope::synthetic_message_id(&peer_id, now_ms)
    } else {
        message.id.clone()
    };

    Ok(NormalizeOutcome::Envelope(InboundEnvelope {
        message_id,
        timestamp_ms,
        chat_type,
        sender_id,
        sender_name: message.author.username.clone(),
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned,
        channel: CHANNEL_ID.to_string(),
        account_id: state.account_id.clone(),
        message_sid: Some(message.id),
    }))
}

fn classify_attachment(attachment: &MessageAttachment) -> MediaKind {
    let content_type = attachment.content_type.to_ascii_lowercase();
    if content_type.starts_with("image") {
        MediaKind::Image
    } else if content_type.starts_with("voice") || content_type.starts_with("audio") {
        MediaKind::Voice
    } else if content_type.starts_with("video") {
        MediaKind::Video
    } else {
        MediaKind::File
    }
}

async fn fetch_attachment(
    state: &AccountState,
    attachment: &MessageAttachment,
    kind: MediaKind,
) -> Result<(String, String)> {
    // Attachment URLs sometimes arrive scheme-less.
    let url = if attachment.url.starts_with("http") {
        attachment.url.clone()
    } else {
        format!("https://{}", attachment.url)
    };
    let prefix = match kind {
        MediaKind::Image => "img",
        MediaKind::Voice => "voice",
        MediaKind::Video => "video",
        MediaKind::File => "file",
    };
    let downloaded = state
        .media
        .download(DownloadRequest {
            url: &url,
            prefix,
            filename: attachment.filename.as_deref(),
            declared_mime: Some(&attachment.content_type),
        })
        .await?;
    let archived = state.media.archive(&downloaded.path).await;
    let path = archived.display().to_string();
    Ok((path.clone(), format!("[{}] saved:{path}", kind.body_label())))
}

/// Run ASR over an archived voice file. `Ok(None)` when ASR is not
/// configured; `Err` when it ran and failed.
async fn transcribe_voice(state: &AccountState, saved_path: &str) -> Result<Option<String>> {
    let Some(transcriber) = &state.transcriber else {
        return Ok(None);
    };
    if !transcriber.is_configured() {
        return Ok(None);
    }
    let audio = tokio::fs::read(saved_path)
        .await
        .map_err(sinobridge_media::Error::Io)?;
    let voice_format = saved_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "amr".to_string());
    let transcript = transcriber
        .transcribe(TranscribeRequest {
            audio: Bytes::from(audio),
            voice_format,
        })
        .await?;
    if transcript.text.trim().is_empty() {
        debug!(account_id = state.account_id, "asr produced empty transcript");
        return Ok(None);
    }
    Ok(Some(transcript.text))
}

/// Timestamps arrive either as unix seconds or RFC 3339.
fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(seconds * 1000);
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, sinobridge_media::MediaConfig, std::sync::Arc};

    fn state() -> (tempfile::TempDir, AccountState) {
        let tmp = tempfile::tempdir().unwrap();
        let state = AccountState {
            account_id: "default".into(),
            config: crate::config::QqBotConfig::default(),
            media: Arc::new(sinobridge_media::MediaService::new(MediaConfig::new(
                tmp.path().join("tmp"),
                tmp.path().join("media"),
            ))),
            transcriber: None,
            cancel: tokio_util::sync::CancellationToken::new(),
            routes: Vec::new(),
            msg_seq: std::sync::Mutex::new(std::collections::HashMap::new()),
            seen: std::sync::Mutex::new(std::collections::VecDeque::new()),
        };
        (tmp, state)
    }

    #[tokio::test]
    async fn c2c_text_message() {
        let (_tmp, state) = state();
        let message = parse_message(&serde_json::json!({
            "id": "qm1",
            "content": " hello ",
            "author": {"id": "u1", "user_openid": "openid-u1"},
        }))
        .unwrap();
        let outcome = build_envelope(&state, message, false).await.unwrap();
        let NormalizeOutcome::Envelope(envelope) = outcome else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.sender_id, "openid-u1");
        assert_eq!(envelope.peer_id, "openid-u1");
        assert_eq!(envelope.body, "hello");
        assert_eq!(envelope.chat_type, ChatType::Direct);
        assert!(!envelope.was_mentioned);
    }

    #[tokio::test]
    async fn group_message_targets_the_group() {
        let (_tmp, state) = state();
        let message = parse_message(&serde_json::json!({
            "id": "qm2",
            "content": "hi bot",
            "author": {"id": "u1", "member_openid": "m-u1"},
            "group_openid": "g-123",
        }))
        .unwrap();
        let outcome = build_envelope(&state, message, true).await.unwrap();
        let NormalizeOutcome::Envelope(envelope) = outcome else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.peer_id, "g-123");
        assert_eq!(envelope.chat_type, ChatType::Group);
        // Group deliveries imply an @-mention of the bot.
        assert!(envelope.was_mentioned);
    }

    #[tokio::test]
    async fn empty_c2c_message_still_builds_an_envelope() {
        // C2C chats are direct, so even an empty message reaches the gate.
        let (_tmp, state) = state();
        let message = parse_message(&serde_json::json!({
            "id": "qm3",
            "content": "  ",
            "author": {"id": "u1"},
        }))
        .unwrap();
        let outcome = build_envelope(&state, message, false).await.unwrap();
        let NormalizeOutcome::Envelope(envelope) = outcome else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.body, "");
        assert_eq!(envelope.chat_type, ChatType::Direct);
    }

    #[test]
    fn attachment_classification() {
        let voice = MessageAttachment {
            content_type: "voice".into(),
            ..Default::default()
        };
        assert_eq!(classify_attachment(&voice), MediaKind::Voice);
        let image = MessageAttachment {
            content_type: "image/png".into(),
            ..Default::default()
        };
        assert_eq!(classify_attachment(&image), MediaKind::Image);
        let blob = MessageAttachment {
            content_type: "application/pdf".into(),
            ..Default::default()
        };
        assert_eq!(classify_attachment(&blob), MediaKind::File);
    }

    #[test]
    fn timestamps_parse_in_both_shapes() {
        assert_eq!(parse_rfc3339_ms("1700000000"), Some(1_700_000_000_000));
        assert_eq!(
            parse_rfc3339_ms("2023-11-14T22:13:20+00:00"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_rfc3339_ms("garbage"), None);
    }
}
