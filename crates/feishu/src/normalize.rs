//! `im.message.receive_v1` event normalization.

use {
    serde::Deserialize,
    sinobridge_channels::gating,
    sinobridge_common::types::{Attachment, ChatType, InboundEnvelope, MediaKind},
    tracing::warn,
};

use crate::{CHANNEL_ID, error::Result, state::AccountState, token::TenantTokenSource};

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiveEvent {
    pub sender: EventSender,
    pub message: EventMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSender {
    pub sender_id: SenderId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SenderId {
    pub open_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventMessage {
    pub message_id: String,
    pub chat_id: String,
    /// `p2p` or `group`.
    pub chat_type: String,
    pub message_type: String,
    /// JSON-encoded content, shape depending on `message_type`.
    pub content: String,
    pub create_time: Option<String>,
    pub mentions: Vec<Mention>,
}

impl Default for EventMessage {
    fn default() -> Self {
        Self {
            message_id: String::new(),
            chat_id: String::new(),
            chat_type: "p2p".into(),
            message_type: String::new(),
            content: String::new(),
            create_time: None,
            mentions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Mention {
    pub key: String,
    pub name: Option<String>,
}

pub fn parse_event(event: &serde_json::Value) -> Result<ReceiveEvent> {
    Ok(serde_json::from_value(event.clone())?)
}

/// Build an envelope from one receive event; image/file/audio content is
/// fetched through the message-resource API and archived.
pub async fn build_envelope(
    state: &AccountState,
    tokens: &TenantTokenSource,
    event: &ReceiveEvent,
) -> Result<Option<InboundEnvelope>> {
    let message = &event.message;
    let is_group = message.chat_type == "group";
    let chat_type = if is_group {
        ChatType::Group
    } else {
        ChatType::Direct
    };
    let was_mentioned = is_group && !message.mentions.is_empty();
    let sender_id = event.sender.sender_id.open_id.clone();
    let peer_id = if is_group {
        message.chat_id.clone()
    } else {
        sender_id.clone()
    };

    let content: serde_json::Value = serde_json::from_str(&message.content).unwrap_or_default();
    let mut attachments: Vec<Attachment> = Vec::new();
    let body = match message.message_type.as_str() {
        "text" => {
            let text = content
                .get("text")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            strip_mention_placeholders(text, &message.mentions)
                .trim()
                .to_string()
        },
        "image" => {
            let key = content
                .get("image_key")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            media_part(state, tokens, message, key, "image", MediaKind::Image, None, &mut attachments)
                .await
        },
        "file" => {
            let key = content
                .get("file_key")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let name = content
                .get("file_name")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            media_part(state, tokens, message, key, "file", MediaKind::File, name, &mut attachments)
                .await
        },
        "audio" => {
            let key = content
                .get("file_key")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            media_part(state, tokens, message, key, "file", MediaKind::Voice, None, &mut attachments)
                .await
        },
        "post" => flatten_post(&content),
        _ => return Ok(None),
    };

    // DMs and @-mentions get an envelope even with nothing in it; the
    // gate decides. Unmentioned empty group messages stop here.
    if body.is_empty()
        && attachments.is_empty()
        && !gating::dispatch_when_empty(chat_type, was_mentioned)
    {
        return Ok(None);
    }

    let now_ms = now_ms();
    let timestamp_ms = message
        .create_time
        .as_deref()
        .and_then(|t| t.parse::<i64>().ok())
        .unwrap_or(now_ms);
    let message_id = if message.message_id.is_empty() {
        InboundEnvelope::synthetic_message_id(&message.chat_id, now_ms)
    } else {
        message.message_id.clone()
    };

    Ok(Some(InboundEnvelope {
        message_id,
        timestamp_ms,
        chat_type,
        sender_id,
        sender_name: None,
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned,
        channel: CHANNEL_ID.to_string(),
        account_id: state.account_id.clone(),
        message_sid: Some(message.message_id.clone()),
    }))
}

/// Rich `post` content flattens to its text runs, one paragraph per line.
fn flatten_post(content: &serde_json::Value) -> String {
    let mut out: Vec<String> = Vec::new();
    if let Some(title) = content.get("title").and_then(serde_json::Value::as_str)
        && !title.is_empty()
    {
        out.push(title.to_string());
    }
    if let Some(paragraphs) = content.get("content").and_then(serde_json::Value::as_array) {
        for paragraph in paragraphs {
            let mut line = String::new();
            if let Some(runs) = paragraph.as_array() {
                for run in runs {
                    if let Some(text) = run.get("text").and_then(serde_json::Value::as_str) {
                        line.push_str(text);
                    }
                }
            }
            if !line.is_empty() {
                out.push(line);
            }
        }
    }
    out.join("\n")
}

/// Mentions appear in text as `@_user_1` placeholders.
fn strip_mention_placeholders(text: &str, mentions: &[Mention]) -> String {
    let mut out = text.to_string();
    for mention in mentions {
        if !mention.key.is_empty() {
            out = out.replace(&mention.key, "");
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn media_part(
    state: &AccountState,
    tokens: &TenantTokenSource,
    message: &EventMessage,
    file_key: &str,
    resource_type: &str,
    kind: MediaKind,
    filename: Option<String>,
    attachments: &mut Vec<Attachment>,
) -> String {
    if file_key.is_empty() {
        return format!("[{}]", kind.body_label());
    }
    match fetch_resource(state, tokens, message, file_key, resource_type, kind, filename).await {
        Ok((body, attachment)) => {
            attachments.push(attachment);
            body
        },
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "resource fetch failed");
            format!("[{}] (download failed)", kind.body_label())
        },
    }
}

async fn fetch_resource(
    state: &AccountState,
    tokens: &TenantTokenSource,
    message: &EventMessage,
    file_key: &str,
    resource_type: &str,
    kind: MediaKind,
    filename: Option<String>,
) -> Result<(String, Attachment)> {
    let token = tokens.access_token(&state.config).await?;
    let url = format!(
        "{}/open-apis/im/v1/messages/{}/resources/{}?type={}",
        tokens.base_url(),
        message.message_id,
        file_key,
        resource_type
    );
    // The resource endpoint wants a bearer header, which the media
    // downloader does not model; fetch here and hand the bytes to the
    // archive path.
    let max_bytes = state.media.config().max_bytes;
    let mut response = reqwest::Client::new()
        .get(&url)
        .timeout(state.media.config().download_timeout)
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await?
        .error_for_status()?;
    if let Some(len) = response.content_length()
        && len > max_bytes
    {
        return Err(crate::Error::Media(sinobridge_media::Error::SizeLimit {
            limit_bytes: max_bytes,
        }));
    }
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
            return Err(crate::Error::Media(sinobridge_media::Error::SizeLimit {
                limit_bytes: max_bytes,
            }));
        }
        bytes.extend_from_slice(&chunk);
    }

    let prefix = match kind {
        MediaKind::Image => "img",
        MediaKind::Voice => "voice",
        MediaKind::Video => "video",
        MediaKind::File => "file",
    };
    let ext = filename
        .as_deref()
        .and_then(|f| f.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
        .unwrap_or_else(|| {
            if kind == MediaKind::Image {
                "png".to_string()
            } else {
                "bin".to_string()
            }
        });
    let temp = state
        .media
        .config()
        .temp_root
        .join(format!("{prefix}_{}_{file_key}.{ext}", now_ms()));
    if let Some(parent) = temp.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(sinobridge_media::Error::Io)?;
    }
    tokio::fs::write(&temp, &bytes).await.map_err(sinobridge_media::Error::Io)?;
    let archived = state.media.archive(&temp).await;
    let path = archived.display().to_string();

    Ok((
        format!("[{}] saved:{path}", kind.body_label()),
        Attachment {
            kind: Some(kind),
            source: file_key.to_string(),
            saved_path: Some(path),
            transcript: None,
        },
    ))
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
            config: crate::config::FeishuConfig::default(),
            media: Arc::new(sinobridge_media::MediaService::new(MediaConfig::new(
                tmp.path().join("tmp"),
                tmp.path().join("media"),
            ))),
            cancel: tokio_util::sync::CancellationToken::new(),
            seen: std::sync::Mutex::new(std::collections::VecDeque::new()),
        };
        (tmp, state)
    }

    fn event(value: serde_json::Value) -> ReceiveEvent {
        parse_event(&value).unwrap()
    }

    #[tokio::test]
    async fn group_text_with_mention() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_alice"}},
            "message": {
                "message_id": "om_1",
                "chat_id": "oc_room",
                "chat_type": "group",
                "message_type": "text",
                "content": "{\"text\":\"@_user_1 hello bot\"}",
                "create_time": "1700000000000",
                "mentions": [{"key": "@_user_1", "name": "bot"}]
            }
        }));
        let envelope = build_envelope(&state, &tokens, &event).await.unwrap().unwrap();
        assert_eq!(envelope.peer_id, "oc_room");
        assert_eq!(envelope.sender_id, "ou_alice");
        assert!(envelope.was_mentioned);
        assert_eq!(envelope.body, "hello bot");
        assert_eq!(envelope.timestamp_ms, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn p2p_text_has_sender_as_peer() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_bob"}},
            "message": {
                "message_id": "om_2",
                "chat_id": "oc_dm",
                "chat_type": "p2p",
                "message_type": "text",
                "content": "{\"text\":\"hi\"}",
            }
        }));
        let envelope = build_envelope(&state, &tokens, &event).await.unwrap().unwrap();
        assert_eq!(envelope.peer_id, "ou_bob");
        assert_eq!(envelope.chat_type, ChatType::Direct);
        assert!(!envelope.was_mentioned);
    }

    #[tokio::test]
    async fn post_content_flattens_runs() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        let content = serde_json::json!({
            "title": "notes",
            "content": [
                [{"tag": "text", "text": "first "}, {"tag": "text", "text": "line"}],
                [{"tag": "text", "text": "second"}]
            ]
        })
        .to_string();
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_a"}},
            "message": {
                "message_id": "om_3",
                "chat_id": "oc_dm",
                "chat_type": "p2p",
                "message_type": "post",
                "content": content,
            }
        }));
        let envelope = build_envelope(&state, &tokens, &event).await.unwrap().unwrap();
        assert_eq!(envelope.body, "notes\nfirst line\nsecond");
    }

    #[tokio::test]
    async fn mention_only_group_text_still_builds_an_envelope() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        // The message is nothing but the @-mention placeholder.
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_a"}},
            "message": {
                "message_id": "om_5",
                "chat_id": "oc_room",
                "chat_type": "group",
                "message_type": "text",
                "content": "{\"text\":\"@_user_1\"}",
                "mentions": [{"key": "@_user_1", "name": "bot"}]
            }
        }));
        let envelope = build_envelope(&state, &tokens, &event).await.unwrap().unwrap();
        assert_eq!(envelope.body, "");
        assert!(envelope.was_mentioned);
    }

    #[tokio::test]
    async fn empty_unmentioned_group_text_is_dropped() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_a"}},
            "message": {
                "message_id": "om_6",
                "chat_id": "oc_room",
                "chat_type": "group",
                "message_type": "text",
                "content": "{\"text\":\"  \"}",
            }
        }));
        assert!(build_envelope(&state, &tokens, &event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_p2p_text_still_builds_an_envelope() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_b"}},
            "message": {
                "message_id": "om_7",
                "chat_id": "oc_dm",
                "chat_type": "p2p",
                "message_type": "text",
                "content": "{\"text\":\"\"}",
            }
        }));
        let envelope = build_envelope(&state, &tokens, &event).await.unwrap().unwrap();
        assert_eq!(envelope.body, "");
        assert_eq!(envelope.chat_type, ChatType::Direct);
    }

    #[tokio::test]
    async fn unsupported_types_are_skipped() {
        let (_tmp, state) = state();
        let tokens = TenantTokenSource::new();
        let event = event(serde_json::json!({
            "sender": {"sender_id": {"open_id": "ou_a"}},
            "message": {
                "message_id": "om_4",
                "chat_id": "oc_dm",
                "chat_type": "p2p",
                "message_type": "sticker",
                "content": "{}",
            }
        }));
        assert!(build_envelope(&state, &tokens, &event).await.unwrap().is_none());
    }
}
