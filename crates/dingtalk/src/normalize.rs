//! Robot callback message normalization.

use {
    serde::Deserialize,
    sinobridge_channels::gating,
    sinobridge_common::types::{Attachment, ChatType, InboundEnvelope, MediaKind},
    sinobridge_media::DownloadRequest,
    tracing::warn,
};

use crate::{CHANNEL_ID, error::Result, state::AccountState, token::AppTokenSource};

/// Robot message as decoded from a stream CALLBACK frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RobotMessage {
    pub msgtype: String,
    pub msg_id: Option<String>,
    pub conversation_id: String,
    /// `"1"` for 1:1 chats, `"2"` for groups.
    pub conversation_type: String,
    pub conversation_title: Option<String>,
    pub sender_id: Option<String>,
    pub sender_staff_id: Option<String>,
    pub sender_nick: Option<String>,
    pub chatbot_user_id: Option<String>,
    pub at_users: Vec<AtUser>,
    pub is_in_at_list: Option<bool>,
    pub create_at: Option<i64>,
    pub session_webhook: Option<String>,
    pub session_webhook_expired_time: Option<i64>,
    pub robot_code: Option<String>,
    pub text: Option<TextContent>,
    pub content: Option<RichContent>,
    pub audio: Option<AudioContent>,
    pub file: Option<FileContent>,
    pub video: Option<VideoContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AtUser {
    pub dingtalk_id: String,
    pub staff_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextContent {
    #[serde(default)]
    pub content: String,
}

/// `content` carries the rich-text runs for `richText` messages and the
/// download code for `picture` messages.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RichContent {
    pub rich_text: Vec<RichTextItem>,
    pub download_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RichTextItem {
    pub text: Option<String>,
    pub download_code: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioContent {
    pub download_code: Option<String>,
    pub duration: Option<i64>,
    /// Platform-side speech recognition; trusted as the final transcript.
    pub recognition: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileContent {
    pub download_code: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoContent {
    pub download_code: Option<String>,
    pub duration: Option<i64>,
}

/// Envelope plus the reply routing the platform handed us.
#[derive(Debug)]
pub struct NormalizedMessage {
    pub envelope: InboundEnvelope,
    pub session_webhook: Option<String>,
}

pub fn parse_robot_message(data: &serde_json::Value) -> Result<RobotMessage> {
    Ok(serde_json::from_value(data.clone())?)
}

/// Build the inbound envelope; media items are resolved through the
/// `messageFiles/download` API, downloaded, and archived. Returns `None`
/// for message kinds with no user content.
pub async fn build_envelope(
    state: &AccountState,
    tokens: &AppTokenSource,
    message: RobotMessage,
) -> Result<Option<NormalizedMessage>> {
    let is_group = message.conversation_type == "2";
    let chat_type = if is_group {
        ChatType::Group
    } else {
        ChatType::Direct
    };
    let was_mentioned =
        is_group && (message.is_in_at_list.unwrap_or(false) || !message.at_users.is_empty());
    let sender_id = message
        .sender_staff_id
        .clone()
        .or_else(|| message.sender_id.clone())
        .unwrap_or_default();
    let peer_id = if is_group {
        message.conversation_id.clone()
    } else {
        sender_id.clone()
    };

    let mut attachments: Vec<Attachment> = Vec::new();
    let body = match message.msgtype.as_str() {
        "text" => message
            .text
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default(),
        "richText" => {
            let mut parts: Vec<String> = Vec::new();
            if let Some(content) = &message.content {
                for item in &content.rich_text {
                    if let Some(text) = item.text.as_deref().map(str::trim)
                        && !text.is_empty()
                    {
                        parts.push(text.to_string());
                    }
                    if let Some(code) = &item.download_code {
                        parts.push(
                            fetch_media(state, tokens, &message, code, MediaKind::Image, None)
                                .await
                                .map(|(body, attachment)| {
                                    attachments.push(attachment);
                                    body
                                })
                                .unwrap_or_else(|_| "[image] (download failed)".into()),
                        );
                    }
                }
            }
            parts.join("\n")
        },
        "picture" => {
            let code = message.content.as_ref().and_then(|c| c.download_code.clone());
            media_part(state, tokens, &message, code, MediaKind::Image, None, &mut attachments)
                .await
        },
        "audio" => {
            let audio = message.audio.clone().unwrap_or_default();
            let recognition = audio
                .recognition
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string);
            let mut body = media_part(
                state,
                tokens,
                &message,
                audio.download_code.clone(),
                MediaKind::Voice,
                None,
                &mut attachments,
            )
            .await;
            if let Some(recognition) = &recognition {
                body.push_str(&format!("\n[recognition] {recognition}"));
                if let Some(last) = attachments.last_mut() {
                    last.transcript = Some(recognition.clone());
                }
            }
            body
        },
        "video" => {
            let code = message.video.as_ref().and_then(|v| v.download_code.clone());
            media_part(state, tokens, &message, code, MediaKind::Video, None, &mut attachments)
                .await
        },
        "file" => {
            let file = message.file.clone().unwrap_or_default();
            media_part(
                state,
                tokens,
                &message,
                file.download_code.clone(),
                MediaKind::File,
                file.file_name.clone(),
                &mut attachments,
            )
            .await
        },
        _ => return Ok(None),
    };

    // Empty messages still get an envelope for DMs and @-mentions; the
    // policy gate makes the admit/deny call. Unmentioned empty group
    // chatter is dropped here.
    if body.is_empty()
        && attachments.is_empty()
        && !gating::dispatch_when_empty(chat_type, was_mentioned)
    {
        return Ok(None);
    }

    let now_ms = now_ms();
    let message_id = message
        .msg_id
        .clone()
        .unwrap_or_else(|| InboundEnvelope::synthetic_message_id(&message.conversation_id, now_ms));

    Ok(Some(NormalizedMessage {
        envelope: InboundEnvelope {
            message_id,
            timestamp_ms: message.create_at.unwrap_or(now_ms),
            chat_type,
            sender_id,
            sender_name: message.sender_nick.clone(),
            peer_id,
            raw_body: body.clone(),
            body,
            attachments,
            was_mentioned,
            channel: CHANNEL_ID.to_string(),
            account_id: state.account_id.clone(),
            message_sid: message.msg_id.clone(),
        },
        session_webhook: message.session_webhook.clone(),
    }))
}

async fn media_part(
    state: &AccountState,
    tokens: &AppTokenSource,
    message: &RobotMessage,
    download_code: Option<String>,
    kind: MediaKind,
    filename: Option<String>,
    attachments: &mut Vec<Attachment>,
) -> String {
    let Some(code) = download_code else {
        return format!("[{}]", kind.body_label());
    };
    match fetch_media(state, tokens, message, &code, kind, filename).await {
        Ok((body, attachment)) => {
            attachments.push(attachment);
            body
        },
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "media fetch failed");
            format!("[{}] (download failed)", kind.body_label())
        },
    }
}

/// Resolve a download code to a URL, download, and archive.
async fn fetch_media(
    state: &AccountState,
    tokens: &AppTokenSource,
    message: &RobotMessage,
    download_code: &str,
    kind: MediaKind,
    filename: Option<String>,
) -> Result<(String, Attachment)> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct DownloadUrlResponse {
        download_url: String,
    }

    let token = tokens.access_token(&state.config).await?;
    let robot_code = message
        .robot_code
        .clone()
        .unwrap_or_else(|| state.config.client_id.clone());
    let response: DownloadUrlResponse = reqwest::Client::new()
        .post(format!("{}/v1.0/robot/messageFiles/download", tokens.base_url()))
        .timeout(std::time::Duration::from_secs(30))
        .header("x-acs-dingtalk-access-token", &token)
        .json(&serde_json::json!({
            "downloadCode": download_code,
            "robotCode": robot_code,
        }))
        .send()
        .await?
        .json()
        .await?;

    let prefix = match kind {
        MediaKind::Image => "img",
        MediaKind::Voice => "voice",
        MediaKind::Video => "video",
        MediaKind::File => "file",
    };
    let downloaded = state
        .media
        .download(DownloadRequest {
            url: &response.download_url,
            prefix,
            filename: filename.as_deref(),
            ..Default::default()
        })
        .await?;
    let archived = state.media.archive(&downloaded.path).await;
    let path = archived.display().to_string();

    Ok((
        format!("[{}] saved:{path}", kind.body_label()),
        Attachment {
            kind: Some(kind),
            source: download_code.to_string(),
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
