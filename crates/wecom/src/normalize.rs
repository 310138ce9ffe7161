//! Decrypted robot-callback parsing.
//!
//! Robot callbacks are JSON. Text, image, and mixed messages become
//! envelopes; `stream` refreshes and events are ignored.

use {
    serde::Deserialize,
    sinobridge_channels::gating,
    sinobridge_common::types::{Attachment, ChatType, InboundEnvelope, MediaKind},
    sinobridge_media::DownloadRequest,
    tracing::warn,
};

use crate::{CHANNEL_ID, error::Result, state::AccountState};

#[derive(Debug, Clone, Deserialize)]
pub struct RobotCallback {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub msgid: Option<String>,
    #[serde(default)]
    pub chatid: Option<String>,
    /// `single` or `group`.
    #[serde(default)]
    pub chattype: Option<String>,
    #[serde(default)]
    pub from: Option<RobotSender>,
    #[serde(default)]
    pub text: Option<RobotText>,
    #[serde(default)]
    pub image: Option<RobotImage>,
    #[serde(default)]
    pub mixed: Option<RobotMixed>,
    /// Short-lived URL for out-of-band replies to this message.
    #[serde(default)]
    pub response_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotSender {
    #[serde(default)]
    pub userid: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotText {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotImage {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotMixed {
    #[serde(default)]
    pub msg_item: Vec<RobotMixedItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotMixedItem {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub text: Option<RobotText>,
    #[serde(default)]
    pub image: Option<RobotImage>,
}

pub fn parse_callback(json: &str) -> Result<RobotCallback> {
    Ok(serde_json::from_str(json)?)
}

/// Build the inbound envelope. Returns `None` for message kinds the robot
/// ignores (events, stream refreshes, unsupported types).
pub async fn build_envelope(
    state: &AccountState,
    callback: &RobotCallback,
) -> Result<Option<InboundEnvelope>> {
    let sender_id = callback
        .from
        .as_ref()
        .map(|f| f.userid.clone())
        .unwrap_or_default();
    let is_group = callback.chattype.as_deref() == Some("group");
    let chat_type = if is_group {
        ChatType::Group
    } else {
        ChatType::Direct
    };
    let peer_id = if is_group {
        callback.chatid.clone().unwrap_or_else(|| sender_id.clone())
    } else {
        sender_id.clone()
    };

    // Group callbacks only arrive when the robot was @-mentioned.
    let was_mentioned = is_group;

    let mut attachments: Vec<Attachment> = Vec::new();
    let body = match callback.msgtype.as_str() {
        "text" => callback
            .text
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default(),
        "image" => {
            let Some(image) = &callback.image else {
                return Ok(None);
            };
            image_body(state, &image.url, &mut attachments).await
        },
        "mixed" => {
            let Some(mixed) = &callback.mixed else {
                return Ok(None);
            };
            let mut parts: Vec<String> = Vec::new();
            for item in &mixed.msg_item {
                match item.msgtype.as_str() {
                    "text" => {
                        if let Some(text) = &item.text
                            && !text.content.trim().is_empty()
                        {
                            parts.push(text.content.trim().to_string());
                        }
                    },
                    "image" => {
                        if let Some(image) = &item.image {
                            parts.push(image_body(state, &image.url, &mut attachments).await);
                        }
                    },
                    _ => {},
                }
            }
            parts.join("\n")
        },
        // Stream refreshes and events carry no new user content.
        "stream" | "event" => return Ok(None),
        _ => return Ok(None),
    };

    // Empty messages still get an envelope when a mention or a direct
    // chat says the user addressed the bot; the gate decides from there.
    if body.is_empty()
        && attachments.is_empty()
        && !gating::dispatch_when_empty(chat_type, was_mentioned)
    {
        return Ok(None);
    }

    let now_ms = now_ms();
    let message_id = callback
        .msgid
        .clone()
        .unwrap_or_else(|| InboundEnvelope::synthetic_message_id(&peer_id, now_ms));

    Ok(Some(InboundEnvelope {
        message_id,
        timestamp_ms: now_ms,
        chat_type,
        sender_id,
        sender_name: callback.from.as_ref().and_then(|f| f.name.clone()),
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned,
        channel: CHANNEL_ID.to_string(),
        account_id: state.account_id.clone(),
        message_sid: callback.msgid.clone(),
    }))
}

/// Robot media URLs serve AES-encrypted bodies; decrypt with the callback
/// key before archiving.
async fn image_body(state: &AccountState, url: &str, attachments: &mut Vec<Attachment>) -> String {
    let aes_key = state.aes_key.clone();
    let downloaded = state
        .media
        .download_with(
            DownloadRequest {
                url,
                prefix: "img",
                filename: Some("image.jpg"),
                declared_mime: Some("image/jpeg"),
            },
            Some(move |body: Vec<u8>| {
                sinobridge_wecom_crypto::decrypt_media(&body, &aes_key)
                    .map_err(|e| sinobridge_media::Error::external("media decrypt", e))
            }),
        )
        .await;
    match downloaded {
        Ok(file) => {
            let archived = state.media.archive(&file.path).await;
            let path = archived.display().to_string();
            attachments.push(Attachment {
                kind: Some(MediaKind::Image),
                source: url.to_string(),
                saved_path: Some(path.clone()),
                transcript: None,
            });
            format!("[image] saved:{path}")
        },
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "robot image fetch failed");
            "[image] (download failed)".to_string()
        },
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
