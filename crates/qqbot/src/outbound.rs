//! v2 C2C/group message sending with rich-media upload and the file
//! fallback.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::Deserialize,
    sinobridge_channels::{markdown, plugin::ChannelOutbound, text},
    sinobridge_common::types::{MediaKind, ReplyPayload},
    sinobridge_media::mime,
    tracing::{info, warn},
};

use crate::{
    CHANNEL_ID,
    error::{Error, Result},
    state::{AccountState, AccountStateMap, get_account},
    token::AppTokenSource,
};

/// Rich-media `file_type` values.
const FILE_TYPE_IMAGE: u8 = 1;
const FILE_TYPE_VIDEO: u8 = 2;
const FILE_TYPE_VOICE: u8 = 3;
/// Arbitrary files: declared but rejected by the platform.
const FILE_TYPE_FILE: u8 = 4;

pub struct QqBotOutbound {
    pub(crate) accounts: AccountStateMap,
    pub(crate) tokens: Arc<AppTokenSource>,
    pub(crate) client: reqwest::Client,
    pub(crate) api_base: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RichMediaResponse {
    #[serde(default)]
    file_info: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Whether `to` names a group (`group:`-resolved ids come through bare, so
/// the caller passes the chat kind explicitly where it knows it).
fn message_path(to: &str, is_group: bool) -> String {
    if is_group {
        format!("/v2/groups/{to}/messages")
    } else {
        format!("/v2/users/{to}/messages")
    }
}

fn media_path(to: &str, is_group: bool) -> String {
    if is_group {
        format!("/v2/groups/{to}/files")
    } else {
        format!("/v2/users/{to}/files")
    }
}

impl QqBotOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        get_account(&self.accounts, account_id)
            .ok_or_else(|| Error::message(format!("unknown account: {account_id}")))
    }

    /// POST one v2 API request with the app token, refreshing and
    /// retrying once when the platform rejects it.
    async fn post_api(
        &self,
        state: &AccountState,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let client = self.client.clone();
                let url = format!("{}{path}", self.api_base);
                let body = body.clone();
                async move {
                    let response = client
                        .post(&url)
                        .timeout(std::time::Duration::from_secs(30))
                        .header("Authorization", format!("QQBot {token}"))
                        .json(&body)
                        .send()
                        .await?;
                    let status = response.status();
                    let value: serde_json::Value = response.json().await.unwrap_or_default();
                    if !status.is_success() {
                        let api_error: ApiError =
                            serde_json::from_value(value.clone()).unwrap_or(ApiError {
                                code: i64::from(status.as_u16()),
                                message: String::new(),
                            });
                        return Err(Error::api(
                            if api_error.code != 0 {
                                api_error.code
                            } else {
                                i64::from(status.as_u16())
                            },
                            api_error.message,
                        ));
                    }
                    if let Some(code) = value.get("code").and_then(serde_json::Value::as_i64)
                        && code != 0
                    {
                        let message = value
                            .get("message")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("");
                        return Err(Error::api(code, message));
                    }
                    Ok(value)
                }
            })
            .await
    }

    /// Chunked text send. `reply_to` makes the messages passive replies
    /// (required within the platform's reply window, and free of the
    /// active-message quota).
    pub(crate) async fn send_text_chunks(
        &self,
        state: &AccountState,
        to: &str,
        is_group: bool,
        markdown_text: &str,
        reply_to: Option<&str>,
    ) -> Result<()> {
        let content = if state.config.markdown_support {
            markdown_text.to_string()
        } else {
            markdown::strip_markdown(markdown_text)
        };
        if content.is_empty() {
            return Ok(());
        }
        let limit = text::resolve_chunk_limit(CHANNEL_ID, state.config.text_chunk_limit);
        let chunks = text::chunk_text(&content, limit);
        info!(
            account_id = state.account_id,
            to,
            chunk_count = chunks.len(),
            passive = reply_to.is_some(),
            "qq outbound text send"
        );
        for chunk in &chunks {
            let mut body = serde_json::json!({
                "content": chunk,
                "msg_type": 0,
            });
            if let Some(msg_id) = reply_to {
                body["msg_id"] = serde_json::json!(msg_id);
                body["msg_seq"] = serde_json::json!(state.next_msg_seq(msg_id));
            }
            self.post_api(state, &message_path(to, is_group), body).await?;
        }
        Ok(())
    }

    /// Two-step rich media send: register the URL for the peer, then send
    /// a media message with the returned `file_info`.
    async fn send_rich_media(
        &self,
        state: &AccountState,
        to: &str,
        is_group: bool,
        file_type: u8,
        url: &str,
        reply_to: Option<&str>,
    ) -> Result<()> {
        let upload = self
            .post_api(
                state,
                &media_path(to, is_group),
                serde_json::json!({
                    "file_type": file_type,
                    "url": url,
                    "srv_send_msg": false,
                }),
            )
            .await?;
        let upload: RichMediaResponse = serde_json::from_value(upload)?;
        if let Some(code) = upload.code.filter(|c| *c != 0) {
            return Err(Error::api(code, upload.message.unwrap_or_default()));
        }
        let file_info = upload
            .file_info
            .ok_or_else(|| Error::message("rich media response carries no file_info"))?;

        let mut body = serde_json::json!({
            "content": " ",
            "msg_type": 7,
            "media": { "file_info": file_info },
        });
        if let Some(msg_id) = reply_to {
            body["msg_id"] = serde_json::json!(msg_id);
            body["msg_seq"] = serde_json::json!(state.next_msg_seq(msg_id));
        }
        self.post_api(state, &message_path(to, is_group), body).await?;
        Ok(())
    }

    pub(crate) async fn send_media_to(
        &self,
        state: &AccountState,
        to: &str,
        is_group: bool,
        payload: &ReplyPayload,
        reply_to: Option<&str>,
    ) -> Result<()> {
        let media = payload
            .media
            .as_ref()
            .ok_or_else(|| Error::message("payload has no media"))?;
        if !media.url.starts_with("http://") && !media.url.starts_with("https://") {
            // The rich-media API only takes URLs the platform can fetch.
            return Err(Error::message("qq media sends need a public URL"));
        }
        if !payload.text.is_empty() {
            self.send_text_chunks(state, to, is_group, &payload.text, reply_to)
                .await?;
        }

        let filename = media
            .filename
            .clone()
            .or_else(|| media.url.rsplit('/').next().map(str::to_string))
            .unwrap_or_default();
        let file_type = match mime::classify(&filename, Some(&media.mime_type), false) {
            MediaKind::Image => FILE_TYPE_IMAGE,
            MediaKind::Video => FILE_TYPE_VIDEO,
            MediaKind::Voice => FILE_TYPE_VOICE,
            MediaKind::File => FILE_TYPE_FILE,
        };

        match self
            .send_rich_media(state, to, is_group, file_type, &media.url, reply_to)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_file_unsupported() || file_type == FILE_TYPE_FILE => {
                // Official limitation: C2C/group chats cannot receive
                // files. Explain and hand over the link.
                warn!(account_id = state.account_id, error = %e, "file send unsupported, degrading");
                self.send_text_chunks(
                    state,
                    to,
                    is_group,
                    &format!("说明：QQ 官方暂不支持机器人发送文件，已为你附上文件链接：{}", media.url),
                    reply_to,
                )
                .await
            },
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChannelOutbound for QqBotOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> anyhow::Result<()> {
        let state = self.account(account_id)?;
        let (to, is_group) = split_target(to);
        self.send_text_chunks(&state, to, is_group, text, None).await?;
        Ok(())
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> anyhow::Result<()> {
        let state = self.account(account_id)?;
        let (to, is_group) = split_target(to);
        match self.send_media_to(&state, to, is_group, payload, None).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let url = payload
                    .media
                    .as_ref()
                    .map(|m| m.url.clone())
                    .unwrap_or_default();
                warn!(account_id, to, error = %e, "media send failed, falling back to link");
                self.send_text_chunks(&state, to, is_group, &format!("📎 {url}"), None)
                    .await?;
                Ok(())
            },
        }
    }
}

/// Host-initiated targets keep the `group:`/`user:` prefix through the
/// directory; bare ids default to C2C.
fn split_target(to: &str) -> (&str, bool) {
    if let Some(group) = to.strip_prefix("group:") {
        (group, true)
    } else {
        (to.strip_prefix("user:").unwrap_or(to), false)
    }
}
