//! Reply and active-send paths.
//!
//! Replies prefer the callback's short-lived `sessionWebhook`; active
//! sends use the robot v1.0 APIs (`oToMessages/batchSend` for users,
//! `groupMessages/send` for open conversations). Images are uploaded
//! through the legacy oapi media endpoint first.

use std::{path::Path, sync::Arc};

use {
    async_trait::async_trait,
    serde::Deserialize,
    sinobridge_channels::{plugin::ChannelOutbound, text},
    sinobridge_common::types::{MediaKind, ReplyPayload},
    sinobridge_media::{mime, upload},
    tracing::{info, warn},
};

use crate::{
    CHANNEL_ID,
    error::{Error, Result},
    state::{AccountState, AccountStateMap, get_account},
    token::AppTokenSource,
};

pub struct DingTalkOutbound {
    pub(crate) accounts: AccountStateMap,
    pub(crate) tokens: Arc<AppTokenSource>,
    pub(crate) client: reqwest::Client,
    pub(crate) oapi_base: String,
}

#[derive(Debug, Deserialize)]
struct OapiResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    media_id: Option<String>,
}

/// Group open-conversation ids start with `cid`; everything else is
/// treated as a staff/user id.
#[must_use]
pub fn is_group_conversation(id: &str) -> bool {
    id.starts_with("cid")
}

impl DingTalkOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        get_account(&self.accounts, account_id)
            .ok_or_else(|| Error::message(format!("unknown account: {account_id}")))
    }

    fn chunks(&self, state: &AccountState, markdown_text: &str) -> Vec<String> {
        let limit = text::resolve_chunk_limit(CHANNEL_ID, state.config.text_chunk_limit);
        text::chunk_markdown_text(markdown_text, limit)
    }

    /// Send chunked markdown through a session webhook.
    pub async fn send_webhook_text(
        &self,
        state: &AccountState,
        webhook_url: &str,
        markdown_text: &str,
    ) -> Result<()> {
        let chunks = self.chunks(state, markdown_text);
        info!(
            account_id = state.account_id,
            chunk_count = chunks.len(),
            "dingtalk session-webhook send"
        );
        for chunk in &chunks {
            let title = chunk.lines().next().unwrap_or("reply");
            let body = serde_json::json!({
                "msgtype": "markdown",
                "markdown": { "title": title, "text": chunk }
            });
            let response: OapiResponse = self
                .client
                .post(webhook_url)
                .timeout(std::time::Duration::from_secs(30))
                .json(&body)
                .send()
                .await?
                .json()
                .await?;
            if response.errcode != 0 {
                return Err(Error::api(response.errcode.to_string(), response.errmsg));
            }
        }
        Ok(())
    }

    /// Build the active-send request for a user or an open conversation.
    fn active_message(
        state: &AccountState,
        to: &str,
        msg_key: &str,
        msg_param: String,
    ) -> (&'static str, serde_json::Value) {
        if is_group_conversation(to) {
            (
                "/v1.0/robot/groupMessages/send",
                serde_json::json!({
                    "robotCode": state.config.client_id,
                    "openConversationId": to,
                    "msgKey": msg_key,
                    "msgParam": msg_param,
                }),
            )
        } else {
            (
                "/v1.0/robot/oToMessages/batchSend",
                serde_json::json!({
                    "robotCode": state.config.client_id,
                    "userIds": [to],
                    "msgKey": msg_key,
                    "msgParam": msg_param,
                }),
            )
        }
    }

    /// POST one robot API request, refreshing the token and retrying once
    /// when the platform rejects it.
    async fn post_robot_api(
        &self,
        state: &AccountState,
        path: &'static str,
        body: serde_json::Value,
    ) -> Result<()> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let client = self.client.clone();
                let url = format!("{}{path}", self.tokens.base_url());
                let body = body.clone();
                async move {
                    let response = client
                        .post(&url)
                        .timeout(std::time::Duration::from_secs(30))
                        .header("x-acs-dingtalk-access-token", token)
                        .json(&body)
                        .send()
                        .await?;
                    if !response.status().is_success() {
                        let status = response.status().as_u16().to_string();
                        let text = response.text().await.unwrap_or_default();
                        return Err(Error::api(status, text));
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Active send to a user or an open conversation.
    pub async fn send_active_text(
        &self,
        state: &AccountState,
        to: &str,
        markdown_text: &str,
    ) -> Result<()> {
        let chunks = self.chunks(state, markdown_text);
        info!(
            account_id = state.account_id,
            to,
            chunk_count = chunks.len(),
            "dingtalk active send"
        );
        for chunk in &chunks {
            let msg_param = serde_json::json!({
                "title": chunk.lines().next().unwrap_or("reply"),
                "text": chunk,
            })
            .to_string();
            let (path, body) = Self::active_message(state, to, "sampleMarkdown", msg_param);
            self.post_robot_api(state, path, body).await?;
        }
        Ok(())
    }

    /// Upload a local image to the legacy media endpoint.
    async fn upload_image(&self, state: &AccountState, path: &Path) -> Result<String> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let url = format!(
                    "{}/media/upload?access_token={}&type=image",
                    self.oapi_base, token
                );
                async move {
                    let value = state
                        .media
                        .upload(upload::UploadRequest {
                            url: &url,
                            field: "media",
                            path,
                            filename: None,
                            extra_fields: &[],
                            bearer: None,
                        })
                        .await?;
                    let response: OapiResponse = serde_json::from_value(value)?;
                    if response.errcode != 0 {
                        return Err(Error::api(response.errcode.to_string(), response.errmsg));
                    }
                    response
                        .media_id
                        .ok_or_else(|| Error::message("media upload returned no media_id"))
                }
            })
            .await
    }

    async fn send_image(&self, state: &AccountState, to: &str, photo_url: &str) -> Result<()> {
        let msg_param = serde_json::json!({ "photoURL": photo_url }).to_string();
        let (path, body) = Self::active_message(state, to, "sampleImageMsg", msg_param);
        self.post_robot_api(state, path, body).await
    }

    async fn send_media_inner(
        &self,
        state: &AccountState,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<()> {
        let media = payload
            .media
            .as_ref()
            .ok_or_else(|| Error::message("payload has no media"))?;
        let filename = media
            .filename
            .clone()
            .or_else(|| media.url.rsplit('/').next().map(str::to_string))
            .unwrap_or_else(|| "file.bin".to_string());
        let kind = mime::classify(&filename, Some(&media.mime_type), false);

        if !payload.text.is_empty() {
            self.send_active_text(state, to, &payload.text).await?;
        }

        match kind {
            MediaKind::Image => {
                if media.url.starts_with("http://") || media.url.starts_with("https://") {
                    self.send_image(state, to, &media.url).await
                } else {
                    let media_id = self.upload_image(state, Path::new(&media.url)).await?;
                    self.send_image(state, to, &media_id).await
                }
            },
            // Voice, video, and file payloads go out as links; the robot
            // message kinds for those need a different app surface.
            _ => {
                self.send_active_text(state, to, &format!("📎 {}", media.url)).await
            },
        }
    }
}

#[async_trait]
impl ChannelOutbound for DingTalkOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> anyhow::Result<()> {
        let state = self.account(account_id)?;
        self.send_active_text(&state, to, text).await?;
        Ok(())
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> anyhow::Result<()> {
        let state = self.account(account_id)?;
        match self.send_media_inner(&state, to, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let url = payload
                    .media
                    .as_ref()
                    .map(|m| m.url.clone())
                    .unwrap_or_default();
                warn!(account_id, to, error = %e, "media send failed, falling back to link");
                self.send_active_text(&state, to, &format!("📎 {url}")).await?;
                Ok(())
            },
        }
    }
}
