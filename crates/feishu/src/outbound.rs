//! IM v1 message sending: markdown cards or plain text, plus image and
//! file uploads.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    serde::Deserialize,
    sinobridge_channels::{markdown, plugin::ChannelOutbound, text},
    sinobridge_common::types::{MediaKind, ReplyPayload},
    sinobridge_media::{DownloadRequest, mime, upload},
    tracing::{info, warn},
};

use crate::{
    CHANNEL_ID,
    error::{Error, Result},
    state::{AccountState, AccountStateMap, get_account},
    token::TenantTokenSource,
};

pub struct FeishuOutbound {
    pub(crate) accounts: AccountStateMap,
    pub(crate) tokens: Arc<TenantTokenSource>,
    pub(crate) client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// The receive-id kind is encoded in the id's prefix.
#[must_use]
pub fn receive_id_type(to: &str) -> &'static str {
    if to.starts_with("ou_") {
        "open_id"
    } else if to.starts_with("on_") {
        "union_id"
    } else {
        "chat_id"
    }
}

impl FeishuOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        get_account(&self.accounts, account_id)
            .ok_or_else(|| Error::message(format!("unknown account: {account_id}")))
    }

    async fn post_message(
        &self,
        state: &AccountState,
        to: &str,
        msg_type: &str,
        content: &serde_json::Value,
    ) -> Result<()> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let client = self.client.clone();
                let url = format!(
                    "{}/open-apis/im/v1/messages?receive_id_type={}",
                    self.tokens.base_url(),
                    receive_id_type(to)
                );
                let body = serde_json::json!({
                    "receive_id": to,
                    "msg_type": msg_type,
                    "content": content.to_string(),
                });
                async move {
                    let response: ApiResponse = client
                        .post(&url)
                        .timeout(std::time::Duration::from_secs(30))
                        .header("Authorization", format!("Bearer {token}"))
                        .json(&body)
                        .send()
                        .await?
                        .json()
                        .await?;
                    if response.code != 0 {
                        return Err(Error::api(response.code, response.msg));
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Chunked text send. Card mode wraps each chunk in a markdown card so
    /// formatting survives; plain mode degrades the markdown.
    pub(crate) async fn send_text_chunks(
        &self,
        state: &AccountState,
        to: &str,
        markdown_text: &str,
    ) -> Result<()> {
        let limit = text::resolve_chunk_limit(CHANNEL_ID, state.config.text_chunk_limit);
        let chunks = text::chunk_markdown_text(markdown_text, limit);
        info!(
            account_id = state.account_id,
            to,
            chunk_count = chunks.len(),
            "feishu outbound text send"
        );
        for chunk in &chunks {
            if state.config.send_markdown_as_card {
                let card = serde_json::json!({
                    "elements": [{ "tag": "markdown", "content": chunk }]
                });
                self.post_message(state, to, "interactive", &card).await?;
            } else {
                let plain = markdown::strip_markdown(chunk);
                self.post_message(state, to, "text", &serde_json::json!({ "text": plain }))
                    .await?;
            }
        }
        Ok(())
    }

    async fn materialize(&self, state: &AccountState, payload: &ReplyPayload) -> Result<PathBuf> {
        let media = payload
            .media
            .as_ref()
            .ok_or_else(|| Error::message("payload has no media"))?;
        if media.url.starts_with("http://") || media.url.starts_with("https://") {
            let downloaded = state
                .media
                .download(DownloadRequest {
                    url: &media.url,
                    prefix: "out",
                    filename: media.filename.as_deref(),
                    declared_mime: Some(&media.mime_type),
                })
                .await?;
            Ok(downloaded.path)
        } else {
            let path = PathBuf::from(&media.url);
            if !path.exists() {
                return Err(Error::message(format!("no such file: {}", media.url)));
            }
            Ok(path)
        }
    }

    async fn upload_image(&self, state: &AccountState, path: &std::path::Path) -> Result<String> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let url = format!("{}/open-apis/im/v1/images", self.tokens.base_url());
                async move {
                    let value = state
                        .media
                        .upload(upload::UploadRequest {
                            url: &url,
                            field: "image",
                            path,
                            filename: None,
                            extra_fields: &[("image_type", "message")],
                            bearer: Some(&token),
                        })
                        .await?;
                    let response: ApiResponse = serde_json::from_value(value)?;
                    if response.code != 0 {
                        return Err(Error::api(response.code, response.msg));
                    }
                    response
                        .data
                        .get("image_key")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| Error::message("image upload returned no image_key"))
                }
            })
            .await
    }

    async fn upload_file(
        &self,
        state: &AccountState,
        path: &std::path::Path,
        filename: &str,
    ) -> Result<String> {
        let file_type = match mime::extension_of(filename).map(str::to_ascii_lowercase).as_deref() {
            Some("mp4") => "mp4",
            Some("pdf") => "pdf",
            Some("doc" | "docx") => "doc",
            Some("xls" | "xlsx") => "xls",
            Some("ppt" | "pptx") => "ppt",
            Some("opus") => "opus",
            _ => "stream",
        };
        self.tokens
            .with_token_retry(&state.config, |token| {
                let url = format!("{}/open-apis/im/v1/files", self.tokens.base_url());
                async move {
                    let value = state
                        .media
                        .upload(upload::UploadRequest {
                            url: &url,
                            field: "file",
                            path,
                            filename: Some(filename),
                            extra_fields: &[("file_type", file_type), ("file_name", filename)],
                            bearer: Some(&token),
                        })
                        .await?;
                    let response: ApiResponse = serde_json::from_value(value)?;
                    if response.code != 0 {
                        return Err(Error::api(response.code, response.msg));
                    }
                    response
                        .data
                        .get("file_key")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| Error::message("file upload returned no file_key"))
                }
            })
            .await
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
        if !payload.text.is_empty() {
            self.send_text_chunks(state, to, &payload.text).await?;
        }

        let path = self.materialize(state, payload).await?;
        let filename = media
            .filename
            .clone()
            .or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "file.bin".to_string());

        match mime::classify(&filename, Some(&media.mime_type), false) {
            MediaKind::Image => {
                let image_key = self.upload_image(state, &path).await?;
                self.post_message(state, to, "image", &serde_json::json!({"image_key": image_key}))
                    .await
            },
            _ => {
                let file_key = self.upload_file(state, &path, &filename).await?;
                self.post_message(state, to, "file", &serde_json::json!({"file_key": file_key}))
                    .await
            },
        }
    }
}

#[async_trait]
impl ChannelOutbound for FeishuOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> anyhow::Result<()> {
        let state = self.account(account_id)?;
        self.send_text_chunks(&state, to, text).await?;
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
                self.send_text_chunks(&state, to, &format!("📎 {url}")).await?;
                Ok(())
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::config::FeishuConfig,
        secrecy::SecretBox,
        sinobridge_media::{MediaConfig, MediaService},
        std::collections::HashMap,
        tokio_util::sync::CancellationToken,
    };

    fn outbound(server_url: &str, card_mode: bool) -> (tempfile::TempDir, FeishuOutbound) {
        let tmp = tempfile::tempdir().unwrap();
        let state = AccountState {
            account_id: "default".into(),
            config: FeishuConfig {
                app_id: "cli_1".into(),
                app_secret: SecretBox::new(Box::new("s".into())),
                send_markdown_as_card: card_mode,
                ..Default::default()
            },
            media: Arc::new(MediaService::new(MediaConfig::new(
                tmp.path().join("tmp"),
                tmp.path().join("media"),
            ))),
            cancel: CancellationToken::new(),
            seen: std::sync::Mutex::new(std::collections::VecDeque::new()),
        };
        let accounts: AccountStateMap = Arc::new(std::sync::RwLock::new(HashMap::new()));
        accounts
            .write()
            .unwrap()
            .insert("default".into(), Arc::new(state));
        let outbound = FeishuOutbound {
            accounts,
            tokens: Arc::new(TenantTokenSource::new().with_base_url(server_url.to_string())),
            client: reqwest::Client::new(),
        };
        (tmp, outbound)
    }

    fn mock_token(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"TT","expire":7200}"#)
            .create()
    }

    #[test]
    fn receive_id_types() {
        assert_eq!(receive_id_type("oc_abc"), "chat_id");
        assert_eq!(receive_id_type("ou_abc"), "open_id");
        assert_eq!(receive_id_type("on_abc"), "union_id");
        assert_eq!(receive_id_type("weird"), "chat_id");
    }

    #[tokio::test]
    async fn card_mode_sends_interactive_markdown() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        let send = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_query(mockito::Matcher::UrlEncoded(
                "receive_id_type".into(),
                "chat_id".into(),
            ))
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "receive_id": "oc_room",
                "msg_type": "interactive",
            })))
            .with_body(r#"{"code":0,"msg":"ok","data":{"message_id":"om_1"}}"#)
            .expect(1)
            .create_async()
            .await;

        let (_tmp, outbound) = outbound(&server.url(), true);
        outbound
            .send_text("default", "oc_room", "**hello**")
            .await
            .unwrap();
        send.assert_async().await;
    }

    #[tokio::test]
    async fn plain_mode_degrades_markdown() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        let send = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::Regex(r#"\\"text\\":\\"hello\\""#.into()))
            .with_body(r#"{"code":0,"msg":"ok","data":{}}"#)
            .expect(1)
            .create_async()
            .await;

        let (_tmp, outbound) = outbound(&server.url(), false);
        outbound
            .send_text("default", "ou_bob", "**hello**")
            .await
            .unwrap();
        send.assert_async().await;
    }

    #[tokio::test]
    async fn local_image_uploads_then_sends_image_key() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        let upload = server
            .mock("POST", "/open-apis/im/v1/images")
            .with_body(r#"{"code":0,"msg":"ok","data":{"image_key":"img_k1"}}"#)
            .expect(1)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_body(mockito::Matcher::Regex("img_k1".into()))
            .with_body(r#"{"code":0,"msg":"ok","data":{}}"#)
            .expect(1)
            .create_async()
            .await;

        let (tmp, outbound) = outbound(&server.url(), true);
        let png = tmp.path().join("shot.png");
        tokio::fs::write(&png, b"\x89PNG").await.unwrap();

        outbound
            .send_media(
                "default",
                "oc_room",
                &ReplyPayload {
                    text: String::new(),
                    media: Some(sinobridge_common::types::MediaPayload {
                        url: png.display().to_string(),
                        mime_type: "image/png".into(),
                        filename: None,
                    }),
                },
            )
            .await
            .unwrap();
        upload.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn failed_upload_falls_back_to_link() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        let _upload = server
            .mock("POST", "/open-apis/im/v1/images")
            .with_body(r#"{"code":234001,"msg":"image too large"}"#)
            .create_async()
            .await;
        let fallback = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_body(mockito::Matcher::Regex("📎".into()))
            .with_body(r#"{"code":0,"msg":"ok","data":{}}"#)
            .expect(1)
            .create_async()
            .await;

        let (tmp, outbound) = outbound(&server.url(), true);
        let png = tmp.path().join("big.png");
        tokio::fs::write(&png, b"\x89PNG").await.unwrap();

        outbound
            .send_media(
                "default",
                "oc_room",
                &ReplyPayload {
                    text: String::new(),
                    media: Some(sinobridge_common::types::MediaPayload {
                        url: png.display().to_string(),
                        mime_type: "image/png".into(),
                        filename: None,
                    }),
                },
            )
            .await
            .unwrap();
        fallback.assert_async().await;
    }
}
