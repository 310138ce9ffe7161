//! Active send over the corp `message/send` API.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    serde::Deserialize,
    sinobridge_channels::{markdown, plugin::ChannelOutbound, text},
    sinobridge_common::types::{MediaKind, ReplyPayload},
    sinobridge_media::{DownloadRequest, mime, transcode, upload},
    tracing::{debug, info, warn},
};

use crate::{
    CHANNEL_ID,
    error::{Error, Result},
    state::{AccountState, AccountStateMap, get_account},
    token::CorpTokenSource,
};

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Outbound message sender for the self-built app.
pub struct WeComAppOutbound {
    pub(crate) accounts: AccountStateMap,
    pub(crate) tokens: Arc<CorpTokenSource>,
    pub(crate) client: reqwest::Client,
}

impl WeComAppOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        get_account(&self.accounts, account_id)
            .ok_or_else(|| Error::message(format!("unknown account: {account_id}")))
    }

    /// Degrade markdown to plain text, chunk to the platform limit, and
    /// send each chunk in order.
    pub(crate) async fn send_text_chunks(
        &self,
        state: &AccountState,
        to: &str,
        markdown_text: &str,
    ) -> Result<()> {
        let plain = markdown::strip_markdown(markdown_text);
        if plain.is_empty() {
            return Ok(());
        }
        let limit = text::resolve_chunk_limit(CHANNEL_ID, state.config.text_chunk_limit);
        let chunks = text::chunk_text(&plain, limit);
        info!(
            account_id = state.account_id,
            to,
            chunk_count = chunks.len(),
            "wecom-app outbound text send"
        );
        for chunk in &chunks {
            let body = serde_json::json!({
                "touser": to,
                "msgtype": "text",
                "agentid": state.config.agent_id,
                "text": { "content": chunk },
                "safe": 0
            });
            self.send_message(state, body).await?;
        }
        Ok(())
    }

    async fn send_media_message(
        &self,
        state: &AccountState,
        to: &str,
        msgtype: &str,
        media_id: &str,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "touser": to,
            "msgtype": msgtype,
            "agentid": state.config.agent_id,
            "safe": 0
        });
        body[msgtype] = serde_json::json!({ "media_id": media_id });
        self.send_message(state, body).await
    }

    async fn send_message(&self, state: &AccountState, body: serde_json::Value) -> Result<()> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let client = self.client.clone();
                let url = format!(
                    "{}/message/send?access_token={}",
                    self.tokens.base_url(),
                    urlencoding::encode(&token)
                );
                let body = body.clone();
                async move {
                    let response: SendResponse = client
                        .post(&url)
                        .timeout(std::time::Duration::from_secs(30))
                        .json(&body)
                        .send()
                        .await?
                        .json()
                        .await?;
                    if response.errcode != 0 {
                        return Err(Error::api(response.errcode, response.errmsg));
                    }
                    Ok(())
                }
            })
            .await
    }

    async fn upload_media(
        &self,
        state: &AccountState,
        upload_type: &str,
        path: &std::path::Path,
    ) -> Result<String> {
        self.tokens
            .with_token_retry(&state.config, |token| {
                let url = format!(
                    "{}/media/upload?access_token={}&type={}",
                    self.tokens.base_url(),
                    urlencoding::encode(&token),
                    upload_type
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
                    // Surface the platform code so token rejections retry.
                    if let Some(code) = value.get("errcode").and_then(serde_json::Value::as_i64)
                        && code != 0
                    {
                        let msg = value
                            .get("errmsg")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("");
                        return Err(Error::api(code, msg));
                    }
                    Ok(upload::media_id_from_response(&value)?)
                }
            })
            .await
    }

    /// Resolve the payload source to a local file, downloading remote URLs
    /// into the temp root first. Returns the path and whether it is a temp
    /// file this call owns.
    async fn materialize(
        &self,
        state: &AccountState,
        payload: &ReplyPayload,
    ) -> Result<(PathBuf, bool)> {
        let source = payload
            .media
            .as_ref()
            .map(|m| m.url.as_str())
            .ok_or_else(|| Error::message("payload has no media"))?;
        if source.starts_with("http://") || source.starts_with("https://") {
            let filename = payload.media.as_ref().and_then(|m| m.filename.as_deref());
            let downloaded = state
                .media
                .download(DownloadRequest {
                    url: source,
                    prefix: "out",
                    filename,
                    declared_mime: payload.media.as_ref().map(|m| m.mime_type.as_str()),
                })
                .await?;
            Ok((downloaded.path, true))
        } else {
            let path = PathBuf::from(source);
            if !path.exists() {
                return Err(Error::message(format!("no such file: {source}")));
            }
            Ok((path, false))
        }
    }

    async fn send_media_inner(
        &self,
        state: &AccountState,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<()> {
        let (path, temp_owned) = self.materialize(state, payload).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file.bin")
            .to_string();

        let transcode_on =
            state.config.voice_transcode.enabled && transcode::ffmpeg_available();
        // Remote sources are never transcoded; they go out as files.
        let local_source = !temp_owned;
        let kind = mime::classify(
            &filename,
            payload.media.as_ref().map(|m| m.mime_type.as_str()),
            transcode_on && local_source,
        );

        let result = match kind {
            MediaKind::Image => {
                let media_id = self.upload_media(state, "image", &path).await?;
                self.send_media_message(state, to, "image", &media_id).await
            },
            MediaKind::Voice => {
                if transcode::needs_transcode(&path) {
                    let amr = transcode::to_amr(&path).await?;
                    let media_id = self.upload_media(state, "voice", &amr).await;
                    if let Err(e) = tokio::fs::remove_file(&amr).await {
                        debug!(path = %amr.display(), error = %e, "amr cleanup failed");
                    }
                    let media_id = media_id?;
                    self.send_media_message(state, to, "voice", &media_id).await
                } else {
                    let media_id = self.upload_media(state, "voice", &path).await?;
                    self.send_media_message(state, to, "voice", &media_id).await
                }
            },
            MediaKind::Video | MediaKind::File => {
                // The client rarely shows a real file name, so the caption
                // goes out first as its own text message.
                if !payload.text.is_empty() {
                    self.send_text_chunks(state, to, &payload.text).await?;
                }
                let media_id = self.upload_media(state, "file", &path).await?;
                self.send_media_message(state, to, "file", &media_id).await
            },
        };

        if temp_owned && let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "temp cleanup failed");
        }
        result
    }
}

#[async_trait]
impl ChannelOutbound for WeComAppOutbound {
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
                // Any media failure degrades to a link so the user still
                // gets something.
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
        crate::config::WeComAppConfig,
        secrecy::SecretBox,
        sinobridge_channels::webhook::RouteHandle,
        sinobridge_media::{MediaConfig, MediaService},
        sinobridge_wecom_crypto::AesKey,
        std::collections::HashMap,
        tokio_util::sync::CancellationToken,
    };

    fn valid_aes_key() -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .encode([9u8; 32])
            .trim_end_matches('=')
            .to_string()
    }

    fn outbound_with_server(server_url: &str) -> (tempfile::TempDir, WeComAppOutbound) {
        let tmp = tempfile::tempdir().unwrap();
        let media = MediaService::new(MediaConfig::new(
            tmp.path().join("tmp"),
            tmp.path().join("media"),
        ));
        let config = WeComAppConfig {
            corp_id: "wx1".into(),
            corp_secret: SecretBox::new(Box::new("s".into())),
            agent_id: 1000002,
            token: "cb".into(),
            encoding_aes_key: valid_aes_key(),
            ..Default::default()
        };
        let state = AccountState {
            account_id: "default".into(),
            aes_key: AesKey::decode(&config.encoding_aes_key).unwrap(),
            config,
            media: Arc::new(media),
            cancel: CancellationToken::new(),
            routes: Vec::<RouteHandle>::new(),
        };
        let accounts: AccountStateMap = Arc::new(std::sync::RwLock::new(HashMap::new()));
        accounts
            .write()
            .unwrap()
            .insert("default".into(), Arc::new(state));
        let outbound = WeComAppOutbound {
            accounts,
            tokens: Arc::new(CorpTokenSource::new().with_base_url(server_url.to_string())),
            client: reqwest::Client::new(),
        };
        (tmp, outbound)
    }

    fn mock_token(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("GET", "/gettoken")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"TOK","expires_in":7200}"#)
            .create()
    }

    #[tokio::test]
    async fn text_is_degraded_and_chunked() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        let send = server
            .mock("POST", "/message/send")
            .match_query(mockito::Matcher::UrlEncoded(
                "access_token".into(),
                "TOK".into(),
            ))
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "touser": "alice",
                "msgtype": "text",
                "agentid": 1000002,
                "text": {"content": "【Hi】\nbold"}
            })))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let (_tmp, outbound) = outbound_with_server(&server.url());
        outbound
            .send_text("default", "alice", "# Hi\n**bold**")
            .await
            .unwrap();
        send.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_account_errors() {
        let mut server = mockito::Server::new_async().await;
        let (_tmp, outbound) = outbound_with_server(&server.url());
        let err = outbound.send_text("ghost", "a", "x").await.unwrap_err();
        assert!(err.to_string().contains("unknown account"));
    }

    #[tokio::test]
    async fn file_send_puts_caption_first_then_file() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        let text_first = server
            .mock("POST", "/message/send")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"msgtype": "text"}),
            ))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/media/upload")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"errcode":0,"errmsg":"ok","type":"file","media_id":"F1"}"#)
            .create_async()
            .await;
        let file_send = server
            .mock("POST", "/message/send")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"msgtype": "file", "file": {"media_id": "F1"}}),
            ))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let (tmp, outbound) = outbound_with_server(&server.url());
        let pdf = tmp.path().join("report.pdf");
        tokio::fs::write(&pdf, b"%PDF-1.4").await.unwrap();

        outbound
            .send_media(
                "default",
                "alice",
                &ReplyPayload {
                    text: "quarterly report".into(),
                    media: Some(sinobridge_common::types::MediaPayload {
                        url: pdf.display().to_string(),
                        mime_type: "application/pdf".into(),
                        filename: None,
                    }),
                },
            )
            .await
            .unwrap();

        text_first.assert_async().await;
        upload.assert_async().await;
        file_send.assert_async().await;
    }

    #[tokio::test]
    async fn media_failure_falls_back_to_link_text() {
        let mut server = mockito::Server::new_async().await;
        let _t = mock_token(&mut server);
        // Upload endpoint rejects, so the sender degrades to a text link.
        let _upload = server
            .mock("POST", "/media/upload")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"errcode":45009,"errmsg":"api freq out of limit"}"#)
            .create_async()
            .await;
        let fallback = server
            .mock("POST", "/message/send")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::Regex("📎".into()))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .create_async()
            .await;

        let (tmp, outbound) = outbound_with_server(&server.url());
        let img = tmp.path().join("x.png");
        tokio::fs::write(&img, b"\x89PNG").await.unwrap();

        outbound
            .send_media(
                "default",
                "alice",
                &ReplyPayload {
                    text: String::new(),
                    media: Some(sinobridge_common::types::MediaPayload {
                        url: img.display().to_string(),
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
