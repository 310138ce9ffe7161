//! Decrypted-callback parsing and envelope construction.

use {
    sinobridge_common::types::{Attachment, ChatType, InboundEnvelope, MediaKind},
    sinobridge_media::DownloadRequest,
    tracing::{debug, warn},
};

use crate::{
    CHANNEL_ID,
    error::Result,
    state::AccountState,
    token::CorpTokenSource,
    xml,
};

/// Fields pulled from one decrypted callback XML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCallback {
    pub msg_type: String,
    pub from_user: String,
    pub create_time_ms: i64,
    pub msg_id: Option<String>,
    pub content: Option<String>,
    pub media_id: Option<String>,
    pub recognition: Option<String>,
}

/// What one callback turns into.
#[derive(Debug)]
pub enum NormalizeOutcome {
    Envelope(InboundEnvelope),
    /// User-visible text sent back instead of dispatching to the agent.
    Notice { to: String, text: String },
    Skip(&'static str),
}

#[must_use]
pub fn parse_callback(decrypted_xml: &str) -> Option<ParsedCallback> {
    let msg_type = xml::extract_tag(decrypted_xml, "MsgType")?;
    let from_user = xml::extract_tag(decrypted_xml, "FromUserName")?;
    let create_time_ms = xml::extract_tag(decrypted_xml, "CreateTime")
        .and_then(|t| t.parse::<i64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or_default();
    Some(ParsedCallback {
        msg_type,
        from_user,
        create_time_ms,
        msg_id: xml::extract_tag(decrypted_xml, "MsgId"),
        content: xml::extract_tag(decrypted_xml, "Content"),
        media_id: xml::extract_tag(decrypted_xml, "MediaId"),
        recognition: xml::extract_tag(decrypted_xml, "Recognition"),
    })
}

/// Turn a parsed callback into an inbound envelope, downloading and
/// archiving media along the way. Self-built-app messages are always
/// direct chats.
pub async fn build_envelope(
    state: &AccountState,
    tokens: &CorpTokenSource,
    parsed: ParsedCallback,
) -> Result<NormalizeOutcome> {
    let now_ms = chrono_now_ms();
    let message_id = parsed
        .msg_id
        .clone()
        .unwrap_or_else(|| InboundEnvelope::synthetic_message_id(&parsed.from_user, now_ms));

    let mut attachments: Vec<Attachment> = Vec::new();
    let body = match parsed.msg_type.as_str() {
        // Self-built-app messages are always direct chats, so even an
        // empty text still gets an envelope and a gate decision.
        "text" => parsed
            .content
            .as_deref()
            .map(|c| c.trim().to_string())
            .unwrap_or_default(),
        "image" | "voice" | "video" | "file" => {
            let kind = match parsed.msg_type.as_str() {
                "image" => MediaKind::Image,
                "voice" => MediaKind::Voice,
                "video" => MediaKind::Video,
                _ => MediaKind::File,
            };
            let Some(media_id) = parsed.media_id.clone() else {
                return Ok(NormalizeOutcome::Skip("media message without MediaId"));
            };
            if !state.config.inbound_media.enabled {
                attachments.push(Attachment {
                    kind: Some(kind),
                    source: media_id,
                    saved_path: None,
                    transcript: None,
                });
                format!("[{}]", kind.body_label())
            } else {
                match fetch_media(state, tokens, &media_id, kind).await {
                    Ok(saved_path) => {
                        let mut body = format!("[{}] saved:{saved_path}", kind.body_label());
                        if kind == MediaKind::Voice
                            && let Some(recognition) = parsed
                                .recognition
                                .as_deref()
                                .filter(|r| !r.trim().is_empty())
                        {
                            body.push_str(&format!("\n[recognition] {}", recognition.trim()));
                        }
                        attachments.push(Attachment {
                            kind: Some(kind),
                            source: media_id,
                            saved_path: Some(saved_path),
                            transcript: parsed
                                .recognition
                                .clone()
                                .filter(|r| !r.trim().is_empty()),
                        });
                        body
                    },
                    Err(e) if matches!(&e, crate::Error::Media(m) if m.is_size_limit()) => {
                        let limit_mb = state.config.inbound_media.max_bytes / (1024 * 1024);
                        return Ok(NormalizeOutcome::Notice {
                            to: parsed.from_user,
                            text: format!("文件超过 {limit_mb}MB 上限，未能接收。"),
                        });
                    },
                    Err(e) => {
                        warn!(account_id = state.account_id, error = %e, "media fetch failed");
                        format!("[{}] (download failed)", kind.body_label())
                    },
                }
            }
        },
        "event" => return Ok(NormalizeOutcome::Skip("event callback")),
        other => {
            debug!(msg_type = other, "unsupported wecom message type");
            return Ok(NormalizeOutcome::Skip("unsupported message type"));
        },
    };

    Ok(NormalizeOutcome::Envelope(InboundEnvelope {
        message_id,
        timestamp_ms: if parsed.create_time_ms > 0 {
            parsed.create_time_ms
        } else {
            now_ms
        },
        chat_type: ChatType::Direct,
        sender_id: parsed.from_user.clone(),
        sender_name: None,
        peer_id: parsed.from_user,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned: false,
        channel: CHANNEL_ID.to_string(),
        account_id: state.account_id.clone(),
        message_sid: None,
    }))
}

/// Download one `media/get` payload and archive it, returning the final
/// absolute path.
async fn fetch_media(
    state: &AccountState,
    tokens: &CorpTokenSource,
    media_id: &str,
    kind: MediaKind,
) -> Result<String> {
    let token = tokens.access_token(&state.config).await?;
    let url = format!(
        "{}/media/get?access_token={}&media_id={}",
        tokens.base_url(),
        urlencoding::encode(&token),
        urlencoding::encode(media_id)
    );
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
            ..Default::default()
        })
        .await?;
    let archived = state.media.archive(&downloaded.path).await;
    Ok(archived.display().to_string())
}

fn chrono_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TEXT_XML: &str = "<xml>\
        <ToUserName><![CDATA[wx1]]></ToUserName>\
        <FromUserName><![CDATA[alice]]></FromUserName>\
        <CreateTime>1700000000</CreateTime>\
        <MsgType><![CDATA[text]]></MsgType>\
        <Content><![CDATA[hello bot]]></Content>\
        <MsgId>6789</MsgId>\
        <AgentID>1000002</AgentID></xml>";

    #[test]
    fn parses_text_callback() {
        let parsed = parse_callback(TEXT_XML).unwrap();
        assert_eq!(parsed.msg_type, "text");
        assert_eq!(parsed.from_user, "alice");
        assert_eq!(parsed.create_time_ms, 1_700_000_000_000);
        assert_eq!(parsed.msg_id.as_deref(), Some("6789"));
        assert_eq!(parsed.content.as_deref(), Some("hello bot"));
    }

    #[test]
    fn parses_voice_callback_with_recognition() {
        let xml = "<xml><FromUserName><![CDATA[bob]]></FromUserName>\
            <CreateTime>1700000001</CreateTime>\
            <MsgType><![CDATA[voice]]></MsgType>\
            <MediaId><![CDATA[m1]]></MediaId>\
            <Format><![CDATA[amr]]></Format>\
            <Recognition><![CDATA[你好]]></Recognition>\
            <MsgId>1</MsgId></xml>";
        let parsed = parse_callback(xml).unwrap();
        assert_eq!(parsed.msg_type, "voice");
        assert_eq!(parsed.media_id.as_deref(), Some("m1"));
        assert_eq!(parsed.recognition.as_deref(), Some("你好"));
    }

    #[test]
    fn missing_msg_type_is_unparseable() {
        assert!(parse_callback("<xml><FromUserName>x</FromUserName></xml>").is_none());
    }

    #[tokio::test]
    async fn empty_text_still_builds_a_direct_envelope() {
        use {
            crate::{config::WeComAppConfig, state::AccountState, token::CorpTokenSource},
            base64::Engine as _,
            secrecy::SecretBox,
            sinobridge_media::{MediaConfig, MediaService},
            sinobridge_wecom_crypto::AesKey,
            std::sync::Arc,
        };

        let tmp = tempfile::tempdir().unwrap();
        let key = base64::engine::general_purpose::STANDARD
            .encode([4u8; 32])
            .trim_end_matches('=')
            .to_string();
        let state = AccountState {
            account_id: "default".into(),
            aes_key: AesKey::decode(&key).unwrap(),
            config: WeComAppConfig {
                corp_id: "wx1".into(),
                corp_secret: SecretBox::new(Box::new("s".into())),
                agent_id: 1,
                token: "t".into(),
                encoding_aes_key: key,
                ..Default::default()
            },
            media: Arc::new(MediaService::new(MediaConfig::new(
                tmp.path().join("tmp"),
                tmp.path().join("media"),
            ))),
            cancel: tokio_util::sync::CancellationToken::new(),
            routes: Vec::new(),
        };
        let tokens = CorpTokenSource::new();

        let parsed = ParsedCallback {
            msg_type: "text".into(),
            from_user: "alice".into(),
            content: Some("   ".into()),
            ..Default::default()
        };
        let outcome = build_envelope(&state, &tokens, parsed).await.unwrap();
        let NormalizeOutcome::Envelope(envelope) = outcome else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.body, "");
        assert_eq!(envelope.chat_type, sinobridge_common::types::ChatType::Direct);
    }

    #[tokio::test]
    async fn inbound_image_is_archived_under_dated_dir() {
        use {
            crate::{config::WeComAppConfig, state::AccountState, token::CorpTokenSource},
            secrecy::SecretBox,
            sinobridge_media::{MediaConfig, MediaService},
            sinobridge_wecom_crypto::AesKey,
            std::sync::Arc,
        };

        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", "/gettoken")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"TOK","expires_in":7200}"#)
            .create_async()
            .await;
        let _media = server
            .mock("GET", "/media/get")
            .match_query(mockito::Matcher::UrlEncoded("media_id".into(), "m1".into()))
            .with_header("content-type", "image/jpeg")
            .with_body(vec![0xffu8, 0xd8, 0xff, 0xe0])
            .create_async()
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let key = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD
                .encode([6u8; 32])
                .trim_end_matches('=')
                .to_string()
        };
        let config = WeComAppConfig {
            corp_id: "wx1".into(),
            corp_secret: SecretBox::new(Box::new("s".into())),
            agent_id: 1,
            token: "t".into(),
            encoding_aes_key: key.clone(),
            ..Default::default()
        };
        let state = AccountState {
            account_id: "default".into(),
            aes_key: AesKey::decode(&key).unwrap(),
            media: Arc::new(MediaService::new(MediaConfig::new(
                tmp.path().join("tmp"),
                tmp.path().join("media"),
            ))),
            cancel: tokio_util::sync::CancellationToken::new(),
            routes: Vec::new(),
            config,
        };
        let tokens = CorpTokenSource::new().with_base_url(server.url());

        let parsed = ParsedCallback {
            msg_type: "image".into(),
            from_user: "alice".into(),
            create_time_ms: 1_700_000_000_000,
            msg_id: Some("77".into()),
            media_id: Some("m1".into()),
            ..Default::default()
        };
        let outcome = build_envelope(&state, &tokens, parsed).await.unwrap();
        let NormalizeOutcome::Envelope(envelope) = outcome else {
            panic!("expected envelope");
        };
        assert!(envelope.body.starts_with("[image] saved:"), "{}", envelope.body);
        let day = chrono::Local::now().format("%Y-%m-%d").to_string();
        let saved = envelope.attachments[0].saved_path.clone().unwrap();
        assert!(saved.contains(&format!("/inbound/{day}/")), "{saved}");
        assert!(saved.contains("/img_"), "{saved}");
        assert!(saved.ends_with(".jpg"), "{saved}");
        assert!(std::path::Path::new(&saved).exists());
    }
}
