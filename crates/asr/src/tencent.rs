//! Tencent Cloud Flash ASR (one-shot recognition).
//!
//! The request is a POST of the raw audio to
//! `asr.cloud.tencent.com/asr/flash/v1/<appid>` with a sorted query string;
//! the `Authorization` header is `base64(HMAC-SHA1(secret_key, "POST" +
//! host + path + "?" + query))`.

use std::time::Duration;

use {
    base64::Engine,
    hmac::{Hmac, KeyInit, Mac},
    secrecy::{ExposeSecret, SecretBox},
    serde::Deserialize,
    sha1::Sha1,
    tracing::debug,
};

use crate::{Error, Result, Transcriber, TranscribeRequest, Transcript};

type HmacSha1 = Hmac<Sha1>;

const ASR_HOST: &str = "asr.cloud.tencent.com";

/// Flash ASR calls get a fixed timeout.
const ASR_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and engine selection for Flash ASR.
#[derive(Clone)]
pub struct TencentFlashConfig {
    pub app_id: String,
    pub secret_id: String,
    pub secret_key: SecretBox<String>,
    /// Recognition engine, e.g. `16k_zh`.
    pub engine_type: String,
}

impl std::fmt::Debug for TencentFlashConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TencentFlashConfig")
            .field("app_id", &self.app_id)
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"[REDACTED]")
            .field("engine_type", &self.engine_type)
            .finish()
    }
}

impl TencentFlashConfig {
    #[must_use]
    pub fn new(app_id: String, secret_id: String, secret_key: SecretBox<String>) -> Self {
        Self {
            app_id,
            secret_id,
            secret_key,
            engine_type: "16k_zh".to_string(),
        }
    }
}

pub struct TencentFlashAsr {
    config: TencentFlashConfig,
    client: reqwest::Client,
    /// Overridable for tests; production uses `https://<ASR_HOST>`.
    base_url: String,
}

impl TencentFlashAsr {
    #[must_use]
    pub fn new(config: TencentFlashConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            base_url: format!("https://{ASR_HOST}"),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// Sorted query string for one request, signature-ready.
    fn build_query(&self, voice_format: &str, timestamp: i64) -> String {
        let mut params: Vec<(String, String)> = vec![
            ("secretid".into(), self.config.secret_id.clone()),
            ("timestamp".into(), timestamp.to_string()),
            ("engine_type".into(), self.config.engine_type.clone()),
            ("voice_format".into(), voice_format.to_string()),
            ("speaker_diarization".into(), "0".into()),
            ("filter_dirty".into(), "0".into()),
            ("filter_modal".into(), "0".into()),
            ("filter_punc".into(), "0".into()),
            ("convert_num_mode".into(), "1".into()),
            ("word_info".into(), "0".into()),
            ("first_channel_only".into(), "1".into()),
        ];
        params.sort();
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn sign(&self, query: &str) -> String {
        let to_sign = format!("POST{ASR_HOST}/asr/flash/v1/{}?{query}", self.config.app_id);
        // HMAC accepts any key length; the Err arm is unreachable.
        let Ok(mut mac) =
            HmacSha1::new_from_slice(self.config.secret_key.expose_secret().as_bytes())
        else {
            return String::new();
        };
        mac.update(to_sign.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }
}

#[derive(Debug, Deserialize)]
struct FlashResponse {
    code: i64,
    message: String,
    #[serde(default)]
    flash_result: Vec<FlashResult>,
    #[serde(default)]
    audio_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FlashResult {
    #[serde(default)]
    text: String,
}

#[async_trait::async_trait]
impl Transcriber for TencentFlashAsr {
    fn id(&self) -> &'static str {
        "tencent-flash"
    }

    fn is_configured(&self) -> bool {
        !self.config.app_id.is_empty()
            && !self.config.secret_id.is_empty()
            && !self.config.secret_key.expose_secret().is_empty()
    }

    async fn transcribe(&self, request: TranscribeRequest) -> Result<Transcript> {
        if !self.is_configured() {
            return Err(Error::NotConfigured);
        }

        let timestamp = unix_seconds();
        let query = self.build_query(&request.voice_format, timestamp);
        let signature = self.sign(&query);
        let url = format!("{}/asr/flash/v1/{}?{}", self.base_url, self.config.app_id, query);

        debug!(format = %request.voice_format, bytes = request.audio.len(), "flash asr request");

        let response = self
            .client
            .post(&url)
            .timeout(ASR_TIMEOUT)
            .header("Authorization", signature)
            .header("Content-Type", "application/octet-stream")
            .body(request.audio)
            .send()
            .await?;

        let body: FlashResponse = response
            .json()
            .await
            .map_err(|e| Error::Malformed(e.to_string()))?;

        if body.code != 0 {
            return Err(Error::Backend {
                code: body.code,
                message: body.message,
            });
        }

        let text = body
            .flash_result
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(Transcript {
            text,
            duration_ms: body.audio_duration,
        })
    }
}

fn unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
