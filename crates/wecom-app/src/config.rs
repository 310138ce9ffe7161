use {
    secrecy::{ExposeSecret, SecretBox},
    serde::{Deserialize, Serialize},
    sinobridge_channels::gating::PolicyConfig,
};

/// Inbound media archival settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundMediaConfig {
    pub enabled: bool,
    /// Archive root; `<dir>/inbound/YYYY-MM-DD/` receives the files.
    pub dir: Option<String>,
    pub max_bytes: u64,
    pub keep_days: u32,
}

impl Default for InboundMediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_bytes: 10 * 1024 * 1024,
            keep_days: 7,
        }
    }
}

/// Outbound voice transcoding settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct VoiceTranscodeConfig {
    pub enabled: bool,
    /// Preferred target codec; only `amr` is implemented.
    pub prefer: Option<String>,
}

/// Configuration for a single WeCom self-built-app account.
#[derive(Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeComAppConfig {
    pub corp_id: String,

    #[serde(serialize_with = "serialize_secret")]
    pub corp_secret: SecretBox<String>,

    pub agent_id: i64,

    /// Callback verification token.
    pub token: String,

    #[serde(rename = "encodingAESKey")]
    pub encoding_aes_key: String,

    /// Callback path; defaults to `/webhook/wecom-app/<accountId>`.
    pub webhook_path: Option<String>,

    #[serde(flatten)]
    pub policy: PolicyConfig,

    pub text_chunk_limit: Option<usize>,

    pub reply_final_only: bool,

    pub inbound_media: InboundMediaConfig,

    pub voice_transcode: VoiceTranscodeConfig,
}

impl std::fmt::Debug for WeComAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeComAppConfig")
            .field("corp_id", &self.corp_id)
            .field("corp_secret", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .field("webhook_path", &self.webhook_path)
            .finish_non_exhaustive()
    }
}

impl Clone for WeComAppConfig {
    fn clone(&self) -> Self {
        Self {
            corp_id: self.corp_id.clone(),
            corp_secret: SecretBox::new(Box::new(self.corp_secret.expose_secret().to_owned())),
            agent_id: self.agent_id,
            token: self.token.clone(),
            encoding_aes_key: self.encoding_aes_key.clone(),
            webhook_path: self.webhook_path.clone(),
            policy: self.policy.clone(),
            text_chunk_limit: self.text_chunk_limit,
            reply_final_only: self.reply_final_only,
            inbound_media: self.inbound_media.clone(),
            voice_transcode: self.voice_transcode.clone(),
        }
    }
}

impl Default for WeComAppConfig {
    fn default() -> Self {
        Self {
            corp_id: String::new(),
            corp_secret: SecretBox::new(Box::new(String::new())),
            agent_id: 0,
            token: String::new(),
            encoding_aes_key: String::new(),
            webhook_path: None,
            policy: PolicyConfig::default(),
            text_chunk_limit: None,
            reply_final_only: false,
            inbound_media: InboundMediaConfig::default(),
            voice_transcode: VoiceTranscodeConfig::default(),
        }
    }
}

impl WeComAppConfig {
    /// Credentials sufficient for webhook ingress.
    #[must_use]
    pub fn configured(&self) -> bool {
        !self.corp_id.is_empty()
            && !self.token.is_empty()
            && !self.encoding_aes_key.is_empty()
            && self.agent_id > 0
    }

    /// Credentials sufficient for host-initiated sending.
    #[must_use]
    pub fn can_send_active(&self) -> bool {
        !self.corp_id.is_empty() && !self.corp_secret.expose_secret().is_empty() && self.agent_id > 0
    }

    #[must_use]
    pub fn webhook_path_for(&self, account_id: &str) -> String {
        self.webhook_path
            .clone()
            .unwrap_or_else(|| format!("/webhook/wecom-app/{account_id}"))
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &SecretBox<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}
