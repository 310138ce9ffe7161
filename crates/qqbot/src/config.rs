use {
    secrecy::{ExposeSecret, SecretBox},
    serde::{Deserialize, Serialize},
    sinobridge_channels::gating::PolicyConfig,
};

/// Tencent Flash ASR credentials for voice messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AsrConfig {
    pub enabled: bool,
    pub app_id: String,
    pub secret_id: String,
    pub secret_key: String,
}

impl AsrConfig {
    #[must_use]
    pub fn usable(&self) -> bool {
        self.enabled && !self.app_id.is_empty() && !self.secret_id.is_empty() && !self.secret_key.is_empty()
    }
}

/// Configuration for a single QQ bot account.
#[derive(Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QqBotConfig {
    pub app_id: String,

    #[serde(serialize_with = "serialize_secret")]
    pub client_secret: SecretBox<String>,

    /// Markdown templates need per-bot platform approval; off by default,
    /// in which case markdown is degraded to plain text.
    pub markdown_support: bool,

    /// Callback path; defaults to `/webhook/qqbot/<accountId>`.
    pub webhook_path: Option<String>,

    #[serde(flatten)]
    pub policy: PolicyConfig,

    pub text_chunk_limit: Option<usize>,

    pub reply_final_only: bool,

    pub media_dir: Option<String>,

    pub max_file_size_mb: Option<u64>,

    pub asr: AsrConfig,
}

impl std::fmt::Debug for QqBotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QqBotConfig")
            .field("app_id", &self.app_id)
            .field("client_secret", &"[REDACTED]")
            .field("markdown_support", &self.markdown_support)
            .finish_non_exhaustive()
    }
}

impl Clone for QqBotConfig {
    fn clone(&self) -> Self {
        Self {
            app_id: self.app_id.clone(),
            client_secret: SecretBox::new(Box::new(self.client_secret.expose_secret().to_owned())),
            markdown_support: self.markdown_support,
            webhook_path: self.webhook_path.clone(),
            policy: self.policy.clone(),
            text_chunk_limit: self.text_chunk_limit,
            reply_final_only: self.reply_final_only,
            media_dir: self.media_dir.clone(),
            max_file_size_mb: self.max_file_size_mb,
            asr: self.asr.clone(),
        }
    }
}

impl Default for QqBotConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            client_secret: SecretBox::new(Box::new(String::new())),
            markdown_support: false,
            webhook_path: None,
            policy: PolicyConfig::default(),
            text_chunk_limit: None,
            reply_final_only: false,
            media_dir: None,
            max_file_size_mb: None,
            asr: AsrConfig::default(),
        }
    }
}

impl QqBotConfig {
    #[must_use]
    pub fn configured(&self) -> bool {
        !self.app_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }

    #[must_use]
    pub fn webhook_path_for(&self, account_id: &str) -> String {
        self.webhook_path
            .clone()
            .unwrap_or_else(|| format!("/webhook/qqbot/{account_id}"))
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &SecretBox<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}
