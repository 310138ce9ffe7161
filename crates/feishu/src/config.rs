use {
    secrecy::{ExposeSecret, SecretBox},
    serde::{Deserialize, Serialize},
    sinobridge_channels::gating::PolicyConfig,
};

/// Configuration for a single Feishu app account.
#[derive(Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeishuConfig {
    pub app_id: String,

    #[serde(serialize_with = "serialize_secret")]
    pub app_secret: SecretBox<String>,

    /// Send markdown replies as interactive cards (Feishu renders them);
    /// plain text messages otherwise.
    pub send_markdown_as_card: bool,

    #[serde(flatten)]
    pub policy: PolicyConfig,

    pub text_chunk_limit: Option<usize>,

    pub reply_final_only: bool,

    pub media_dir: Option<String>,

    pub max_file_size_mb: Option<u64>,
}

impl std::fmt::Debug for FeishuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeishuConfig")
            .field("app_id", &self.app_id)
            .field("app_secret", &"[REDACTED]")
            .field("send_markdown_as_card", &self.send_markdown_as_card)
            .finish_non_exhaustive()
    }
}

impl Clone for FeishuConfig {
    fn clone(&self) -> Self {
        Self {
            app_id: self.app_id.clone(),
            app_secret: SecretBox::new(Box::new(self.app_secret.expose_secret().to_owned())),
            send_markdown_as_card: self.send_markdown_as_card,
            policy: self.policy.clone(),
            text_chunk_limit: self.text_chunk_limit,
            reply_final_only: self.reply_final_only,
            media_dir: self.media_dir.clone(),
            max_file_size_mb: self.max_file_size_mb,
        }
    }
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: SecretBox::new(Box::new(String::new())),
            send_markdown_as_card: true,
            policy: PolicyConfig::default(),
            text_chunk_limit: None,
            reply_final_only: false,
            media_dir: None,
            max_file_size_mb: None,
        }
    }
}

impl FeishuConfig {
    #[must_use]
    pub fn configured(&self) -> bool {
        !self.app_id.is_empty() && !self.app_secret.expose_secret().is_empty()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &SecretBox<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}
