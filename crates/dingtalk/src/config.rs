use {
    secrecy::{ExposeSecret, SecretBox},
    serde::{Deserialize, Serialize},
    sinobridge_channels::gating::PolicyConfig,
};

/// Configuration for a single DingTalk robot account.
#[derive(Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DingTalkConfig {
    /// App key; also used as the robotCode for active sends.
    pub client_id: String,

    #[serde(serialize_with = "serialize_secret")]
    pub client_secret: SecretBox<String>,

    /// Stream replies as AI cards instead of chunked text.
    #[serde(rename = "enableAICard")]
    pub enable_ai_card: bool,

    /// Card template for streaming output; the platform ships a stock one.
    pub card_template_id: Option<String>,

    #[serde(flatten)]
    pub policy: PolicyConfig,

    pub text_chunk_limit: Option<usize>,

    pub reply_final_only: bool,

    pub media_dir: Option<String>,

    pub max_file_size_mb: Option<u64>,
}

impl std::fmt::Debug for DingTalkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("enable_ai_card", &self.enable_ai_card)
            .finish_non_exhaustive()
    }
}

impl Clone for DingTalkConfig {
    fn clone(&self) -> Self {
        Self {
            client_id: self.client_id.clone(),
            client_secret: SecretBox::new(Box::new(self.client_secret.expose_secret().to_owned())),
            enable_ai_card: self.enable_ai_card,
            card_template_id: self.card_template_id.clone(),
            policy: self.policy.clone(),
            text_chunk_limit: self.text_chunk_limit,
            reply_final_only: self.reply_final_only,
            media_dir: self.media_dir.clone(),
            max_file_size_mb: self.max_file_size_mb,
        }
    }
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: SecretBox::new(Box::new(String::new())),
            enable_ai_card: false,
            card_template_id: None,
            policy: PolicyConfig::default(),
            text_chunk_limit: None,
            reply_final_only: false,
            media_dir: None,
            max_file_size_mb: None,
        }
    }
}

impl DingTalkConfig {
    #[must_use]
    pub fn configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.expose_secret().is_empty()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &SecretBox<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_ai_card_flag() {
        let cfg: DingTalkConfig = serde_json::from_str(
            r#"{"clientId":"ding123","clientSecret":"s","enableAICard":true,
                "groupPolicy":"allowlist","groupAllowFrom":["cv1"]}"#,
        )
        .unwrap();
        assert!(cfg.enable_ai_card);
        assert!(cfg.configured());
        assert_eq!(cfg.policy.group_allow_from, vec!["cv1"]);
    }

    #[test]
    fn missing_secret_is_unconfigured() {
        let cfg: DingTalkConfig = serde_json::from_str(r#"{"clientId":"x"}"#).unwrap();
        assert!(!cfg.configured());
    }
}
