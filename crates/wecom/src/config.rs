use {
    serde::{Deserialize, Serialize},
    sinobridge_channels::gating::PolicyConfig,
};

/// Configuration for one AI-robot account. The robot authenticates
/// callbacks only — there is no corp secret and no active-send surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeComRobotConfig {
    /// Callback verification token.
    pub token: String,

    #[serde(rename = "encodingAESKey")]
    pub encoding_aes_key: String,

    /// Expected receiveId in decrypted frames (the robot id); optional.
    pub receive_id: Option<String>,

    /// Callback path; defaults to `/webhook/wecom/<accountId>`.
    pub webhook_path: Option<String>,

    #[serde(flatten)]
    pub policy: PolicyConfig,

    pub text_chunk_limit: Option<usize>,

    pub reply_final_only: bool,

    /// Archive root for inbound media.
    pub media_dir: Option<String>,

    pub max_file_size_mb: Option<u64>,
}

impl WeComRobotConfig {
    #[must_use]
    pub fn configured(&self) -> bool {
        !self.token.is_empty() && !self.encoding_aes_key.is_empty()
    }

    #[must_use]
    pub fn webhook_path_for(&self, account_id: &str) -> String {
        self.webhook_path
            .clone()
            .unwrap_or_else(|| format!("/webhook/wecom/{account_id}"))
    }
}
