use {
    serde::{Deserialize, Serialize},
    sinobridge_channels::gating::PolicyConfig,
};

fn default_true() -> bool {
    true
}

fn default_max_file_size_mb() -> u64 {
    100
}

/// How DM sessions map onto host sessions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DmScope {
    /// All DMs share the account's main session.
    #[default]
    #[serde(rename = "main")]
    Main,
    /// One session per peer.
    #[serde(rename = "per-peer")]
    PerPeer,
    /// One session per channel + peer pair.
    #[serde(rename = "per-channel-peer")]
    PerChannelPeer,
}

/// Session-related keys under `channels.<id>.session`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub dm_scope: DmScope,
}

/// Channel-neutral keys recognized under `channels.<id>` (and overridable
/// per account). Channel-specific credentials stay in the loose params
/// object; each channel crate deserializes its own config struct from the
/// merged value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelCommon {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub name: Option<String>,

    #[serde(flatten)]
    pub policy: PolicyConfig,

    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    pub text_chunk_limit: Option<usize>,

    pub reply_final_only: bool,

    pub session: SessionConfig,

    pub default_account: Option<String>,
}

impl Default for ChannelCommon {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
            policy: PolicyConfig::default(),
            max_file_size_mb: default_max_file_size_mb(),
            text_chunk_limit: None,
            reply_final_only: false,
            session: SessionConfig::default(),
            default_account: None,
        }
    }
}

impl ChannelCommon {
    #[must_use]
    pub fn default_account_id(&self) -> &str {
        self.default_account.as_deref().unwrap_or("default")
    }

    #[must_use]
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}
