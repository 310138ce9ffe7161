use {anyhow::Result, async_trait::async_trait};

use sinobridge_common::types::{ChatType, ReplyPayload};

/// What a channel can do, advertised to the host runtime.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ChannelCapabilities {
    pub chat_types: &'static [ChatType],
    /// Inbound and outbound media handling.
    pub media: bool,
    /// Streamed reply delivery (chunked or card-based).
    pub reply: bool,
    /// Host-initiated (non-reply) sending.
    pub active_send: bool,
}

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "dingtalk", "wecom-app").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> ChannelCapabilities;

    /// Start one account's ingress under its own task. `config` is the
    /// merged per-account parameter object from the config resolver.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Cancel an account's task and release its webhook routes.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Send messages to a channel peer.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()>;
    async fn send_media(&self, account_id: &str, to: &str, payload: &ReplyPayload) -> Result<()>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}

/// Lifecycle state of one account, published on every transition.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountStatus {
    pub channel: String,
    pub account_id: String,
    pub running: bool,
    pub configured: bool,
    pub can_send_active: bool,
    pub updated_at_ms: i64,
}

/// Sink for account status updates — the host provides the implementation.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, status: AccountStatus);
}
