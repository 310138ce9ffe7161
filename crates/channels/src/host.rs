//! Host runtime port.
//!
//! The gateway runs inside a host agent runtime that owns routing, session
//! storage, and LLM dispatch. The dynamic host API surface is bound here as
//! concrete traits; the host supplies the implementations when it loads the
//! plug-ins.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, futures::future::BoxFuture};

use sinobridge_common::types::{ChatType, InboundEnvelope};

// ── Routing ────────────────────────────────────────────────────────────────

/// Input to agent-route resolution.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub channel: String,
    pub account_id: String,
    pub peer_id: String,
    pub chat_type: ChatType,
}

/// The host's routing answer for one inbound message.
#[derive(Debug, Clone)]
pub struct AgentRoute {
    pub session_key: String,
    pub account_id: String,
    pub agent_id: String,
    pub main_session_key: Option<String>,
}

#[async_trait]
pub trait AgentRouter: Send + Sync {
    async fn resolve_agent_route(&self, req: RouteRequest) -> Result<AgentRoute>;
}

// ── Sessions ───────────────────────────────────────────────────────────────

/// Routing record persisted per `{account, peer}` so host-initiated
/// messages reach the last peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAnchor {
    pub session_key: String,
    pub channel: String,
    pub to: String,
    pub account_id: String,
}

/// One inbound session entry.
#[derive(Debug, Clone)]
pub struct InboundSessionEntry {
    pub session_key: String,
    pub channel: String,
    pub account_id: String,
    pub peer_id: String,
    pub chat_type: ChatType,
    pub timestamp_ms: i64,
}

#[async_trait]
pub trait SessionPort: Send + Sync {
    /// Last-updated timestamp of a session, for envelope formatting.
    async fn read_updated_at(&self, session_key: &str) -> Result<Option<i64>>;

    async fn record_inbound(&self, entry: InboundSessionEntry) -> Result<()>;

    /// Update the "last outbound route" anchor (DMs only).
    async fn record_outbound_route(&self, anchor: SessionAnchor) -> Result<()>;
}

// ── Replies ────────────────────────────────────────────────────────────────

/// Reply block classes, used for per-kind error logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyBlockKind {
    Typing,
    Interim,
    Final,
}

impl ReplyBlockKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Typing => "typing",
            Self::Interim => "interim",
            Self::Final => "final",
        }
    }
}

/// One streamed reply block from the host dispatcher.
#[derive(Debug, Clone)]
pub struct ReplyBlock {
    pub kind: ReplyBlockKind,
    pub text: String,
}

/// Callback delivering one reply block to the platform.
pub type DeliverFn = Arc<dyn Fn(ReplyBlock) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Formatting input for the agent-facing message body.
#[derive(Debug, Clone)]
pub struct EnvelopeFormat<'a> {
    pub channel_label: &'a str,
    pub sender_name: &'a str,
    pub body: &'a str,
    pub previous_timestamp_ms: Option<i64>,
}

/// Context the host needs to run the agent for one inbound message.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub envelope: InboundEnvelope,
    pub route: AgentRoute,
    /// `raw_body` wrapped by [`ReplyPort::format_agent_envelope`].
    pub agent_body: String,
    /// Suppress typing/interim blocks; deliver only the final reply.
    pub final_only: bool,
}

#[async_trait]
pub trait ReplyPort: Send + Sync {
    /// Run the agent and push blocks through `deliver` as they arrive.
    /// Resolves when the reply stream is complete.
    async fn dispatch_reply(&self, ctx: ReplyContext, deliver: DeliverFn) -> Result<()>;

    /// Wrap the raw inbound body with channel label, sender, and the
    /// previous session timestamp.
    fn format_agent_envelope(&self, format: EnvelopeFormat<'_>) -> String;

    /// Mark the per-session dispatcher idle once delivery finished.
    async fn mark_dispatch_idle(&self, session_key: &str);
}

/// Bundle of host-port handles passed to every channel plugin.
#[derive(Clone)]
pub struct HostPort {
    pub router: Arc<dyn AgentRouter>,
    pub sessions: Arc<dyn SessionPort>,
    pub reply: Arc<dyn ReplyPort>,
}
