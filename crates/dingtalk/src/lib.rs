//! DingTalk channel.
//!
//! Ingress is the Stream SDK: a gateway handshake yields a WebSocket
//! endpoint plus ticket, robot messages arrive as CALLBACK frames, and
//! every frame is acknowledged. Replies go through the per-message session
//! webhook (or the active robot APIs), with optional streaming AI cards.

pub mod card;
pub mod config;
pub mod error;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod stream;
pub mod token;

pub use {
    config::DingTalkConfig,
    error::{Error, Result},
    plugin::DingTalkPlugin,
};

pub(crate) const CHANNEL_ID: &str = "dingtalk";
pub(crate) const CHANNEL_LABEL: &str = "DingTalk";

/// New-style API host (token, cards, robot messages).
pub(crate) const API_BASE: &str = "https://api.dingtalk.com";
/// Legacy oapi host (media upload).
pub(crate) const OAPI_BASE: &str = "https://oapi.dingtalk.com";
