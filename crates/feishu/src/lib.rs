//! Feishu (Lark) channel.
//!
//! Ingress is the open-platform long connection: a WebSocket endpoint is
//! fetched per account, `url_verification` challenges are answered in-band,
//! and `im.message.receive_v1` events stream in. Egress uses the IM v1
//! message API with a tenant access token, sending markdown as interactive
//! cards when configured.

pub mod config;
pub mod error;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod token;
pub mod ws;

pub use {
    config::FeishuConfig,
    error::{Error, Result},
    plugin::FeishuPlugin,
};

pub(crate) const CHANNEL_ID: &str = "feishu";
pub(crate) const CHANNEL_LABEL: &str = "Feishu";

pub(crate) const API_BASE: &str = "https://open.feishu.cn";
