//! QQ Open Platform channel.
//!
//! Ingress is an HTTPS webhook signed with Ed25519 (the key pair is derived
//! from the bot secret); the op-13 validation handshake is answered
//! in-band. Egress uses the v2 C2C/group message APIs with an app access
//! token. The platform cannot deliver arbitrary files (`file_type=4`), so
//! file sends degrade to a link with an explanation.

pub mod auth;
pub mod config;
pub mod error;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod token;
pub mod webhook;

pub use {
    config::QqBotConfig,
    error::{Error, Result},
    plugin::QqBotPlugin,
};

pub(crate) const CHANNEL_ID: &str = "qqbot";
pub(crate) const CHANNEL_LABEL: &str = "QQ";

pub(crate) const API_BASE: &str = "https://api.sgroup.qq.com";
pub(crate) const TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";
