//! WeCom self-built application channel.
//!
//! Ingress is an encrypted-XML HTTPS webhook (signature check, AES
//! decryption, 5 s acknowledgement window); egress is the corp
//! `message/send` API with per-account access tokens, media upload, and
//! voice transcoding.

pub mod config;
pub mod error;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod token;
pub mod webhook;
pub mod xml;

pub use {
    config::WeComAppConfig,
    error::{Error, Result},
    plugin::WeComAppPlugin,
};

pub(crate) const CHANNEL_ID: &str = "wecom-app";
pub(crate) const CHANNEL_LABEL: &str = "WeCom";
