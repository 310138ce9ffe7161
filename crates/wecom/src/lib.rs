//! WeCom AI-robot channel.
//!
//! The robot receives encrypted JSON callbacks over HTTPS. Replies that fit
//! the 5 s window could go back in the HTTP response, but agent replies
//! rarely do — so the handler acknowledges with an empty `stream` message
//! and delivers the real content through the callback's `response_url`.
//! There are no corp credentials, so host-initiated sending is unsupported.

pub mod config;
pub mod error;
pub mod normalize;
pub mod plugin;
pub mod responder;
pub mod state;
pub mod webhook;

pub use {
    config::WeComRobotConfig,
    error::{Error, Result},
    plugin::WeComRobotPlugin,
};

pub(crate) const CHANNEL_ID: &str = "wecom";
pub(crate) const CHANNEL_LABEL: &str = "WeCom";
