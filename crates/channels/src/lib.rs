//! Channel plugin system.
//!
//! Each platform (DingTalk, Feishu, WeCom, WeCom self-built app, QQ) implements
//! the [`plugin::ChannelPlugin`] trait. This crate carries everything that is
//! channel-neutral: the policy gate, the host-runtime ports, the dispatch
//! coordinator, target resolution, the access-token cache, the webhook route
//! contract, and plain-text degradation of markdown.

pub mod directory;
pub mod dispatch;
pub mod error;
pub mod gating;
pub mod host;
pub mod markdown;
pub mod plugin;
pub mod registry;
pub mod text;
pub mod token;
pub mod webhook;

pub use {
    error::{Error, Result},
    plugin::{
        AccountStatus, ChannelCapabilities, ChannelHealthSnapshot, ChannelOutbound, ChannelPlugin,
        ChannelStatus, StatusSink,
    },
};
