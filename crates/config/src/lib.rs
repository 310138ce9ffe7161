//! Per-channel, per-account configuration resolution.
//!
//! Three layers merge into one account view: process environment overrides
//! (default account only), the top-level `channels.<id>` section, and the
//! per-account overrides under `channels.<id>.accounts.<accountId>`.

pub mod reload;
pub mod resolve;
pub mod schema;
pub mod validate;

pub use {
    reload::{ReloadPlan, diff_accounts},
    resolve::{CredentialSpec, ResolvedAccount, env_overrides, resolve_account, resolve_accounts},
    schema::{ChannelCommon, DmScope, SessionConfig},
    validate::{ValidationError, validate_aes_key, validate_agent_id},
};
