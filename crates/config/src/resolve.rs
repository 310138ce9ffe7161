use std::collections::HashMap;

use {
    serde_json::{Map, Value},
    sinobridge_channels::gating::PolicyConfig,
    tracing::warn,
};

use crate::schema::{ChannelCommon, DmScope};

/// Which credential keys a channel needs for ingress and for
/// host-initiated sending.
#[derive(Debug, Clone, Copy)]
pub struct CredentialSpec {
    pub ingress: &'static [&'static str],
    pub active: &'static [&'static str],
}

impl CredentialSpec {
    fn all_present(keys: &[&str], params: &Value) -> bool {
        keys.iter().all(|k| {
            params
                .get(*k)
                .is_some_and(|v| !v.is_null() && v.as_str() != Some("") && v.as_str() != Some("0"))
        })
    }
}

/// One account's fully merged view.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    /// Credentials sufficient for ingress.
    pub configured: bool,
    /// Credentials sufficient for host-initiated sending.
    pub can_send_active: bool,
    pub policy: PolicyConfig,
    pub reply_final_only: bool,
    pub max_file_bytes: u64,
    pub text_chunk_limit: Option<usize>,
    /// Session scoping for DMs, consumed by the host router.
    pub dm_scope: DmScope,
    /// Merged parameter object handed to `start_account`.
    pub params: Value,
}

impl ResolvedAccount {
    fn disabled_stub(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            name: None,
            enabled: false,
            configured: false,
            can_send_active: false,
            policy: PolicyConfig::default(),
            reply_final_only: false,
            max_file_bytes: 100 * 1024 * 1024,
            text_chunk_limit: None,
            dm_scope: DmScope::default(),
            params: Value::Object(Map::new()),
        }
    }
}

/// Resolve one account of one channel section.
///
/// Layers, weakest first: the channel section (minus `accounts`), the
/// per-account object, and — for the default account only — the
/// `env` overrides. Unknown account IDs resolve to a disabled stub.
#[must_use]
pub fn resolve_account(
    channel_section: &Value,
    account_id: &str,
    env: &HashMap<String, Value>,
    creds: &CredentialSpec,
) -> ResolvedAccount {
    let mut base = match channel_section {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let accounts = base.remove("accounts");

    let common: ChannelCommon =
        serde_json::from_value(Value::Object(base.clone())).unwrap_or_default();
    let is_default = account_id == common.default_account_id();

    let account_overlay = accounts
        .as_ref()
        .and_then(|a| a.get(account_id))
        .and_then(Value::as_object)
        .cloned();

    if !is_default && account_overlay.is_none() {
        return ResolvedAccount::disabled_stub(account_id);
    }

    let mut merged = Value::Object(base);
    if let Some(overlay) = account_overlay {
        deep_merge(&mut merged, &Value::Object(overlay));
    }
    if is_default && let Some(map) = merged.as_object_mut() {
        for (key, value) in env {
            map.insert(key.clone(), value.clone());
        }
    }

    let common: ChannelCommon = match serde_json::from_value(merged.clone()) {
        Ok(c) => c,
        Err(e) => {
            warn!(account_id, error = %e, "invalid channel config, disabling account");
            return ResolvedAccount::disabled_stub(account_id);
        },
    };

    let configured = CredentialSpec::all_present(creds.ingress, &merged);
    let can_send_active = !creds.active.is_empty() && CredentialSpec::all_present(creds.active, &merged);

    ResolvedAccount {
        account_id: account_id.to_string(),
        name: common.name.clone(),
        enabled: common.enabled,
        configured,
        can_send_active,
        policy: common.policy.clone(),
        reply_final_only: common.reply_final_only,
        max_file_bytes: common.max_file_bytes(),
        text_chunk_limit: common.text_chunk_limit,
        dm_scope: common.session.dm_scope,
        params: merged,
    }
}

/// Resolve every account a channel section declares (the default account
/// plus everything under `accounts`).
#[must_use]
pub fn resolve_accounts(
    channel_section: &Value,
    env: &HashMap<String, Value>,
    creds: &CredentialSpec,
) -> Vec<ResolvedAccount> {
    let common: ChannelCommon = channel_section
        .as_object()
        .map(|m| {
            let mut m = m.clone();
            m.remove("accounts");
            serde_json::from_value(Value::Object(m)).unwrap_or_default()
        })
        .unwrap_or_default();

    let mut ids: Vec<String> = vec![common.default_account_id().to_string()];
    if let Some(accounts) = channel_section.get("accounts").and_then(Value::as_object) {
        for id in accounts.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }

    ids.iter()
        .map(|id| resolve_account(channel_section, id, env, creds))
        .collect()
}

/// Collect `SINOBRIDGE_<CHANNEL>_<KEY>` environment overrides for a
/// channel, mapping `CORP_SECRET` to `corpSecret`. Values that parse as
/// JSON scalars are taken as such; everything else stays a string.
#[must_use]
pub fn env_overrides(channel: &str, vars: &[(String, String)]) -> HashMap<String, Value> {
    let prefix = format!(
        "SINOBRIDGE_{}_",
        channel.to_ascii_uppercase().replace('-', "_")
    );
    let mut out = HashMap::new();
    for (name, value) in vars {
        if let Some(key) = name.strip_prefix(&prefix) {
            let parsed = serde_json::from_str::<Value>(value)
                .ok()
                .filter(|v| v.is_boolean() || v.is_number())
                .unwrap_or_else(|| Value::String(value.clone()));
            out.insert(snake_to_camel(key), parsed);
        }
    }
    out
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, part) in key.split('_').enumerate() {
        let lower = part.to_ascii_lowercase();
        if i == 0 {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    },
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    },
                }
            }
        },
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, serde_json::json};

    const CREDS: CredentialSpec = CredentialSpec {
        ingress: &["corpId", "corpSecret", "token", "encodingAESKey"],
        active: &["corpId", "corpSecret", "agentId"],
    };

    fn section() -> Value {
        json!({
            "corpId": "wx1",
            "corpSecret": "s3cr3t",
            "token": "tok",
            "encodingAESKey": "k".repeat(43),
            "agentId": 1000002,
            "dmPolicy": "open",
            "accounts": {
                "alice": { "agentId": 1000003, "dmPolicy": "allowlist", "allowFrom": ["u1"] },
                "broken": { "enabled": "yes" }
            }
        })
    }

    #[test]
    fn default_account_uses_channel_layer() {
        let acc = resolve_account(&section(), "default", &HashMap::new(), &CREDS);
        assert!(acc.enabled && acc.configured && acc.can_send_active);
        assert_eq!(acc.params["agentId"], 1000002);
    }

    #[test]
    fn account_overlay_wins_over_channel_layer() {
        let acc = resolve_account(&section(), "alice", &HashMap::new(), &CREDS);
        assert_eq!(acc.params["agentId"], 1000003);
        assert_eq!(acc.params["corpId"], "wx1");
        assert_eq!(acc.policy.allow_from, vec!["u1"]);
    }

    #[test]
    fn unknown_account_is_disabled_stub() {
        let acc = resolve_account(&section(), "nobody", &HashMap::new(), &CREDS);
        assert!(!acc.enabled);
        assert!(!acc.configured);
        assert!(!acc.can_send_active);
    }

    #[test]
    fn env_overrides_apply_to_default_account_only() {
        let mut env = HashMap::new();
        env.insert("corpSecret".to_string(), json!("from-env"));
        let acc = resolve_account(&section(), "default", &env, &CREDS);
        assert_eq!(acc.params["corpSecret"], "from-env");

        let acc = resolve_account(&section(), "alice", &env, &CREDS);
        assert_eq!(acc.params["corpSecret"], "s3cr3t");
    }

    #[test]
    fn missing_credentials_clear_configured() {
        let mut sec = section();
        sec.as_object_mut().unwrap().remove("token");
        let acc = resolve_account(&sec, "default", &HashMap::new(), &CREDS);
        assert!(!acc.configured);
        assert!(acc.can_send_active, "active send needs no callback token");
    }

    #[test]
    fn invalid_common_config_disables_account() {
        let acc = resolve_account(&section(), "broken", &HashMap::new(), &CREDS);
        assert!(!acc.enabled);
    }

    #[test]
    fn resolve_accounts_covers_default_and_overlays() {
        let accounts = resolve_accounts(&section(), &HashMap::new(), &CREDS);
        let ids: Vec<&str> = accounts.iter().map(|a| a.account_id.as_str()).collect();
        assert!(ids.contains(&"default"));
        assert!(ids.contains(&"alice"));
        assert!(ids.contains(&"broken"));
    }

    #[test]
    fn env_override_names_map_to_camel_case() {
        let vars = vec![
            ("SINOBRIDGE_WECOM_APP_CORP_SECRET".to_string(), "x".to_string()),
            ("SINOBRIDGE_WECOM_APP_AGENT_ID".to_string(), "77".to_string()),
            ("OTHER_VAR".to_string(), "y".to_string()),
        ];
        let env = env_overrides("wecom-app", &vars);
        assert_eq!(env.get("corpSecret"), Some(&json!("x")));
        assert_eq!(env.get("agentId"), Some(&json!(77)));
        assert_eq!(env.len(), 2);
    }
}
