use serde::{Deserialize, Serialize};

use sinobridge_common::types::ChatType;

/// DM admission policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    #[default]
    Open,
    /// Admitted here; the host runtime owns the pairing bookkeeping.
    Pairing,
    Allowlist,
    Disabled,
}

/// Group admission policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    #[default]
    Open,
    Allowlist,
    Disabled,
}

/// Per-account admission policy block. Immutable for the duration of one
/// inbound message evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub dm_policy: DmPolicy,
    pub group_policy: GroupPolicy,
    pub require_mention: Option<bool>,
    pub allow_from: Vec<String>,
    pub group_allow_from: Vec<String>,
}

impl PolicyConfig {
    /// Mention gating defaults to on for group chats.
    #[must_use]
    pub fn mention_required(&self) -> bool {
        self.require_mention.unwrap_or(true)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "allowed",
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Membership test for allowlists. A literal `"*"` entry admits everyone;
/// otherwise entries match the ID exactly.
#[must_use]
pub fn list_allows(id: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|entry| entry == "*" || entry == id)
}

/// Whether a message with no text and no attachments is still worth an
/// envelope: direct chats and explicit mentions are; anything else is
/// group noise the normalizers drop before the gate.
#[must_use]
pub fn dispatch_when_empty(chat_type: ChatType, was_mentioned: bool) -> bool {
    was_mentioned || chat_type.is_direct()
}

/// Evaluate the admission policy for one inbound message.
///
/// DMs: `open` and `pairing` admit, `allowlist` requires the sender on
/// `allow_from`, `disabled` rejects. Groups: `disabled` rejects, `allowlist`
/// requires the peer (group ID) on `group_allow_from`, and unless mention
/// gating is off the bot must have been @-mentioned.
#[must_use]
pub fn evaluate(
    policy: &PolicyConfig,
    chat_type: ChatType,
    sender_id: &str,
    peer_id: &str,
    was_mentioned: bool,
) -> GateDecision {
    match chat_type {
        ChatType::Direct => match policy.dm_policy {
            DmPolicy::Disabled => GateDecision::deny("dm disabled"),
            DmPolicy::Open | DmPolicy::Pairing => GateDecision::allow(),
            DmPolicy::Allowlist => {
                if list_allows(sender_id, &policy.allow_from) {
                    GateDecision::allow()
                } else {
                    GateDecision::deny("sender not on allowlist")
                }
            },
        },
        ChatType::Group => {
            match policy.group_policy {
                GroupPolicy::Disabled => return GateDecision::deny("groups disabled"),
                GroupPolicy::Allowlist => {
                    if !list_allows(peer_id, &policy.group_allow_from) {
                        return GateDecision::deny("group not on allowlist");
                    }
                },
                GroupPolicy::Open => {},
            }
            if policy.mention_required() && !was_mentioned {
                GateDecision::deny("not mentioned")
            } else {
                GateDecision::allow()
            }
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy() -> PolicyConfig {
        PolicyConfig::default()
    }

    #[test]
    fn open_dm_admits_anyone() {
        assert!(evaluate(&policy(), ChatType::Direct, "anyone", "anyone", false).allowed);
    }

    #[test]
    fn pairing_dm_admits() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Pairing;
        assert!(evaluate(&p, ChatType::Direct, "stranger", "stranger", false).allowed);
    }

    #[test]
    fn disabled_dm_rejects() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Disabled;
        let d = evaluate(&p, ChatType::Direct, "u", "u", false);
        assert!(!d.allowed);
        assert_eq!(d.reason, "dm disabled");
    }

    #[test]
    fn allowlist_dm_checks_sender() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Allowlist;
        p.allow_from = vec!["alice".into()];
        assert!(evaluate(&p, ChatType::Direct, "alice", "alice", false).allowed);
        assert!(!evaluate(&p, ChatType::Direct, "bob", "bob", false).allowed);
    }

    #[test]
    fn empty_dm_allowlist_denies_everyone() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Allowlist;
        assert!(!evaluate(&p, ChatType::Direct, "anyone", "anyone", false).allowed);
    }

    #[test]
    fn wildcard_entry_admits_everyone() {
        let mut p = policy();
        p.dm_policy = DmPolicy::Allowlist;
        p.allow_from = vec!["*".into()];
        assert!(evaluate(&p, ChatType::Direct, "anyone", "anyone", false).allowed);
    }

    #[test]
    fn group_requires_mention_by_default() {
        let p = policy();
        let d = evaluate(&p, ChatType::Group, "u", "grp", false);
        assert_eq!(d.reason, "not mentioned");
        assert!(evaluate(&p, ChatType::Group, "u", "grp", true).allowed);
    }

    #[test]
    fn group_mention_gate_can_be_disabled() {
        let mut p = policy();
        p.require_mention = Some(false);
        assert!(evaluate(&p, ChatType::Group, "u", "grp", false).allowed);
    }

    #[test]
    fn group_allowlist_checks_peer_not_sender() {
        let mut p = policy();
        p.group_policy = GroupPolicy::Allowlist;
        p.group_allow_from = vec!["grp1".into()];
        assert!(evaluate(&p, ChatType::Group, "u", "grp1", true).allowed);
        let d = evaluate(&p, ChatType::Group, "u", "grp2", true);
        assert_eq!(d.reason, "group not on allowlist");
    }

    #[test]
    fn groups_disabled_rejects_even_with_mention() {
        let mut p = policy();
        p.group_policy = GroupPolicy::Disabled;
        assert!(!evaluate(&p, ChatType::Group, "u", "grp", true).allowed);
    }

    #[test]
    fn empty_messages_dispatch_for_dms_and_mentions_only() {
        assert!(dispatch_when_empty(ChatType::Direct, false));
        assert!(dispatch_when_empty(ChatType::Direct, true));
        assert!(dispatch_when_empty(ChatType::Group, true));
        assert!(!dispatch_when_empty(ChatType::Group, false));
    }

    #[test]
    fn policy_deserializes_camel_case() {
        let p: PolicyConfig = serde_json::from_str(
            r#"{"dmPolicy":"allowlist","groupPolicy":"disabled","allowFrom":["a"],"requireMention":false}"#,
        )
        .unwrap();
        assert_eq!(p.dm_policy, DmPolicy::Allowlist);
        assert_eq!(p.group_policy, GroupPolicy::Disabled);
        assert_eq!(p.allow_from, vec!["a"]);
        assert_eq!(p.require_mention, Some(false));
    }

    #[test]
    fn policy_enum_strings_are_case_sensitive() {
        let parsed: Result<PolicyConfig, serde_json::Error> =
            serde_json::from_str(r#"{"dmPolicy":"Open"}"#);
        assert!(parsed.is_err());
    }
}
