//! Resolution of host-supplied `target` strings.
//!
//! A target looks like `wecom-app:user:alice@work`: an optional channel
//! prefix, an optional `user:`/`group:` type prefix, the bare peer ID, and
//! an optional `@accountId` suffix.

/// Channel tags this gateway knows about, longest first so that
/// `wecom-app:` never matches the bare `wecom:` prefix.
pub const CHANNEL_TAGS: &[&str] = &["wecom-app", "dingtalk", "feishu", "qqbot", "wecom"];

/// A parsed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub channel: String,
    pub account_id: String,
    /// Bare peer ID with all prefixes and suffixes removed.
    pub to: String,
}

/// True when the target either carries this channel's prefix or carries no
/// channel prefix at all. Targets prefixed with another channel's tag are
/// rejected.
#[must_use]
pub fn can_resolve(raw: &str, channel: &str) -> bool {
    match channel_prefix(raw) {
        Some(tag) => tag == channel,
        None => true,
    }
}

/// Parse a raw target for `channel`, defaulting the account to
/// `default_account` when the target carries no `@accountId` suffix.
/// Returns `None` for targets addressed to a different channel or with an
/// empty peer ID.
#[must_use]
pub fn resolve_target(raw: &str, channel: &str, default_account: &str) -> Option<ResolvedTarget> {
    let mut rest = raw.trim();
    if let Some(tag) = channel_prefix(rest) {
        if tag != channel {
            return None;
        }
        rest = &rest[tag.len() + 1..];
    }

    // `@accountId` suffix only counts when the suffix is a plain account
    // name — an `@` inside a URL-ish or path-ish tail is part of the ID.
    let (rest, account_id) = match rest.rsplit_once('@') {
        Some((head, suffix))
            if !suffix.is_empty() && !suffix.contains(':') && !suffix.contains('/') =>
        {
            (head, suffix.to_string())
        },
        _ => (rest, default_account.to_string()),
    };

    let bare = rest
        .strip_prefix("user:")
        .or_else(|| rest.strip_prefix("group:"))
        .unwrap_or(rest);

    if bare.is_empty() {
        return None;
    }

    Some(ResolvedTarget {
        channel: channel.to_string(),
        account_id,
        to: bare.to_string(),
    })
}

/// Batch form of [`resolve_target`]; unresolvable entries are dropped.
#[must_use]
pub fn resolve_targets(raws: &[String], channel: &str, default_account: &str) -> Vec<ResolvedTarget> {
    raws.iter()
        .filter_map(|raw| resolve_target(raw, channel, default_account))
        .collect()
}

/// Human-readable target shapes, surfaced to the host's directory UI.
#[must_use]
pub fn target_formats(channel: &str) -> Vec<String> {
    vec![
        format!("{channel}:user:<id>"),
        format!("{channel}:group:<id>"),
        format!("{channel}:<id>@<accountId>"),
        "<id>".to_string(),
    ]
}

fn channel_prefix(raw: &str) -> Option<&'static str> {
    CHANNEL_TAGS
        .iter()
        .find(|tag| {
            raw.len() > tag.len() && raw.starts_with(*tag) && raw.as_bytes()[tag.len()] == b':'
        })
        .copied()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("alice", "wecom-app", "default", "alice")]
    #[case("user:alice", "wecom-app", "default", "alice")]
    #[case("group:grp9", "qqbot", "default", "grp9")]
    #[case("wecom-app:user:alice", "wecom-app", "default", "alice")]
    #[case("wecom-app:alice@work", "wecom-app", "work", "alice")]
    #[case("dingtalk:group:cid88@main", "dingtalk", "main", "cid88")]
    fn resolves(
        #[case] raw: &str,
        #[case] channel: &str,
        #[case] account: &str,
        #[case] to: &str,
    ) {
        let t = resolve_target(raw, channel, "default").unwrap();
        assert_eq!(t.account_id, account);
        assert_eq!(t.to, to);
        assert_eq!(t.channel, channel);
    }

    #[test]
    fn foreign_channel_prefix_is_rejected() {
        assert!(resolve_target("feishu:user:ou_1", "wecom-app", "default").is_none());
        assert!(!can_resolve("feishu:user:ou_1", "wecom-app"));
        assert!(can_resolve("user:alice", "wecom-app"));
        assert!(can_resolve("wecom-app:alice", "wecom-app"));
    }

    #[test]
    fn wecom_prefix_does_not_swallow_wecom_app() {
        // `wecom-app:` must resolve for the wecom-app channel, not wecom.
        assert!(can_resolve("wecom-app:alice", "wecom-app"));
        assert!(!can_resolve("wecom-app:alice", "wecom"));
        assert!(can_resolve("wecom:alice", "wecom"));
    }

    #[test]
    fn at_suffix_with_separator_chars_is_part_of_the_id() {
        // `@` followed by a `:` or `/` is not an account suffix.
        let t = resolve_target("user:alice@host:9000", "wecom-app", "default").unwrap();
        assert_eq!(t.account_id, "default");
        assert_eq!(t.to, "alice@host:9000");
    }

    #[test]
    fn empty_peer_is_rejected() {
        assert!(resolve_target("user:", "wecom-app", "default").is_none());
        assert!(resolve_target("", "wecom-app", "default").is_none());
    }

    #[test]
    fn batch_resolution_drops_foreign_targets() {
        let raws = vec![
            "user:alice".to_string(),
            "feishu:user:ou_1".to_string(),
            "bob@work".to_string(),
        ];
        let resolved = resolve_targets(&raws, "wecom-app", "default");
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].to, "alice");
        assert_eq!(resolved[1].account_id, "work");
    }

    #[test]
    fn target_formats_name_the_channel() {
        let formats = target_formats("qqbot");
        assert!(formats.iter().any(|f| f == "qqbot:user:<id>"));
    }
}
