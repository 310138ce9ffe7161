use crate::resolve::ResolvedAccount;

/// What a config change means for one channel's running accounts.
#[derive(Debug, Default, PartialEq)]
pub struct ReloadPlan {
    /// Accounts to stop (removed, disabled, or changed).
    pub stop: Vec<String>,
    /// Accounts to start, with their merged params (added, enabled, or
    /// changed).
    pub start: Vec<(String, serde_json::Value)>,
}

impl ReloadPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.start.is_empty()
    }
}

fn runnable(account: &ResolvedAccount) -> bool {
    account.enabled && account.configured
}

/// Diff two resolutions of the same channel. Changed accounts appear in
/// both lists; callers stop before starting.
#[must_use]
pub fn diff_accounts(old: &[ResolvedAccount], new: &[ResolvedAccount]) -> ReloadPlan {
    let mut plan = ReloadPlan::default();

    for prev in old.iter().filter(|a| runnable(a)) {
        let next = new.iter().find(|a| a.account_id == prev.account_id);
        match next {
            Some(next) if runnable(next) && next.params == prev.params => {},
            _ => plan.stop.push(prev.account_id.clone()),
        }
    }

    for next in new.iter().filter(|a| runnable(a)) {
        let prev = old.iter().find(|a| a.account_id == next.account_id);
        let unchanged = prev.is_some_and(|p| runnable(p) && p.params == next.params);
        if !unchanged {
            plan.start.push((next.account_id.clone(), next.params.clone()));
        }
    }

    plan
}
