use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use {sinobridge_media::MediaService, tokio_util::sync::CancellationToken};

use crate::config::FeishuConfig;

pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

/// Retained message-id window for duplicate suppression (the platform
/// redelivers on slow acks).
pub(crate) const SEEN_CAPACITY: usize = 256;

pub struct AccountState {
    pub account_id: String,
    pub config: FeishuConfig,
    pub media: Arc<MediaService>,
    pub cancel: CancellationToken,
    /// Recently seen message ids, oldest first.
    pub seen: Mutex<std::collections::VecDeque<String>>,
}

impl AccountState {
    /// Record a message id; true when it was already seen.
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.iter().any(|id| id == message_id) {
            return true;
        }
        if seen.len() >= SEEN_CAPACITY {
            seen.pop_front();
        }
        seen.push_back(message_id.to_string());
        false
    }
}

pub(crate) fn get_account(map: &AccountStateMap, account_id: &str) -> Option<Arc<AccountState>> {
    let accounts = map.read().unwrap_or_else(|e| e.into_inner());
    accounts.get(account_id).cloned()
}
