use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use {
    sinobridge_asr::Transcriber,
    sinobridge_channels::webhook::RouteHandle,
    sinobridge_media::MediaService,
    tokio_util::sync::CancellationToken,
};

use crate::config::QqBotConfig;

pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

pub struct AccountState {
    pub account_id: String,
    pub config: QqBotConfig,
    pub media: Arc<MediaService>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub cancel: CancellationToken,
    pub routes: Vec<RouteHandle>,
    /// Per-reply sequence numbers: passive replies to one `msg_id` must
    /// carry increasing `msg_seq` values.
    pub msg_seq: Mutex<HashMap<String, u32>>,
    /// Recently seen event ids for webhook retry dedupe.
    pub seen: Mutex<std::collections::VecDeque<String>>,
}

pub(crate) const SEEN_CAPACITY: usize = 256;

impl AccountState {
    pub fn next_msg_seq(&self, msg_id: &str) -> u32 {
        let mut map = self.msg_seq.lock().unwrap_or_else(|e| e.into_inner());
        let seq = map.entry(msg_id.to_string()).or_insert(0);
        *seq += 1;
        // The map is per-message and short-lived; cap it so long sessions
        // do not grow it unbounded.
        if map.len() > 1024 {
            map.clear();
        }
        *seq
    }

    pub fn is_duplicate(&self, event_id: &str) -> bool {
        if event_id.is_empty() {
            return false;
        }
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.iter().any(|id| id == event_id) {
            return true;
        }
        if seen.len() >= SEEN_CAPACITY {
            seen.pop_front();
        }
        seen.push_back(event_id.to_string());
        false
    }
}

pub(crate) fn get_account(map: &AccountStateMap, account_id: &str) -> Option<Arc<AccountState>> {
    let accounts = map.read().unwrap_or_else(|e| e.into_inner());
    accounts.get(account_id).cloned()
}
