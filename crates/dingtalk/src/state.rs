use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {sinobridge_media::MediaService, tokio_util::sync::CancellationToken};

use crate::config::DingTalkConfig;

pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

pub struct AccountState {
    pub account_id: String,
    pub config: DingTalkConfig,
    pub media: Arc<MediaService>,
    pub cancel: CancellationToken,
}

pub(crate) fn get_account(map: &AccountStateMap, account_id: &str) -> Option<Arc<AccountState>> {
    let accounts = map.read().unwrap_or_else(|e| e.into_inner());
    accounts.get(account_id).cloned()
}
