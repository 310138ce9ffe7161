use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    sinobridge_channels::webhook::RouteHandle,
    sinobridge_media::MediaService,
    sinobridge_wecom_crypto::AesKey,
    tokio_util::sync::CancellationToken,
};

use crate::config::WeComRobotConfig;

pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

pub struct AccountState {
    pub account_id: String,
    pub config: WeComRobotConfig,
    pub aes_key: AesKey,
    pub media: Arc<MediaService>,
    pub cancel: CancellationToken,
    pub routes: Vec<RouteHandle>,
}

pub(crate) fn get_account(map: &AccountStateMap, account_id: &str) -> Option<Arc<AccountState>> {
    let accounts = map.read().unwrap_or_else(|e| e.into_inner());
    accounts.get(account_id).cloned()
}
