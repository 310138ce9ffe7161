use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    secrecy::SecretBox,
    sinobridge_asr::{TencentFlashAsr, TencentFlashConfig, Transcriber},
    sinobridge_channels::{
        host::HostPort,
        plugin::{
            AccountStatus, ChannelCapabilities, ChannelHealthSnapshot, ChannelOutbound,
            ChannelPlugin, ChannelStatus, StatusSink,
        },
        webhook::RouteRegistrar,
    },
    sinobridge_common::types::ChatType,
    sinobridge_media::{MediaConfig, MediaService},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    CHANNEL_ID,
    config::QqBotConfig,
    outbound::QqBotOutbound,
    state::{AccountState, AccountStateMap, get_account},
    token::AppTokenSource,
    webhook::{WebhookContext, make_handler},
};

/// QQ Open Platform channel plugin.
pub struct QqBotPlugin {
    accounts: AccountStateMap,
    tokens: Arc<AppTokenSource>,
    outbound: Arc<QqBotOutbound>,
    registrar: Arc<dyn RouteRegistrar>,
    host: HostPort,
    status_sink: Option<Arc<dyn StatusSink>>,
}

impl QqBotPlugin {
    #[must_use]
    pub fn new(host: HostPort, registrar: Arc<dyn RouteRegistrar>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let tokens = Arc::new(AppTokenSource::new());
        let outbound = Arc::new(QqBotOutbound {
            accounts: Arc::clone(&accounts),
            tokens: Arc::clone(&tokens),
            client: reqwest::Client::new(),
            api_base: crate::API_BASE.to_string(),
        });
        Self {
            accounts,
            tokens,
            outbound,
            registrar,
            host,
            status_sink: None,
        }
    }

    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    async fn publish_status(&self, account_id: &str, running: bool, config: Option<&QqBotConfig>) {
        let Some(sink) = &self.status_sink else { return };
        let configured = config.is_some_and(QqBotConfig::configured);
        sink.publish(AccountStatus {
            channel: CHANNEL_ID.to_string(),
            account_id: account_id.to_string(),
            running,
            configured,
            can_send_active: configured,
            updated_at_ms: now_ms(),
        })
        .await;
    }

    fn transcriber_for(config: &QqBotConfig) -> Option<Arc<dyn Transcriber>> {
        if !config.asr.usable() {
            return None;
        }
        Some(Arc::new(TencentFlashAsr::new(TencentFlashConfig::new(
            config.asr.app_id.clone(),
            config.asr.secret_id.clone(),
            SecretBox::new(Box::new(config.asr.secret_key.clone())),
        ))))
    }
}

#[async_trait]
impl ChannelPlugin for QqBotPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "QQ Bot"
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: &[ChatType::Direct, ChatType::Group],
            media: true,
            reply: true,
            active_send: true,
        }
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: QqBotConfig = serde_json::from_value(config)?;
        if !config.configured() {
            anyhow::bail!("qqbot account {account_id} is missing appId/clientSecret");
        }

        let media_root = config
            .media_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/media").join(CHANNEL_ID).join(account_id));
        let mut media_config = MediaConfig::new(media_root.join("tmp"), media_root);
        if let Some(mb) = config.max_file_size_mb {
            media_config.max_bytes = mb.saturating_mul(1024 * 1024);
        }

        let path = config.webhook_path_for(account_id);
        let ctx = WebhookContext {
            accounts: Arc::clone(&self.accounts),
            outbound: Arc::clone(&self.outbound),
            host: self.host.clone(),
        };
        let post_route =
            self.registrar
                .register("POST", &path, make_handler(account_id.to_string(), ctx))?;

        let state = AccountState {
            account_id: account_id.to_string(),
            transcriber: Self::transcriber_for(&config),
            media: Arc::new(MediaService::new(media_config)),
            cancel: CancellationToken::new(),
            routes: vec![post_route],
            msg_seq: std::sync::Mutex::new(HashMap::new()),
            seen: std::sync::Mutex::new(std::collections::VecDeque::new()),
            config: config.clone(),
        };
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), Arc::new(state));
        }

        info!(account_id, path, "qqbot account started");
        self.publish_status(account_id, true, Some(&config)).await;
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let removed = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };
        match removed {
            Some(state) => {
                state.cancel.cancel();
                for route in &state.routes {
                    self.registrar.unregister(route);
                }
                info!(account_id, "qqbot account stopped");
                self.publish_status(account_id, false, Some(&state.config)).await;
            },
            None => warn!(account_id, "qqbot account not found"),
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(self.outbound.as_ref())
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for QqBotPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let Some(state) = get_account(&self.accounts, account_id) else {
            return Ok(ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            });
        };
        match self.tokens.access_token(&state.config).await {
            Ok(_) => Ok(ChannelHealthSnapshot {
                connected: true,
                account_id: account_id.to_string(),
                details: Some(format!("app {}", state.config.app_id)),
            }),
            Err(e) => Ok(ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some(format!("token error: {e}")),
            }),
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
