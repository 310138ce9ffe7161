use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use {
    anyhow::Result,
    async_trait::async_trait,
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
    sinobridge_wecom_crypto::AesKey,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    CHANNEL_ID,
    config::WeComAppConfig,
    outbound::WeComAppOutbound,
    state::{AccountState, AccountStateMap},
    token::CorpTokenSource,
    webhook::{WebhookContext, make_handler},
};

/// WeCom self-built application channel plugin.
pub struct WeComAppPlugin {
    accounts: AccountStateMap,
    tokens: Arc<CorpTokenSource>,
    outbound: Arc<WeComAppOutbound>,
    registrar: Arc<dyn RouteRegistrar>,
    host: HostPort,
    status_sink: Option<Arc<dyn StatusSink>>,
}

impl WeComAppPlugin {
    #[must_use]
    pub fn new(host: HostPort, registrar: Arc<dyn RouteRegistrar>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let tokens = Arc::new(CorpTokenSource::new());
        let outbound = Arc::new(WeComAppOutbound {
            accounts: Arc::clone(&accounts),
            tokens: Arc::clone(&tokens),
            client: reqwest::Client::new(),
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

    /// Override the API base (tests point it at a local server).
    #[must_use]
    pub fn with_api_base(mut self, base_url: String) -> Self {
        let tokens = Arc::new(CorpTokenSource::new().with_base_url(base_url));
        self.tokens = Arc::clone(&tokens);
        self.outbound = Arc::new(WeComAppOutbound {
            accounts: Arc::clone(&self.accounts),
            tokens,
            client: reqwest::Client::new(),
        });
        self
    }

    async fn publish_status(&self, account_id: &str, running: bool, config: Option<&WeComAppConfig>) {
        let Some(sink) = &self.status_sink else { return };
        sink.publish(AccountStatus {
            channel: CHANNEL_ID.to_string(),
            account_id: account_id.to_string(),
            running,
            configured: config.is_some_and(WeComAppConfig::configured),
            can_send_active: config.is_some_and(WeComAppConfig::can_send_active),
            updated_at_ms: now_ms(),
        })
        .await;
    }

    fn media_service(account_id: &str, config: &WeComAppConfig) -> MediaService {
        let media_root = config
            .inbound_media
            .dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from("data/media").join(CHANNEL_ID).join(account_id)
            });
        let mut media_config = MediaConfig::new(media_root.join("tmp"), media_root);
        media_config.max_bytes = config.inbound_media.max_bytes;
        media_config.keep_days = config.inbound_media.keep_days;
        MediaService::new(media_config)
    }
}

#[async_trait]
impl ChannelPlugin for WeComAppPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "WeCom App"
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: &[ChatType::Direct],
            media: true,
            reply: true,
            active_send: true,
        }
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: WeComAppConfig = serde_json::from_value(config)?;
        if !config.configured() {
            anyhow::bail!("wecom-app account {account_id} is missing callback credentials");
        }
        sinobridge_config::validate_agent_id(&serde_json::json!(config.agent_id))
            .map_err(|e| anyhow::anyhow!("wecom-app account {account_id}: {e}"))?;
        let aes_key = AesKey::decode(&config.encoding_aes_key)
            .map_err(|e| anyhow::anyhow!("wecom-app account {account_id}: {e}"))?;

        let path = config.webhook_path_for(account_id);
        let ctx = WebhookContext {
            accounts: Arc::clone(&self.accounts),
            tokens: Arc::clone(&self.tokens),
            outbound: Arc::clone(&self.outbound),
            host: self.host.clone(),
        };
        let get_route =
            self.registrar
                .register("GET", &path, make_handler(account_id.to_string(), ctx.clone()))?;
        let post_route = match self.registrar.register(
            "POST",
            &path,
            make_handler(account_id.to_string(), ctx),
        ) {
            Ok(route) => route,
            Err(e) => {
                self.registrar.unregister(&get_route);
                return Err(e);
            },
        };

        let state = AccountState {
            account_id: account_id.to_string(),
            media: Arc::new(Self::media_service(account_id, &config)),
            aes_key,
            cancel: CancellationToken::new(),
            routes: vec![get_route, post_route],
            config: config.clone(),
        };
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), Arc::new(state));
        }

        info!(account_id, path, "wecom-app account started");
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
                info!(account_id, "wecom-app account stopped");
                self.publish_status(account_id, false, Some(&state.config)).await;
            },
            None => {
                warn!(account_id, "wecom-app account not found");
            },
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
impl ChannelStatus for WeComAppPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let state = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts.get(account_id).cloned()
        };
        let Some(state) = state else {
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
                details: Some(format!("corp {}", state.config.corp_id)),
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
