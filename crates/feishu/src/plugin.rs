use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    sinobridge_channels::{
        dispatch::{self, DispatchOptions, SendChunkFn},
        gating,
        host::HostPort,
        plugin::{
            AccountStatus, ChannelCapabilities, ChannelHealthSnapshot, ChannelOutbound,
            ChannelPlugin, ChannelStatus, StatusSink,
        },
        text::{self, TableMode},
    },
    sinobridge_common::types::ChatType,
    sinobridge_media::{MediaConfig, MediaService},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    CHANNEL_ID, CHANNEL_LABEL,
    config::FeishuConfig,
    normalize,
    outbound::FeishuOutbound,
    state::{AccountState, AccountStateMap, get_account},
    token::TenantTokenSource,
    ws::{self, EventHandler},
};

/// Feishu channel plugin.
pub struct FeishuPlugin {
    accounts: AccountStateMap,
    tokens: Arc<TenantTokenSource>,
    outbound: Arc<FeishuOutbound>,
    host: HostPort,
    status_sink: Option<Arc<dyn StatusSink>>,
    api_base: String,
}

impl FeishuPlugin {
    #[must_use]
    pub fn new(host: HostPort) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let tokens = Arc::new(TenantTokenSource::new());
        let outbound = Arc::new(FeishuOutbound {
            accounts: Arc::clone(&accounts),
            tokens: Arc::clone(&tokens),
            client: reqwest::Client::new(),
        });
        Self {
            accounts,
            tokens,
            outbound,
            host,
            status_sink: None,
            api_base: crate::API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    async fn publish_status(&self, account_id: &str, running: bool, config: Option<&FeishuConfig>) {
        let Some(sink) = &self.status_sink else { return };
        let configured = config.is_some_and(FeishuConfig::configured);
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

    fn event_handler(&self, account_id: String) -> EventHandler {
        let accounts = Arc::clone(&self.accounts);
        let tokens = Arc::clone(&self.tokens);
        let outbound = Arc::clone(&self.outbound);
        let host = self.host.clone();
        Arc::new(move |event| {
            let accounts = Arc::clone(&accounts);
            let tokens = Arc::clone(&tokens);
            let outbound = Arc::clone(&outbound);
            let host = host.clone();
            let account_id = account_id.clone();
            Box::pin(async move {
                handle_event(accounts, tokens, outbound, host, account_id, event).await;
            })
        })
    }
}

async fn handle_event(
    accounts: AccountStateMap,
    tokens: Arc<TenantTokenSource>,
    outbound: Arc<FeishuOutbound>,
    host: HostPort,
    account_id: String,
    event: serde_json::Value,
) {
    let Some(state) = get_account(&accounts, &account_id) else {
        return;
    };
    let event = match normalize::parse_event(&event) {
        Ok(event) => event,
        Err(e) => {
            debug!(account_id, error = %e, "undecodable receive event");
            return;
        },
    };

    // The platform redelivers when acks are slow; drop repeats.
    if state.is_duplicate(&event.message.message_id) {
        debug!(account_id, message_id = event.message.message_id, "duplicate event dropped");
        return;
    }

    let envelope = match normalize::build_envelope(&state, &tokens, &event).await {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return,
        Err(e) => {
            warn!(account_id, error = %e, "normalize failed");
            return;
        },
    };

    let decision = gating::evaluate(
        &state.config.policy,
        envelope.chat_type,
        &envelope.sender_id,
        &envelope.peer_id,
        envelope.was_mentioned,
    );
    if !decision.allowed {
        debug!(
            account_id,
            sender_id = envelope.sender_id,
            reason = decision.reason,
            "inbound denied by policy"
        );
        return;
    }

    let opts = DispatchOptions {
        channel_label: CHANNEL_LABEL.to_string(),
        chunk_limit: text::resolve_chunk_limit(CHANNEL_ID, state.config.text_chunk_limit),
        table_mode: TableMode::Bullets,
        final_only: state.config.reply_final_only,
    };
    let send_chunk = reply_send_chunk(&outbound, &state, envelope.peer_id.clone());
    if let Err(e) = dispatch::dispatch_inbound(&host, envelope, opts, send_chunk).await {
        warn!(account_id, error = %e, "dispatch failed");
    }
}

fn reply_send_chunk(
    outbound: &Arc<FeishuOutbound>,
    state: &Arc<AccountState>,
    peer_id: String,
) -> SendChunkFn {
    let outbound = Arc::clone(outbound);
    let state = Arc::clone(state);
    Arc::new(move |chunk, _kind| {
        let outbound = Arc::clone(&outbound);
        let state = Arc::clone(&state);
        let peer_id = peer_id.clone();
        Box::pin(async move {
            outbound.send_text_chunks(&state, &peer_id, &chunk).await?;
            Ok(())
        })
    })
}

#[async_trait]
impl ChannelPlugin for FeishuPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "Feishu"
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
        let config: FeishuConfig = serde_json::from_value(config)?;
        if !config.configured() {
            anyhow::bail!("feishu account {account_id} is missing appId/appSecret");
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

        let cancel = CancellationToken::new();
        let state = AccountState {
            account_id: account_id.to_string(),
            config: config.clone(),
            media: Arc::new(MediaService::new(media_config)),
            cancel: cancel.clone(),
            seen: std::sync::Mutex::new(std::collections::VecDeque::new()),
        };
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), Arc::new(state));
        }

        let handler = self.event_handler(account_id.to_string());
        tokio::spawn(ws::run_long_connection(
            self.api_base.clone(),
            config.clone(),
            handler,
            cancel,
        ));

        info!(account_id, "feishu account started (long connection)");
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
                info!(account_id, "feishu account stopped");
                self.publish_status(account_id, false, Some(&state.config)).await;
            },
            None => warn!(account_id, "feishu account not found"),
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
impl ChannelStatus for FeishuPlugin {
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
