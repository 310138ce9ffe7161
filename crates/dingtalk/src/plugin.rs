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
        host::{DeliverFn, HostPort, ReplyBlockKind},
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
    card::{CardApi, CardStreamer},
    config::DingTalkConfig,
    normalize::{self, NormalizedMessage},
    outbound::{DingTalkOutbound, is_group_conversation},
    state::{AccountState, AccountStateMap, get_account},
    stream::{self, CallbackHandler},
    token::AppTokenSource,
};

/// DingTalk channel plugin.
pub struct DingTalkPlugin {
    accounts: AccountStateMap,
    tokens: Arc<AppTokenSource>,
    outbound: Arc<DingTalkOutbound>,
    card_api: Arc<CardApi>,
    host: HostPort,
    status_sink: Option<Arc<dyn StatusSink>>,
    gateway_base: String,
}

impl DingTalkPlugin {
    #[must_use]
    pub fn new(host: HostPort) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let tokens = Arc::new(AppTokenSource::new());
        let outbound = Arc::new(DingTalkOutbound {
            accounts: Arc::clone(&accounts),
            tokens: Arc::clone(&tokens),
            client: reqwest::Client::new(),
            oapi_base: crate::OAPI_BASE.to_string(),
        });
        let card_api = Arc::new(CardApi::new(Arc::clone(&tokens)));
        Self {
            accounts,
            tokens,
            outbound,
            card_api,
            host,
            status_sink: None,
            gateway_base: crate::API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    async fn publish_status(&self, account_id: &str, running: bool, config: Option<&DingTalkConfig>) {
        let Some(sink) = &self.status_sink else { return };
        let configured = config.is_some_and(DingTalkConfig::configured);
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

    fn message_handler(&self, account_id: String) -> CallbackHandler {
        let ctx = HandlerContext {
            accounts: Arc::clone(&self.accounts),
            tokens: Arc::clone(&self.tokens),
            outbound: Arc::clone(&self.outbound),
            card_api: Arc::clone(&self.card_api),
            host: self.host.clone(),
        };
        Arc::new(move |data| {
            let ctx = ctx.clone();
            let account_id = account_id.clone();
            Box::pin(async move {
                handle_robot_message(ctx, account_id, data).await;
            })
        })
    }
}

#[derive(Clone)]
struct HandlerContext {
    accounts: AccountStateMap,
    tokens: Arc<AppTokenSource>,
    outbound: Arc<DingTalkOutbound>,
    card_api: Arc<CardApi>,
    host: HostPort,
}

async fn handle_robot_message(ctx: HandlerContext, account_id: String, data: serde_json::Value) {
    let Some(state) = get_account(&ctx.accounts, &account_id) else {
        return;
    };
    let message = match normalize::parse_robot_message(&data) {
        Ok(message) => message,
        Err(e) => {
            debug!(account_id, error = %e, "undecodable robot message");
            return;
        },
    };
    let normalized = match normalize::build_envelope(&state, &ctx.tokens, message).await {
        Ok(Some(normalized)) => normalized,
        Ok(None) => return,
        Err(e) => {
            warn!(account_id, error = %e, "normalize failed");
            return;
        },
    };

    let NormalizedMessage {
        envelope,
        session_webhook,
    } = normalized;

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

    let result = if state.config.enable_ai_card {
        let deliver = card_deliverer(&ctx, &state, &envelope.peer_id, envelope.chat_type);
        dispatch::dispatch_inbound_with_deliver(&ctx.host, envelope, opts, deliver).await
    } else {
        let send_chunk = text_send_chunk(&ctx, &state, session_webhook, envelope.peer_id.clone());
        dispatch::dispatch_inbound(&ctx.host, envelope, opts, send_chunk).await
    };
    if let Err(e) = result {
        warn!(account_id, error = %e, "dispatch failed");
    }
}

/// Plain-text reply path: session webhook when present, active send
/// otherwise.
fn text_send_chunk(
    ctx: &HandlerContext,
    state: &Arc<AccountState>,
    session_webhook: Option<String>,
    peer_id: String,
) -> SendChunkFn {
    let outbound = Arc::clone(&ctx.outbound);
    let state = Arc::clone(state);
    Arc::new(move |chunk, _kind| {
        let outbound = Arc::clone(&outbound);
        let state = Arc::clone(&state);
        let session_webhook = session_webhook.clone();
        let peer_id = peer_id.clone();
        Box::pin(async move {
            match session_webhook.as_deref() {
                Some(webhook) => outbound.send_webhook_text(&state, webhook, &chunk).await?,
                None => outbound.send_active_text(&state, &peer_id, &chunk).await?,
            }
            Ok(())
        })
    })
}

/// AI-card reply path. Blocks carry the accumulated reply; interim blocks
/// stream, the final block finalizes. Card failures finish the card with a
/// banner and fall back to plain messages.
fn card_deliverer(
    ctx: &HandlerContext,
    state: &Arc<AccountState>,
    peer_id: &str,
    chat_type: ChatType,
) -> DeliverFn {
    struct CardSlot {
        card: Option<CardStreamer>,
        failed: bool,
    }

    let slot = Arc::new(tokio::sync::Mutex::new(CardSlot {
        card: None,
        failed: false,
    }));
    let card_api = Arc::clone(&ctx.card_api);
    let outbound = Arc::clone(&ctx.outbound);
    let state = Arc::clone(state);
    let peer_id = peer_id.to_string();
    let is_group = chat_type == ChatType::Group || is_group_conversation(&peer_id);

    Arc::new(move |block| {
        let slot = Arc::clone(&slot);
        let card_api = Arc::clone(&card_api);
        let outbound = Arc::clone(&outbound);
        let state = Arc::clone(&state);
        let peer_id = peer_id.clone();
        Box::pin(async move {
            if block.kind == ReplyBlockKind::Typing {
                return Ok(());
            }
            let mut slot = slot.lock().await;

            // After a card failure the final reply goes out as plain text.
            if slot.failed {
                if block.kind == ReplyBlockKind::Final && !block.text.is_empty() {
                    outbound.send_active_text(&state, &peer_id, &block.text).await?;
                }
                return Ok(());
            }

            if slot.card.is_none() {
                match CardStreamer::start(
                    Arc::clone(&card_api),
                    state.config.clone(),
                    is_group,
                    &peer_id,
                )
                .await
                {
                    Ok(card) => slot.card = Some(card),
                    Err(e) => {
                        warn!(account_id = state.account_id, error = %e, "card create failed");
                        slot.failed = true;
                        if block.kind == ReplyBlockKind::Final && !block.text.is_empty() {
                            outbound.send_active_text(&state, &peer_id, &block.text).await?;
                        }
                        return Ok(());
                    },
                }
            }

            let Some(card) = slot.card.as_mut() else {
                return Ok(());
            };
            let result = match block.kind {
                ReplyBlockKind::Final => card.finalize(&block.text).await,
                _ => card.update(&block.text).await,
            };
            if let Err(e) = result {
                warn!(account_id = state.account_id, error = %e, "card update failed");
                card.fail("（卡片更新失败，以下为完整回复）").await;
                slot.failed = true;
                let accumulated = card.accumulated().to_string();
                let fallback = if block.text.is_empty() { accumulated } else { block.text.clone() };
                if !fallback.is_empty() {
                    outbound.send_active_text(&state, &peer_id, &fallback).await?;
                }
            }
            Ok(())
        })
    })
}

#[async_trait]
impl ChannelPlugin for DingTalkPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "DingTalk"
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
        let config: DingTalkConfig = serde_json::from_value(config)?;
        if !config.configured() {
            anyhow::bail!("dingtalk account {account_id} is missing clientId/clientSecret");
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
        };
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), Arc::new(state));
        }

        let handler = self.message_handler(account_id.to_string());
        let gateway_base = self.gateway_base.clone();
        tokio::spawn(stream::run_stream(gateway_base, config.clone(), handler, cancel));

        info!(account_id, "dingtalk account started (stream mode)");
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
                info!(account_id, "dingtalk account stopped");
                self.publish_status(account_id, false, Some(&state.config)).await;
            },
            None => warn!(account_id, "dingtalk account not found"),
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
impl ChannelStatus for DingTalkPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let state = get_account(&self.accounts, account_id);
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
                details: Some(format!("app {}", state.config.client_id)),
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
