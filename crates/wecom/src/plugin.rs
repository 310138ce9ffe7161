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
    config::WeComRobotConfig,
    responder::Responder,
    state::{AccountState, AccountStateMap},
    webhook::{WebhookContext, make_handler},
};

/// WeCom AI-robot channel plugin.
pub struct WeComRobotPlugin {
    accounts: AccountStateMap,
    responder: Arc<Responder>,
    registrar: Arc<dyn RouteRegistrar>,
    host: HostPort,
    status_sink: Option<Arc<dyn StatusSink>>,
}

impl WeComRobotPlugin {
    #[must_use]
    pub fn new(host: HostPort, registrar: Arc<dyn RouteRegistrar>) -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            responder: Arc::new(Responder::new()),
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

    async fn publish_status(&self, account_id: &str, running: bool, configured: bool) {
        let Some(sink) = &self.status_sink else { return };
        sink.publish(AccountStatus {
            channel: CHANNEL_ID.to_string(),
            account_id: account_id.to_string(),
            running,
            configured,
            // No corp credentials — the robot can only answer callbacks.
            can_send_active: false,
            updated_at_ms: now_ms(),
        })
        .await;
    }
}

#[async_trait]
impl ChannelPlugin for WeComRobotPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "WeCom AI Robot"
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: &[ChatType::Direct, ChatType::Group],
            media: true,
            reply: true,
            active_send: false,
        }
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: WeComRobotConfig = serde_json::from_value(config)?;
        if !config.configured() {
            anyhow::bail!("wecom account {account_id} is missing token/encodingAESKey");
        }
        let aes_key = AesKey::decode(&config.encoding_aes_key)
            .map_err(|e| anyhow::anyhow!("wecom account {account_id}: {e}"))?;

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
            responder: Arc::clone(&self.responder),
            host: self.host.clone(),
        };
        let get_route = self.registrar.register(
            "GET",
            &path,
            make_handler(account_id.to_string(), ctx.clone()),
        )?;
        let post_route =
            match self
                .registrar
                .register("POST", &path, make_handler(account_id.to_string(), ctx))
            {
                Ok(route) => route,
                Err(e) => {
                    self.registrar.unregister(&get_route);
                    return Err(e);
                },
            };

        let state = AccountState {
            account_id: account_id.to_string(),
            aes_key,
            media: Arc::new(MediaService::new(media_config)),
            cancel: CancellationToken::new(),
            routes: vec![get_route, post_route],
            config,
        };
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), Arc::new(state));
        }
        info!(account_id, path, "wecom robot account started");
        self.publish_status(account_id, true, true).await;
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
                info!(account_id, "wecom robot account stopped");
                self.publish_status(account_id, false, state.config.configured())
                    .await;
            },
            None => warn!(account_id, "wecom robot account not found"),
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        // Replies ride the per-message response URL only.
        None
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for WeComRobotPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        let running = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts.contains_key(account_id)
        };
        Ok(ChannelHealthSnapshot {
            connected: running,
            account_id: account_id.to_string(),
            details: if running {
                Some("webhook registered".into())
            } else {
                Some("account not started".into())
            },
        })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        sinobridge_channels::{
            host::{
                AgentRoute, AgentRouter, DeliverFn, EnvelopeFormat, InboundSessionEntry,
                ReplyContext, ReplyPort, RouteRequest, SessionAnchor, SessionPort,
            },
            webhook::MemoryRouter,
        },
    };

    struct NullHost;
    #[async_trait]
    impl AgentRouter for NullHost {
        async fn resolve_agent_route(&self, req: RouteRequest) -> Result<AgentRoute> {
            Ok(AgentRoute {
                session_key: req.peer_id,
                account_id: req.account_id,
                agent_id: "main".into(),
                main_session_key: None,
            })
        }
    }
    #[async_trait]
    impl SessionPort for NullHost {
        async fn read_updated_at(&self, _k: &str) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn record_inbound(&self, _e: InboundSessionEntry) -> Result<()> {
            Ok(())
        }
        async fn record_outbound_route(&self, _a: SessionAnchor) -> Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl ReplyPort for NullHost {
        async fn dispatch_reply(&self, _c: ReplyContext, _d: DeliverFn) -> Result<()> {
            Ok(())
        }
        fn format_agent_envelope(&self, f: EnvelopeFormat<'_>) -> String {
            f.body.to_string()
        }
        async fn mark_dispatch_idle(&self, _s: &str) {}
    }

    fn host() -> HostPort {
        HostPort {
            router: Arc::new(NullHost),
            sessions: Arc::new(NullHost),
            reply: Arc::new(NullHost),
        }
    }

    #[tokio::test]
    async fn lifecycle_registers_and_releases_routes() {
        use base64::Engine as _;
        let key = base64::engine::general_purpose::STANDARD
            .encode([2u8; 32])
            .trim_end_matches('=')
            .to_string();
        let router = Arc::new(MemoryRouter::new());
        let mut plugin = WeComRobotPlugin::new(host(), Arc::clone(&router) as _);

        plugin
            .start_account(
                "default",
                serde_json::json!({"token": "t", "encodingAESKey": key}),
            )
            .await
            .unwrap();
        assert_eq!(router.route_count(), 2);
        assert!(plugin.probe("default").await.unwrap().connected);

        plugin.stop_account("default").await.unwrap();
        assert_eq!(router.route_count(), 0);
        assert!(!plugin.probe("default").await.unwrap().connected);
    }

    #[tokio::test]
    async fn unconfigured_account_does_not_start() {
        let router = Arc::new(MemoryRouter::new());
        let mut plugin = WeComRobotPlugin::new(host(), router as _);
        assert!(
            plugin
                .start_account("default", serde_json::json!({"token": "t"}))
                .await
                .is_err()
        );
    }
}
