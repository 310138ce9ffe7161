//! Dispatch coordinator: the channel-neutral glue between one normalized
//! inbound envelope and the host's buffered reply stream.
//!
//! For every admitted message the coordinator resolves the agent route,
//! records session entries, formats the agent-facing body, and hands the
//! host a `deliver` callback that converts tables, chunks to the platform
//! limit, and sends each chunk. Send failures are logged per block kind and
//! never interrupt the stream.

use std::sync::Arc;

use {anyhow::Result, futures::future::BoxFuture, tracing::warn};

use sinobridge_common::types::InboundEnvelope;

use crate::{
    host::{
        DeliverFn, EnvelopeFormat, HostPort, InboundSessionEntry, ReplyBlock, ReplyBlockKind,
        ReplyContext, RouteRequest, SessionAnchor,
    },
    text::{self, TableMode},
};

/// Per-message send function supplied by the channel: one chunk out.
pub type SendChunkFn =
    Arc<dyn Fn(String, ReplyBlockKind) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-channel knobs for the deliver callback.
#[derive(Clone)]
pub struct DispatchOptions {
    /// Label used in the agent-facing envelope (e.g. "DingTalk").
    pub channel_label: String,
    pub chunk_limit: usize,
    pub table_mode: TableMode,
    /// Suppress typing/interim blocks.
    pub final_only: bool,
}

/// Run the full dispatch sequence with the default chunked-text deliverer.
pub async fn dispatch_inbound(
    host: &HostPort,
    envelope: InboundEnvelope,
    opts: DispatchOptions,
    send_chunk: SendChunkFn,
) -> Result<()> {
    let deliver = chunked_deliverer(&envelope, &opts, send_chunk);
    dispatch_inbound_with_deliver(host, envelope, opts, deliver).await
}

/// Run the dispatch sequence with a custom deliverer (DingTalk substitutes
/// the AI-card updater here).
pub async fn dispatch_inbound_with_deliver(
    host: &HostPort,
    envelope: InboundEnvelope,
    opts: DispatchOptions,
    deliver: DeliverFn,
) -> Result<()> {
    let route = host
        .router
        .resolve_agent_route(RouteRequest {
            channel: envelope.channel.clone(),
            account_id: envelope.account_id.clone(),
            peer_id: envelope.peer_id.clone(),
            chat_type: envelope.chat_type,
        })
        .await?;

    let previous_timestamp_ms = host.sessions.read_updated_at(&route.session_key).await?;

    host.sessions
        .record_inbound(InboundSessionEntry {
            session_key: route.session_key.clone(),
            channel: envelope.channel.clone(),
            account_id: envelope.account_id.clone(),
            peer_id: envelope.peer_id.clone(),
            chat_type: envelope.chat_type,
            timestamp_ms: envelope.timestamp_ms,
        })
        .await?;

    // DMs also refresh the last-outbound anchor so host-initiated messages
    // route back to this peer.
    if envelope.chat_type.is_direct() {
        host.sessions
            .record_outbound_route(SessionAnchor {
                session_key: route.session_key.clone(),
                channel: envelope.channel.clone(),
                to: envelope.peer_id.clone(),
                account_id: envelope.account_id.clone(),
            })
            .await?;
    }

    let agent_body = host.reply.format_agent_envelope(EnvelopeFormat {
        channel_label: &opts.channel_label,
        sender_name: envelope.sender_name.as_deref().unwrap_or(&envelope.sender_id),
        body: &envelope.raw_body,
        previous_timestamp_ms,
    });

    let session_key = route.session_key.clone();
    let ctx = ReplyContext {
        envelope,
        route,
        agent_body,
        final_only: opts.final_only,
    };

    let result = host.reply.dispatch_reply(ctx, deliver).await;
    host.reply.mark_dispatch_idle(&session_key).await;
    result
}

/// Build the default deliver callback: convert tables, chunk, send each
/// chunk in order; log failures per block kind without aborting.
#[must_use]
pub fn chunked_deliverer(
    envelope: &InboundEnvelope,
    opts: &DispatchOptions,
    send_chunk: SendChunkFn,
) -> DeliverFn {
    let account_id = envelope.account_id.clone();
    let peer_id = envelope.peer_id.clone();
    let opts = opts.clone();
    Arc::new(move |block: ReplyBlock| {
        let account_id = account_id.clone();
        let peer_id = peer_id.clone();
        let opts = opts.clone();
        let send_chunk = Arc::clone(&send_chunk);
        Box::pin(async move {
            if opts.final_only && block.kind != ReplyBlockKind::Final {
                return Ok(());
            }
            if block.text.is_empty() && block.kind != ReplyBlockKind::Typing {
                return Ok(());
            }

            let converted = text::convert_tables(&block.text, opts.table_mode);
            for chunk in text::chunk_markdown_text(&converted, opts.chunk_limit) {
                if let Err(e) = send_chunk(chunk, block.kind).await {
                    warn!(
                        account_id,
                        peer_id,
                        kind = block.kind.label(),
                        error = %e,
                        "reply chunk send failed"
                    );
                }
            }
            Ok(())
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::host::{AgentRoute, AgentRouter, ReplyPort, SessionPort},
        async_trait::async_trait,
        sinobridge_common::types::ChatType,
        std::sync::Mutex,
    };

    #[derive(Default)]
    struct RecordingHost {
        inbound: Mutex<Vec<InboundSessionEntry>>,
        anchors: Mutex<Vec<SessionAnchor>>,
        idle: Mutex<Vec<String>>,
        blocks: Vec<ReplyBlock>,
    }

    #[async_trait]
    impl AgentRouter for RecordingHost {
        async fn resolve_agent_route(&self, req: RouteRequest) -> Result<AgentRoute> {
            Ok(AgentRoute {
                session_key: format!("{}:{}:{}", req.channel, req.account_id, req.peer_id),
                account_id: req.account_id,
                agent_id: "main".into(),
                main_session_key: None,
            })
        }
    }

    #[async_trait]
    impl SessionPort for RecordingHost {
        async fn read_updated_at(&self, _session_key: &str) -> Result<Option<i64>> {
            Ok(Some(1000))
        }
        async fn record_inbound(&self, entry: InboundSessionEntry) -> Result<()> {
            self.inbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(entry);
            Ok(())
        }
        async fn record_outbound_route(&self, anchor: SessionAnchor) -> Result<()> {
            self.anchors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(anchor);
            Ok(())
        }
    }

    #[async_trait]
    impl ReplyPort for RecordingHost {
        async fn dispatch_reply(&self, _ctx: ReplyContext, deliver: DeliverFn) -> Result<()> {
            for block in &self.blocks {
                deliver(block.clone()).await?;
            }
            Ok(())
        }
        fn format_agent_envelope(&self, format: EnvelopeFormat<'_>) -> String {
            format!("[{} {}] {}", format.channel_label, format.sender_name, format.body)
        }
        async fn mark_dispatch_idle(&self, session_key: &str) {
            self.idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(session_key.to_string());
        }
    }

    fn host_with_blocks(blocks: Vec<ReplyBlock>) -> (Arc<RecordingHost>, HostPort) {
        let recording = Arc::new(RecordingHost {
            blocks,
            ..Default::default()
        });
        let port = HostPort {
            router: Arc::clone(&recording) as _,
            sessions: Arc::clone(&recording) as _,
            reply: Arc::clone(&recording) as _,
        };
        (recording, port)
    }

    fn envelope(chat_type: ChatType) -> InboundEnvelope {
        InboundEnvelope {
            message_id: "m1".into(),
            timestamp_ms: 123,
            chat_type,
            sender_id: "u1".into(),
            sender_name: Some("Alice".into()),
            peer_id: "cv1".into(),
            body: "hello".into(),
            raw_body: "hello".into(),
            attachments: vec![],
            was_mentioned: true,
            channel: "dingtalk".into(),
            account_id: "default".into(),
            message_sid: None,
        }
    }

    fn options() -> DispatchOptions {
        DispatchOptions {
            channel_label: "DingTalk".into(),
            chunk_limit: 4000,
            table_mode: TableMode::Keep,
            final_only: false,
        }
    }

    #[tokio::test]
    async fn full_sequence_records_session_and_sends_reply() {
        let (recording, host) = host_with_blocks(vec![ReplyBlock {
            kind: ReplyBlockKind::Final,
            text: "world".into(),
        }]);
        let sent: Arc<Mutex<Vec<(String, ReplyBlockKind)>>> = Arc::default();
        let sent_in = Arc::clone(&sent);
        let send: SendChunkFn = Arc::new(move |chunk, kind| {
            let sent = Arc::clone(&sent_in);
            Box::pin(async move {
                sent.lock().unwrap_or_else(|e| e.into_inner()).push((chunk, kind));
                Ok(())
            })
        });

        dispatch_inbound(&host, envelope(ChatType::Group), options(), send)
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "world");
        assert_eq!(recording.inbound.lock().unwrap().len(), 1);
        // Groups do not update the outbound anchor.
        assert!(recording.anchors.lock().unwrap().is_empty());
        assert_eq!(
            recording.idle.lock().unwrap().as_slice(),
            ["dingtalk:default:cv1"]
        );
    }

    #[tokio::test]
    async fn direct_messages_update_outbound_anchor() {
        let (recording, host) = host_with_blocks(vec![]);
        let send: SendChunkFn = Arc::new(|_chunk, _kind| Box::pin(async { Ok(()) }));

        dispatch_inbound(&host, envelope(ChatType::Direct), options(), send)
            .await
            .unwrap();

        let anchors = recording.anchors.lock().unwrap();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].to, "cv1");
        assert_eq!(anchors[0].channel, "dingtalk");
    }

    #[tokio::test]
    async fn final_only_suppresses_interim_blocks() {
        let (_recording, host) = host_with_blocks(vec![
            ReplyBlock {
                kind: ReplyBlockKind::Interim,
                text: "partial".into(),
            },
            ReplyBlock {
                kind: ReplyBlockKind::Final,
                text: "done".into(),
            },
        ]);
        let sent: Arc<Mutex<Vec<String>>> = Arc::default();
        let sent_in = Arc::clone(&sent);
        let send: SendChunkFn = Arc::new(move |chunk, _kind| {
            let sent = Arc::clone(&sent_in);
            Box::pin(async move {
                sent.lock().unwrap_or_else(|e| e.into_inner()).push(chunk);
                Ok(())
            })
        });

        let mut opts = options();
        opts.final_only = true;
        dispatch_inbound(&host, envelope(ChatType::Group), opts, send)
            .await
            .unwrap();

        assert_eq!(sent.lock().unwrap().as_slice(), ["done"]);
    }

    #[tokio::test]
    async fn send_errors_do_not_abort_the_stream() {
        let (recording, host) = host_with_blocks(vec![
            ReplyBlock {
                kind: ReplyBlockKind::Interim,
                text: "first".into(),
            },
            ReplyBlock {
                kind: ReplyBlockKind::Final,
                text: "second".into(),
            },
        ]);
        let calls: Arc<Mutex<usize>> = Arc::default();
        let calls_in = Arc::clone(&calls);
        let send: SendChunkFn = Arc::new(move |_chunk, _kind| {
            let calls = Arc::clone(&calls_in);
            Box::pin(async move {
                *calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
                anyhow::bail!("platform down")
            })
        });

        dispatch_inbound(&host, envelope(ChatType::Group), options(), send)
            .await
            .unwrap();

        // Both blocks attempted despite the failures, and idle was marked.
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(recording.idle.lock().unwrap().len(), 1);
    }
}
