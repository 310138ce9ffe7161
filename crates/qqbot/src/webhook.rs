//! Webhook ingress: Ed25519 verification, the op-13 validation handshake,
//! and message-event dispatch.

use std::sync::Arc;

use {
    secrecy::ExposeSecret,
    serde::Deserialize,
    sinobridge_channels::{
        dispatch::{self, DispatchOptions, SendChunkFn},
        gating,
        host::HostPort,
        text::{self, TableMode},
        webhook::{WebhookHandler, WebhookRequest, WebhookResponse},
    },
    tracing::{debug, warn},
};

use crate::{
    CHANNEL_ID, CHANNEL_LABEL, auth,
    normalize::{self, NormalizeOutcome},
    outbound::QqBotOutbound,
    state::{AccountState, AccountStateMap, get_account},
};

/// Opcode of platform → bot event payloads.
const OP_DISPATCH: i64 = 0;
/// Opcode of the URL-validation challenge.
const OP_VALIDATION: i64 = 13;
/// HTTP callback acknowledgement opcode.
const OP_ACK: i64 = 12;

#[derive(Clone)]
pub struct WebhookContext {
    pub accounts: AccountStateMap,
    pub outbound: Arc<QqBotOutbound>,
    pub host: HostPort,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    op: i64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ValidationPayload {
    #[serde(default)]
    plain_token: String,
    #[serde(default)]
    event_ts: String,
}

#[must_use]
pub fn make_handler(account_id: String, ctx: WebhookContext) -> WebhookHandler {
    Arc::new(move |req: WebhookRequest| {
        let account_id = account_id.clone();
        let ctx = ctx.clone();
        Box::pin(async move { handle(&ctx, &account_id, req).await })
    })
}

async fn handle(ctx: &WebhookContext, account_id: &str, req: WebhookRequest) -> WebhookResponse {
    let Some(state) = get_account(&ctx.accounts, account_id) else {
        return WebhookResponse::text(404, "account not running");
    };

    let signature = req.header("x-signature-ed25519").unwrap_or_default();
    let timestamp = req.header("x-signature-timestamp").unwrap_or_default();
    let secret = state.config.client_secret.expose_secret().clone();
    if auth::verify(&secret, timestamp, &req.body, signature).is_err() {
        warn!(account_id, "webhook signature rejected");
        return WebhookResponse::bad_request("invalid signature");
    }

    let payload: EventPayload = match serde_json::from_slice(&req.body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(account_id, error = %e, "undecodable webhook payload");
            return WebhookResponse::bad_request("invalid payload");
        },
    };

    match payload.op {
        OP_VALIDATION => {
            let validation: ValidationPayload =
                serde_json::from_value(payload.d).unwrap_or(ValidationPayload {
                    plain_token: String::new(),
                    event_ts: String::new(),
                });
            let signature =
                auth::sign_validation(&secret, &validation.event_ts, &validation.plain_token);
            WebhookResponse::json(
                200,
                &serde_json::json!({
                    "plain_token": validation.plain_token,
                    "signature": signature,
                }),
            )
        },
        OP_DISPATCH => {
            let event_type = payload.t.clone().unwrap_or_default();
            let is_group = match event_type.as_str() {
                "GROUP_AT_MESSAGE_CREATE" => true,
                "C2C_MESSAGE_CREATE" => false,
                other => {
                    debug!(account_id, event_type = other, "ignored event type");
                    return ack();
                },
            };
            if state.is_duplicate(payload.id.as_deref().unwrap_or("")) {
                debug!(account_id, "duplicate webhook event dropped");
                return ack();
            }

            // Ack within the window; the reply rides the passive-reply API.
            let ctx = ctx.clone();
            let cancel = state.cancel.clone();
            let data = payload.d;
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {},
                    () = process_event(ctx, state, data, is_group) => {},
                }
            });
            ack()
        },
        other => {
            debug!(account_id, op = other, "ignored opcode");
            ack()
        },
    }
}

fn ack() -> WebhookResponse {
    WebhookResponse::json(200, &serde_json::json!({ "op": OP_ACK }))
}

pub(crate) async fn process_event(
    ctx: WebhookContext,
    state: Arc<AccountState>,
    data: serde_json::Value,
    is_group: bool,
) {
    let message = match normalize::parse_message(&data) {
        Ok(message) => message,
        Err(e) => {
            debug!(account_id = state.account_id, error = %e, "undecodable message event");
            return;
        },
    };
    let reply_to = message.id.clone();

    let outcome = match normalize::build_envelope(&state, message, is_group).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "normalize failed");
            return;
        },
    };

    match outcome {
        NormalizeOutcome::Skip(reason) => {
            debug!(account_id = state.account_id, reason, "event skipped");
        },
        NormalizeOutcome::Notice { text } => {
            // Voice/oversize fallbacks go straight back to the peer.
            let peer = data
                .get("author")
                .and_then(|a| {
                    a.get("user_openid")
                        .or_else(|| a.get("member_openid"))
                        .or_else(|| a.get("id"))
                })
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let target = if is_group {
                data.get("group_openid")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(&peer)
                    .to_string()
            } else {
                peer
            };
            if let Err(e) = ctx
                .outbound
                .send_text_chunks(&state, &target, is_group, &text, Some(&reply_to))
                .await
            {
                warn!(account_id = state.account_id, error = %e, "notice send failed");
            }
        },
        NormalizeOutcome::Envelope(envelope) => {
            let decision = gating::evaluate(
                &state.config.policy,
                envelope.chat_type,
                &envelope.sender_id,
                &envelope.peer_id,
                envelope.was_mentioned,
            );
            if !decision.allowed {
                debug!(
                    account_id = state.account_id,
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
            let send_chunk =
                passive_send_chunk(&ctx, &state, envelope.peer_id.clone(), is_group, reply_to);
            if let Err(e) = dispatch::dispatch_inbound(&ctx.host, envelope, opts, send_chunk).await
            {
                warn!(account_id = state.account_id, error = %e, "dispatch failed");
            }
        },
    }
}

fn passive_send_chunk(
    ctx: &WebhookContext,
    state: &Arc<AccountState>,
    peer_id: String,
    is_group: bool,
    reply_to: String,
) -> SendChunkFn {
    let outbound = Arc::clone(&ctx.outbound);
    let state = Arc::clone(state);
    Arc::new(move |chunk, _kind| {
        let outbound = Arc::clone(&outbound);
        let state = Arc::clone(&state);
        let peer_id = peer_id.clone();
        let reply_to = reply_to.clone();
        Box::pin(async move {
            outbound
                .send_text_chunks(&state, &peer_id, is_group, &chunk, Some(&reply_to))
                .await?;
            Ok(())
        })
    })
}
