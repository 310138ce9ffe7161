//! Encrypted-XML webhook ingress.
//!
//! GET is the console's URL verification (signature + echostr decrypt);
//! POST carries the encrypted message. The platform expects an answer
//! within 5 seconds. Final-only accounts first try to answer passively:
//! if the final reply is ready inside the window it goes back as the
//! encrypted XML webhook response. Everything else acknowledges empty
//! and delivers over active send from the account's task.

use std::sync::Arc;

use {
    rand::Rng,
    sinobridge_channels::{
        dispatch::{self, DispatchOptions, SendChunkFn},
        gating,
        host::{HostPort, ReplyBlockKind},
        markdown,
        text::{self, TableMode},
        webhook::{WebhookHandler, WebhookRequest, WebhookResponse},
    },
    tracing::{debug, warn},
};

use crate::{
    CHANNEL_ID, CHANNEL_LABEL,
    normalize::{self, NormalizeOutcome},
    outbound::WeComAppOutbound,
    state::{AccountState, AccountStateMap, get_account},
    token::CorpTokenSource,
};

/// Everything a webhook handler closure needs, clone-cheap.
#[derive(Clone)]
pub struct WebhookContext {
    pub accounts: AccountStateMap,
    pub tokens: Arc<CorpTokenSource>,
    pub outbound: Arc<WeComAppOutbound>,
    pub host: HostPort,
}

/// Hand-off point for the passive fast path: the dispatch deliverer
/// claims the sender for the final reply chunk; the handler waits on the
/// receiving end until the callback window closes.
pub(crate) type PassiveSlot =
    Arc<std::sync::Mutex<Option<tokio::sync::oneshot::Sender<(String, String)>>>>;

/// How long the handler waits for a passive reply before acking empty
/// (the platform closes the callback at 5 s).
const PASSIVE_REPLY_WINDOW: std::time::Duration = std::time::Duration::from_secs(4);

/// Build the handler registered for one account's callback path.
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

    match req.method.as_str() {
        "GET" => handle_verification(&state, &req),
        "POST" => handle_callback(ctx, state, &req).await,
        other => {
            debug!(method = other, "unsupported webhook method");
            WebhookResponse::bad_request("unsupported method")
        },
    }
}

/// Console URL verification: check the 4-tuple signature over the
/// percent-decoded echostr, then answer with its decrypted plaintext.
fn handle_verification(state: &AccountState, req: &WebhookRequest) -> WebhookResponse {
    let signature = req.query("msg_signature").unwrap_or_default();
    let timestamp = req.query("timestamp").unwrap_or_default();
    let nonce = req.query("nonce").unwrap_or_default();
    let echostr = percent_decode(req.query("echostr").unwrap_or_default());

    if let Err(e) = sinobridge_wecom_crypto::verify_signature(
        &state.config.token,
        timestamp,
        nonce,
        &echostr,
        signature,
    ) {
        warn!(account_id = state.account_id, error = %e, "webhook verification signature mismatch");
        return WebhookResponse::bad_request("invalid signature");
    }

    match sinobridge_wecom_crypto::decrypt(&echostr, &state.aes_key, Some(&state.config.corp_id)) {
        Ok(plain) => WebhookResponse::ok(plain),
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "echostr decrypt failed");
            WebhookResponse::bad_request("decrypt error")
        },
    }
}

async fn handle_callback(
    ctx: &WebhookContext,
    state: Arc<AccountState>,
    req: &WebhookRequest,
) -> WebhookResponse {
    let body = req.body_str();
    let Some(encrypted) = crate::xml::extract_tag(&body, "Encrypt") else {
        debug!(account_id = state.account_id, "callback without Encrypt element");
        return WebhookResponse::ok("");
    };

    let signature = req.query("msg_signature").unwrap_or_default();
    let timestamp = req.query("timestamp").unwrap_or_default();
    let nonce = req.query("nonce").unwrap_or_default();
    if let Err(e) = sinobridge_wecom_crypto::verify_signature(
        &state.config.token,
        timestamp,
        nonce,
        &encrypted,
        signature,
    ) {
        warn!(account_id = state.account_id, error = %e, "callback signature mismatch");
        return WebhookResponse::bad_request("invalid signature");
    }

    let decrypted = match sinobridge_wecom_crypto::decrypt(
        &encrypted,
        &state.aes_key,
        Some(&state.config.corp_id),
    ) {
        Ok(xml) => xml,
        Err(e) => {
            // Tampered payloads are dropped without a success ack.
            warn!(account_id = state.account_id, error = %e, "callback decrypt failed");
            return WebhookResponse::bad_request("decrypt error");
        },
    };

    // Final-only accounts get the passive fast path: when the single
    // reply is ready inside the window, it rides back as the encrypted
    // webhook response and no active send is needed.
    if state.config.reply_final_only {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let slot: PassiveSlot = Arc::new(std::sync::Mutex::new(Some(reply_tx)));
        let ctx = ctx.clone();
        let cancel = state.cancel.clone();
        let state_task = Arc::clone(&state);
        let slot_task = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {},
                () = process_decrypted(ctx, Arc::clone(&state_task), decrypted, Some(Arc::clone(&slot_task))) => {},
            }
            // Nothing claimed the sender (skip, denial, error): drop it
            // so the handler stops waiting.
            slot_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        });
        return match tokio::time::timeout(PASSIVE_REPLY_WINDOW, reply_rx).await {
            Ok(Ok((to, reply_text))) => passive_reply(&state, &to, &reply_text),
            // Window closed or nothing to echo; delivery (if any)
            // continues over active send.
            _ => WebhookResponse::ok(""),
        };
    }

    // Ack inside the 5 s window; the reply arrives over active send.
    let ctx = ctx.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {},
            () = process_decrypted(ctx, state, decrypted, None) => {},
        }
    });
    WebhookResponse::ok("")
}

/// Build the encrypted passive-reply body: a plain text message XML,
/// encrypted and signed the same way inbound callbacks are.
fn passive_reply(state: &AccountState, to: &str, reply_text: &str) -> WebhookResponse {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let plaintext = format!(
        "<xml>{}{}<CreateTime>{now}</CreateTime>{}{}</xml>",
        crate::xml::cdata_element("ToUserName", to),
        crate::xml::cdata_element("FromUserName", &state.config.corp_id),
        crate::xml::cdata_element("MsgType", "text"),
        crate::xml::cdata_element("Content", reply_text),
    );
    let Ok(encrypted) =
        sinobridge_wecom_crypto::encrypt(&plaintext, &state.aes_key, &state.config.corp_id)
    else {
        return WebhookResponse::ok("");
    };

    let timestamp = now.to_string();
    let nonce: String = {
        let mut rng = rand::rng();
        (0..10)
            .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
            .collect()
    };
    let signature = sinobridge_wecom_crypto::compute_signature(
        &state.config.token,
        &timestamp,
        &nonce,
        &encrypted,
    );
    WebhookResponse::xml(
        200,
        format!(
            "<xml>{}{}<TimeStamp>{timestamp}</TimeStamp>{}</xml>",
            crate::xml::cdata_element("Encrypt", &encrypted),
            crate::xml::cdata_element("MsgSignature", &signature),
            crate::xml::cdata_element("Nonce", &nonce),
        ),
    )
}

/// Normalize, gate, and dispatch one decrypted callback document. With a
/// passive slot, the final reply chunk is offered to the waiting webhook
/// handler before falling back to active send.
pub(crate) async fn process_decrypted(
    ctx: WebhookContext,
    state: Arc<AccountState>,
    xml: String,
    passive: Option<PassiveSlot>,
) {
    let Some(parsed) = normalize::parse_callback(&xml) else {
        debug!(account_id = state.account_id, "unparseable callback xml");
        return;
    };

    let outcome = match normalize::build_envelope(&state, &ctx.tokens, parsed).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "normalize failed");
            return;
        },
    };

    match outcome {
        NormalizeOutcome::Skip(reason) => {
            debug!(account_id = state.account_id, reason, "callback skipped");
        },
        NormalizeOutcome::Notice { to, text } => {
            if let Err(e) = ctx.outbound.send_text_chunks(&state, &to, &text).await {
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
            let send_chunk = active_send_chunk(&ctx, &state, envelope.peer_id.clone(), passive);
            if let Err(e) =
                dispatch::dispatch_inbound(&ctx.host, envelope, opts, send_chunk).await
            {
                warn!(account_id = state.account_id, error = %e, "dispatch failed");
            }
        },
    }
}

fn active_send_chunk(
    ctx: &WebhookContext,
    state: &Arc<AccountState>,
    to: String,
    passive: Option<PassiveSlot>,
) -> SendChunkFn {
    let outbound = Arc::clone(&ctx.outbound);
    let state = Arc::clone(state);
    Arc::new(move |chunk, kind| {
        let outbound = Arc::clone(&outbound);
        let state = Arc::clone(&state);
        let to = to.clone();
        let passive = passive.clone();
        Box::pin(async move {
            // Offer the final chunk to the waiting webhook handler; if
            // the window already closed the send fails and the chunk
            // goes out actively like any other.
            if kind == ReplyBlockKind::Final
                && let Some(slot) = &passive
                && let Some(reply_tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take()
            {
                let plain = markdown::strip_markdown(&chunk);
                if reply_tx.send((to.clone(), plain)).is_ok() {
                    return Ok(());
                }
            }
            outbound.send_text_chunks(&state, &to, &chunk).await?;
            Ok(())
        })
    })
}

/// The platform percent-encodes `+`, `/`, `=` in query values but signs the
/// plain base64; decode before both the signature check and decryption.
/// `+` is not form-decoded to a space.
fn percent_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
