//! Robot webhook ingress: signature check, JSON payload decryption, the
//! encrypted `stream` acknowledgement, and handoff to dispatch.

use std::sync::Arc;

use {
    rand::Rng,
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
    CHANNEL_ID, CHANNEL_LABEL,
    normalize::{self, RobotCallback},
    responder::Responder,
    state::{AccountState, AccountStateMap, get_account},
};

#[derive(Clone)]
pub struct WebhookContext {
    pub accounts: AccountStateMap,
    pub responder: Arc<Responder>,
    pub host: HostPort,
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
    match req.method.as_str() {
        "GET" => handle_verification(&state, &req),
        "POST" => handle_callback(ctx, state, &req),
        _ => WebhookResponse::bad_request("unsupported method"),
    }
}

fn handle_verification(state: &AccountState, req: &WebhookRequest) -> WebhookResponse {
    let signature = req.query("msg_signature").unwrap_or_default();
    let timestamp = req.query("timestamp").unwrap_or_default();
    let nonce = req.query("nonce").unwrap_or_default();
    let echostr = urlencoding::decode(req.query("echostr").unwrap_or_default())
        .map(|c| c.into_owned())
        .unwrap_or_default();

    if sinobridge_wecom_crypto::verify_signature(
        &state.config.token,
        timestamp,
        nonce,
        &echostr,
        signature,
    )
    .is_err()
    {
        return WebhookResponse::bad_request("invalid signature");
    }
    match sinobridge_wecom_crypto::decrypt(
        &echostr,
        &state.aes_key,
        state.config.receive_id.as_deref(),
    ) {
        Ok(plain) => WebhookResponse::ok(plain),
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "echostr decrypt failed");
            WebhookResponse::bad_request("decrypt error")
        },
    }
}

fn handle_callback(
    ctx: &WebhookContext,
    state: Arc<AccountState>,
    req: &WebhookRequest,
) -> WebhookResponse {
    let body = req.body_str();
    let Some(encrypted) = extract_encrypted(&body) else {
        debug!(account_id = state.account_id, "callback without encrypt field");
        return WebhookResponse::ok("");
    };

    let signature = req.query("msg_signature").unwrap_or_default();
    let timestamp = req.query("timestamp").unwrap_or_default();
    let nonce = req.query("nonce").unwrap_or_default();
    if sinobridge_wecom_crypto::verify_signature(
        &state.config.token,
        timestamp,
        nonce,
        &encrypted,
        signature,
    )
    .is_err()
    {
        warn!(account_id = state.account_id, "robot callback signature mismatch");
        return WebhookResponse::bad_request("invalid signature");
    }

    let decrypted = match sinobridge_wecom_crypto::decrypt(
        &encrypted,
        &state.aes_key,
        state.config.receive_id.as_deref(),
    ) {
        Ok(json) => json,
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "robot callback decrypt failed");
            return WebhookResponse::bad_request("decrypt error");
        },
    };

    let callback = match normalize::parse_callback(&decrypted) {
        Ok(callback) => callback,
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "robot callback unparseable");
            return WebhookResponse::ok("");
        },
    };

    // The agent reply will outlive the 5 s window; ack with an empty
    // stream message and deliver through the response URL.
    let ack = stream_ack(&state, callback.msgid.as_deref().unwrap_or(""));
    let ctx = ctx.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {},
            () = process_callback(ctx, state, callback) => {},
        }
    });
    ack
}

/// Both shapes are accepted: the robot's JSON body and the app-style XML
/// element.
fn extract_encrypted(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(encrypted) = value.get("encrypt").and_then(serde_json::Value::as_str)
    {
        return Some(encrypted.to_string());
    }
    let open = body.find("<Encrypt>")?;
    let start = open + "<Encrypt>".len();
    let end = body[start..].find("</Encrypt>")? + start;
    let inner = &body[start..end];
    let inner = inner
        .strip_prefix("<![CDATA[")
        .and_then(|c| c.strip_suffix("]]>"))
        .unwrap_or(inner);
    Some(inner.to_string())
}

/// Encrypted empty `stream` acknowledgement, signed like every passive
/// reply.
fn stream_ack(state: &AccountState, msgid: &str) -> WebhookResponse {
    let plaintext = serde_json::json!({
        "msgtype": "stream",
        "stream": { "id": msgid, "finish": false, "content": "" }
    })
    .to_string();

    let receive_id = state.config.receive_id.clone().unwrap_or_default();
    let Ok(encrypted) =
        sinobridge_wecom_crypto::encrypt(&plaintext, &state.aes_key, &receive_id)
    else {
        return WebhookResponse::ok("");
    };

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string();
    let nonce: String = {
        let mut rng = rand::rng();
        (0..10)
            .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
            .collect()
    };
    let signature =
        sinobridge_wecom_crypto::compute_signature(&state.config.token, &timestamp, &nonce, &encrypted);

    WebhookResponse::json(
        200,
        &serde_json::json!({
            "encrypt": encrypted,
            "msgsignature": signature,
            "timestamp": timestamp,
            "nonce": nonce,
        }),
    )
}

pub(crate) async fn process_callback(
    ctx: WebhookContext,
    state: Arc<AccountState>,
    callback: RobotCallback,
) {
    let response_url = callback.response_url.clone();
    let envelope = match normalize::build_envelope(&state, &callback).await {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            debug!(account_id = state.account_id, msgtype = callback.msgtype, "callback skipped");
            return;
        },
        Err(e) => {
            warn!(account_id = state.account_id, error = %e, "normalize failed");
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
            account_id = state.account_id,
            sender_id = envelope.sender_id,
            reason = decision.reason,
            "inbound denied by policy"
        );
        return;
    }

    let Some(response_url) = response_url else {
        warn!(account_id = state.account_id, "callback carries no response_url, reply dropped");
        return;
    };

    let opts = DispatchOptions {
        channel_label: CHANNEL_LABEL.to_string(),
        chunk_limit: text::resolve_chunk_limit(CHANNEL_ID, state.config.text_chunk_limit),
        table_mode: TableMode::Bullets,
        final_only: state.config.reply_final_only,
    };
    let send_chunk = responder_send_chunk(&ctx, &state, response_url);
    if let Err(e) = dispatch::dispatch_inbound(&ctx.host, envelope, opts, send_chunk).await {
        warn!(account_id = state.account_id, error = %e, "dispatch failed");
    }
}

fn responder_send_chunk(
    ctx: &WebhookContext,
    state: &Arc<AccountState>,
    response_url: String,
) -> SendChunkFn {
    let responder = Arc::clone(&ctx.responder);
    let chunk_limit = state.config.text_chunk_limit;
    Arc::new(move |chunk, _kind| {
        let responder = Arc::clone(&responder);
        let response_url = response_url.clone();
        Box::pin(async move {
            responder.send_text(&response_url, &chunk, chunk_limit).await?;
            Ok(())
        })
    })
}
