//! Open-platform long connection: endpoint fetch, challenge handshake,
//! event frames, reconnect with backoff.

use std::{sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt, future::BoxFuture},
    secrecy::ExposeSecret,
    serde::Deserialize,
    tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info},
};

use crate::{
    config::FeishuConfig,
    error::{Error, Result},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Handler invoked with each `im.message.receive_v1` event body.
pub type EventHandler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<EndpointData>,
}

#[derive(Debug, Deserialize)]
struct EndpointData {
    #[serde(rename = "URL", alias = "url")]
    url: String,
}

/// Ask the platform for this app's websocket endpoint.
pub async fn fetch_endpoint(
    client: &reqwest::Client,
    base_url: &str,
    config: &FeishuConfig,
) -> Result<String> {
    let response: EndpointResponse = client
        .post(format!("{base_url}/callback/ws/endpoint"))
        .timeout(Duration::from_secs(30))
        .json(&serde_json::json!({
            "AppID": config.app_id,
            "AppSecret": config.app_secret.expose_secret(),
        }))
        .send()
        .await?
        .json()
        .await?;
    if response.code != 0 {
        return Err(Error::api(response.code, response.msg));
    }
    response
        .data
        .map(|d| d.url)
        .ok_or_else(|| Error::message("endpoint response carries no URL"))
}

/// Decode one frame: either a handshake needing an in-band answer, an
/// event for the handler, or noise.
pub(crate) enum FrameAction {
    Reply(String),
    Event(serde_json::Value),
    Ignore,
}

pub(crate) fn classify_frame(raw: &str) -> FrameAction {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return FrameAction::Ignore;
    };

    // url_verification handshake (also sent over the long connection).
    if value.get("type").and_then(serde_json::Value::as_str) == Some("url_verification")
        && let Some(challenge) = value.get("challenge").and_then(serde_json::Value::as_str)
    {
        return FrameAction::Reply(
            serde_json::json!({ "challenge": challenge }).to_string(),
        );
    }

    let event_type = value
        .pointer("/header/event_type")
        .and_then(serde_json::Value::as_str);
    if event_type == Some("im.message.receive_v1")
        && let Some(event) = value.get("event")
    {
        return FrameAction::Event(event.clone());
    }
    FrameAction::Ignore
}

/// Run one account's long connection until cancelled.
pub async fn run_long_connection(
    base_url: String,
    config: FeishuConfig,
    handler: EventHandler,
    cancel: CancellationToken,
) {
    let client = reqwest::Client::new();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(app_id = config.app_id, "long connection task cancelled");
                return;
            },
            result = connect_once(&client, &base_url, &config, &handler, &cancel) => {
                match result {
                    Ok(()) => return,
                    Err(e) => {
                        error!(
                            app_id = config.app_id,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "long connection lost, reconnecting"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(backoff) => {},
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    },
                }
            },
        }
    }
}

async fn connect_once(
    client: &reqwest::Client,
    base_url: &str,
    config: &FeishuConfig,
    handler: &EventHandler,
    cancel: &CancellationToken,
) -> Result<()> {
    let endpoint = fetch_endpoint(client, base_url, config).await?;
    let (ws_stream, _) = connect_async(&endpoint).await?;
    info!(app_id = config.app_id, "long connection established");

    let (mut write, mut read) = ws_stream.split();
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            message = read.next() => message,
        };
        match message {
            Some(Ok(WsMessage::Text(raw))) => match classify_frame(&raw) {
                FrameAction::Reply(reply) => {
                    if let Err(e) = write.send(WsMessage::Text(reply.into())).await {
                        debug!(error = %e, "handshake reply failed");
                    }
                },
                FrameAction::Event(event) => handler(event).await,
                FrameAction::Ignore => {},
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = write.send(WsMessage::Pong(payload)).await;
            },
            Some(Ok(WsMessage::Close(_))) | None => return Err(Error::ConnectionClosed),
            Some(Ok(_)) => {},
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
