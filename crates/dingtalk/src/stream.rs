//! Stream SDK client: gateway handshake, WebSocket read loop, per-frame
//! acknowledgements, reconnect with backoff.

use std::{sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt, future::BoxFuture},
    secrecy::ExposeSecret,
    serde::Deserialize,
    tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    config::DingTalkConfig,
    error::{Error, Result},
};

/// Robot message callback topic.
pub const ROBOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Handler invoked with the decoded robot message payload of each
/// CALLBACK frame.
pub type CallbackHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct StreamEndpointResponse {
    endpoint: String,
    ticket: String,
}

/// One decoded stream frame.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamFrame {
    #[serde(rename = "type", default)]
    pub frame_type: String,
    #[serde(default)]
    pub headers: StreamHeaders,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamHeaders {
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Request the websocket endpoint + ticket for this app.
pub async fn open_connection(
    client: &reqwest::Client,
    base_url: &str,
    config: &DingTalkConfig,
) -> Result<(String, String)> {
    let response = client
        .post(format!("{base_url}/v1.0/gateway/connections/open"))
        .timeout(Duration::from_secs(30))
        .json(&serde_json::json!({
            "clientId": config.client_id,
            "clientSecret": config.client_secret.expose_secret(),
            "subscriptions": [
                { "type": "CALLBACK", "topic": ROBOT_MESSAGE_TOPIC }
            ],
            "ua": "sinobridge/0.3",
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::api(status.to_string(), body));
    }
    let endpoint: StreamEndpointResponse = response.json().await?;
    Ok((endpoint.endpoint, endpoint.ticket))
}

/// Frame acknowledgement sent back for every decoded frame.
pub(crate) fn ack_frame(message_id: &str) -> String {
    serde_json::json!({
        "code": 200,
        "headers": { "messageId": message_id, "contentType": "application/json" },
        "message": "OK",
        "data": "",
    })
    .to_string()
}

/// The `data` field arrives as a JSON-encoded string; tolerate an object
/// for robustness.
pub(crate) fn decode_frame_data(data: &serde_json::Value) -> Option<serde_json::Value> {
    match data {
        serde_json::Value::String(raw) => serde_json::from_str(raw).ok(),
        serde_json::Value::Object(_) => Some(data.clone()),
        _ => None,
    }
}

/// Run one account's stream connection until cancelled. Reconnects with
/// exponential backoff; the SDK-side session is re-established from
/// scratch each time.
pub async fn run_stream(
    gateway_base: String,
    config: DingTalkConfig,
    handler: CallbackHandler,
    cancel: CancellationToken,
) {
    let client = reqwest::Client::new();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(client_id = config.client_id, "stream task cancelled");
                return;
            },
            result = connect_once(&client, &gateway_base, &config, &handler, &cancel) => {
                match result {
                    Ok(()) => return, // cancelled mid-read
                    Err(e) => {
                        error!(
                            client_id = config.client_id,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "stream connection lost, reconnecting"
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
    gateway_base: &str,
    config: &DingTalkConfig,
    handler: &CallbackHandler,
    cancel: &CancellationToken,
) -> Result<()> {
    let (endpoint, ticket) = open_connection(client, gateway_base, config).await?;
    let ws_url = format!("{endpoint}?ticket={ticket}");
    let (ws_stream, _) = connect_async(&ws_url).await?;
    info!(client_id = config.client_id, "stream connected");

    let (mut write, mut read) = ws_stream.split();
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            message = read.next() => message,
        };
        match message {
            Some(Ok(WsMessage::Text(raw))) => {
                let frame: StreamFrame = match serde_json::from_str(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "undecodable stream frame");
                        continue;
                    },
                };
                let message_id = frame.headers.message_id.clone().unwrap_or_default();
                if let Err(e) = write.send(WsMessage::Text(ack_frame(&message_id).into())).await {
                    warn!(error = %e, "stream ack failed");
                }

                if frame.frame_type == "CALLBACK"
                    && frame.headers.topic.as_deref().unwrap_or(ROBOT_MESSAGE_TOPIC)
                        == ROBOT_MESSAGE_TOPIC
                    && let Some(data) = frame.data.as_ref().and_then(decode_frame_data)
                {
                    handler(data).await;
                } else if frame.frame_type == "SYSTEM" {
                    debug!("stream system frame");
                }
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = write.send(WsMessage::Pong(payload)).await;
            },
            Some(Ok(WsMessage::Close(_))) | None => return Err(Error::StreamClosed),
            Some(Ok(_)) => {},
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_decodes_with_string_data() {
        let raw = r#"{
            "type": "CALLBACK",
            "headers": {"messageId": "mid1", "topic": "/v1.0/im/bot/messages/get"},
            "data": "{\"msgtype\":\"text\",\"text\":{\"content\":\"hi\"}}"
        }"#;
        let frame: StreamFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.frame_type, "CALLBACK");
        let data = decode_frame_data(frame.data.as_ref().unwrap()).unwrap();
        assert_eq!(data["msgtype"], "text");
    }

    #[test]
    fn frame_data_object_passes_through() {
        let value = serde_json::json!({"msgtype": "text"});
        assert_eq!(decode_frame_data(&value).unwrap()["msgtype"], "text");
        assert!(decode_frame_data(&serde_json::json!(42)).is_none());
    }

    #[test]
    fn ack_carries_the_message_id() {
        let ack: serde_json::Value = serde_json::from_str(&ack_frame("mid9")).unwrap();
        assert_eq!(ack["code"], 200);
        assert_eq!(ack["headers"]["messageId"], "mid9");
    }

    #[tokio::test]
    async fn open_connection_posts_subscription() {
        use secrecy::SecretBox;
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/v1.0/gateway/connections/open")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "clientId": "k",
                "subscriptions": [{"type": "CALLBACK", "topic": "/v1.0/im/bot/messages/get"}]
            })))
            .with_body(r#"{"endpoint":"wss://wss-open-connection.dingtalk.com:443/connect","ticket":"tk"}"#)
            .create_async()
            .await;

        let config = DingTalkConfig {
            client_id: "k".into(),
            client_secret: SecretBox::new(Box::new("s".into())),
            ..Default::default()
        };
        let (endpoint, ticket) =
            open_connection(&reqwest::Client::new(), &server.url(), &config)
                .await
                .unwrap();
        assert!(endpoint.starts_with("wss://"));
        assert_eq!(ticket, "tk");
        m.assert_async().await;
    }
}
