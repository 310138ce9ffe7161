//! Streaming AI-card lifecycle.
//!
//! One card per inbound message: `create` → `deliver` → first streaming
//! update (preceded by an `INPUTING` status PUT) → throttled streaming
//! updates carrying the full accumulated content → `isFinalize` stream
//! call plus a `FINISHED` status PUT. Any API failure finishes the card
//! with an error banner; the caller falls back to plain messages.

use std::{sync::Arc, time::Duration};

use {serde::Deserialize, tracing::debug, uuid::Uuid};

use crate::{
    config::DingTalkConfig,
    error::{Error, Result},
    token::AppTokenSource,
};

/// Stock streaming template used when the account does not pin one.
const DEFAULT_CARD_TEMPLATE: &str = "382e4302-551d-4880-bf29-a30acae4a95a.schema";

/// Minimum spacing between streaming updates on one card.
pub const STREAM_THROTTLE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Created,
    Inputing,
    Finished,
    Failed,
}

/// Raw card API calls.
pub struct CardApi {
    client: reqwest::Client,
    tokens: Arc<AppTokenSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardApiError {
    code: Option<String>,
    message: Option<String>,
}

impl CardApi {
    #[must_use]
    pub fn new(tokens: Arc<AppTokenSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
        }
    }

    async fn call(
        &self,
        config: &DingTalkConfig,
        method: reqwest::Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<()> {
        self.tokens
            .with_token_retry(config, |token| {
                let client = self.client.clone();
                let method = method.clone();
                let url = format!("{}{path}", self.tokens.base_url());
                let body = body.clone();
                async move {
                    let response = client
                        .request(method, &url)
                        .timeout(Duration::from_secs(30))
                        .header("x-acs-dingtalk-access-token", token)
                        .json(&body)
                        .send()
                        .await?;
                    if response.status().is_success() {
                        return Ok(());
                    }
                    let status = response.status();
                    let api_error: CardApiError = response.json().await.unwrap_or(CardApiError {
                        code: None,
                        message: None,
                    });
                    Err(Error::api(
                        api_error
                            .code
                            .unwrap_or_else(|| status.as_u16().to_string()),
                        api_error.message.unwrap_or_default(),
                    ))
                }
            })
            .await
    }

    pub async fn create(
        &self,
        config: &DingTalkConfig,
        out_track_id: &str,
        open_space_id: &str,
    ) -> Result<()> {
        let template = config
            .card_template_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CARD_TEMPLATE.to_string());
        self.call(
            config,
            reqwest::Method::POST,
            "/v1.0/card/instances",
            serde_json::json!({
                "cardTemplateId": template,
                "outTrackId": out_track_id,
                "cardData": { "cardParamMap": { "content": "" } },
                "openSpaceId": open_space_id,
                "imRobotOpenSpaceModel": { "supportForward": true },
                "imGroupOpenSpaceModel": { "supportForward": true },
            }),
        )
        .await
    }

    pub async fn deliver(
        &self,
        config: &DingTalkConfig,
        out_track_id: &str,
        open_space_id: &str,
    ) -> Result<()> {
        self.call(
            config,
            reqwest::Method::POST,
            "/v1.0/card/instances/deliver",
            serde_json::json!({
                "outTrackId": out_track_id,
                "openSpaceId": open_space_id,
                "imRobotOpenDeliverModel": { "spaceType": "IM_ROBOT" },
                "imGroupOpenDeliverModel": { "robotCode": config.client_id },
            }),
        )
        .await
    }

    /// One streaming payload: fresh guid, full accumulated content.
    pub async fn stream_update(
        &self,
        config: &DingTalkConfig,
        out_track_id: &str,
        content: &str,
        finalize: bool,
    ) -> Result<()> {
        self.call(
            config,
            reqwest::Method::PUT,
            "/v1.0/card/streaming",
            serde_json::json!({
                "outTrackId": out_track_id,
                "guid": Uuid::new_v4().to_string(),
                "key": "content",
                "content": content,
                "isFull": true,
                "isFinalize": finalize,
                "isError": false,
            }),
        )
        .await
    }

    /// Flow-status PUT (`INPUTING`, `FINISHED`, `FAILED`), optionally with
    /// replacement content.
    pub async fn put_status(
        &self,
        config: &DingTalkConfig,
        out_track_id: &str,
        status: &str,
        content: Option<&str>,
    ) -> Result<()> {
        let mut card_param_map = serde_json::json!({ "flowStatus": status });
        if let Some(content) = content {
            card_param_map["content"] = serde_json::Value::String(content.to_string());
        }
        self.call(
            config,
            reqwest::Method::PUT,
            "/v1.0/card/instances",
            serde_json::json!({
                "outTrackId": out_track_id,
                "cardData": { "cardParamMap": card_param_map },
            }),
        )
        .await
    }
}

/// Card space addressing: groups and 1:1 robot chats use different space
/// kinds.
#[must_use]
pub fn open_space_id(is_group: bool, conversation_id: &str) -> String {
    if is_group {
        format!("dtv1.card//IM_GROUP.{conversation_id}")
    } else {
        format!("dtv1.card//IM_ROBOT.{conversation_id}")
    }
}

/// State machine driving one card instance.
pub struct CardStreamer {
    api: Arc<CardApi>,
    config: DingTalkConfig,
    out_track_id: String,
    state: CardState,
    accumulated: String,
    last_stream: Option<tokio::time::Instant>,
    throttle: Duration,
}

impl CardStreamer {
    /// Create and deliver a fresh card.
    pub async fn start(
        api: Arc<CardApi>,
        config: DingTalkConfig,
        is_group: bool,
        conversation_id: &str,
    ) -> Result<Self> {
        let out_track_id = Uuid::new_v4().to_string();
        let space = open_space_id(is_group, conversation_id);
        api.create(&config, &out_track_id, &space).await?;
        api.deliver(&config, &out_track_id, &space).await?;
        Ok(Self {
            api,
            config,
            out_track_id,
            state: CardState::Created,
            accumulated: String::new(),
            last_stream: None,
            throttle: STREAM_THROTTLE,
        })
    }

    #[cfg(test)]
    fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    #[must_use]
    pub fn out_track_id(&self) -> &str {
        &self.out_track_id
    }

    #[must_use]
    pub fn state(&self) -> CardState {
        self.state
    }

    /// Streaming update with the full content so far. The first update
    /// flips the card to `INPUTING`; later ones are spaced by the
    /// throttle.
    pub async fn update(&mut self, content: &str) -> Result<()> {
        if matches!(self.state, CardState::Finished | CardState::Failed) {
            debug!(out_track_id = self.out_track_id, "update after finish ignored");
            return Ok(());
        }
        self.accumulated = content.to_string();

        if self.state == CardState::Created {
            self.api
                .put_status(&self.config, &self.out_track_id, "INPUTING", None)
                .await?;
            self.state = CardState::Inputing;
        } else if let Some(last) = self.last_stream {
            let since = last.elapsed();
            if since < self.throttle {
                tokio::time::sleep(self.throttle - since).await;
            }
        }

        self.api
            .stream_update(&self.config, &self.out_track_id, content, false)
            .await?;
        self.last_stream = Some(tokio::time::Instant::now());
        Ok(())
    }

    /// Close the stream and mark the card `FINISHED`. Safe to call twice;
    /// the second call is a no-op.
    pub async fn finalize(&mut self, content: &str) -> Result<()> {
        if matches!(self.state, CardState::Finished | CardState::Failed) {
            return Ok(());
        }
        self.accumulated = content.to_string();
        if self.state == CardState::Created {
            // A reply that arrives whole still opens the stream first.
            self.api
                .put_status(&self.config, &self.out_track_id, "INPUTING", None)
                .await?;
            self.state = CardState::Inputing;
        }
        self.api
            .stream_update(&self.config, &self.out_track_id, content, true)
            .await?;
        self.api
            .put_status(&self.config, &self.out_track_id, "FINISHED", Some(content))
            .await?;
        self.state = CardState::Finished;
        Ok(())
    }

    /// Terminate the card with an error banner. Best-effort.
    pub async fn fail(&mut self, banner: &str) {
        if matches!(self.state, CardState::Finished | CardState::Failed) {
            return;
        }
        let content = if self.accumulated.is_empty() {
            banner.to_string()
        } else {
            format!("{}\n\n{banner}", self.accumulated)
        };
        if let Err(e) = self
            .api
            .put_status(&self.config, &self.out_track_id, "FAILED", Some(&content))
            .await
        {
            debug!(out_track_id = self.out_track_id, error = %e, "card fail put failed");
        }
        self.state = CardState::Failed;
    }
}
