//! App access-token acquisition (`getAppAccessToken`).

use {
    secrecy::ExposeSecret,
    serde::Deserialize,
    sinobridge_channels::token::TokenCache,
    tracing::debug,
};

use crate::{config::QqBotConfig, error::{Error, Result}};

#[derive(Debug, Deserialize)]
struct AppTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    /// Seconds, as a string on this endpoint.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

pub struct AppTokenSource {
    client: reqwest::Client,
    cache: TokenCache,
    token_url: String,
}

impl AppTokenSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: TokenCache::new(),
            token_url: crate::TOKEN_URL.to_string(),
        }
    }

    #[must_use]
    pub fn with_token_url(mut self, token_url: String) -> Self {
        self.token_url = token_url;
        self
    }

    pub async fn access_token(&self, config: &QqBotConfig) -> Result<String> {
        let client = self.client.clone();
        let url = self.token_url.clone();
        let app_id = config.app_id.clone();
        let client_secret = config.client_secret.expose_secret().clone();

        self.cache
            .get_or_refresh(&config.app_id, || async move {
                let body: AppTokenResponse = client
                    .post(&url)
                    .timeout(std::time::Duration::from_secs(30))
                    .json(&serde_json::json!({
                        "appId": app_id,
                        "clientSecret": client_secret,
                    }))
                    .send()
                    .await?
                    .json()
                    .await?;
                if let Some(code) = body.code.filter(|c| *c != 0) {
                    return Err(Error::api(code, body.message.unwrap_or_default()));
                }
                let token = body
                    .access_token
                    .ok_or_else(|| Error::message("access_token missing from response"))?;
                let ttl = match body.expires_in {
                    Some(serde_json::Value::String(s)) => s.parse().unwrap_or(7200),
                    Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(7200),
                    _ => 7200,
                };
                debug!(app_id, ttl, "qq app access token refreshed");
                Ok((token, ttl))
            })
            .await
    }

    pub fn invalidate(&self, config: &QqBotConfig) {
        self.cache.invalidate(&config.app_id);
    }

    /// Run `call` with a token; when the platform rejects it, refresh the
    /// token and retry exactly once.
    pub async fn with_token_retry<T, F, Fut>(&self, config: &QqBotConfig, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let token = self.access_token(config).await?;
        match call(token).await {
            Err(e) if e.is_token_rejected() => {
                debug!(app_id = config.app_id, "app token rejected, refreshing once");
                self.invalidate(config);
                let token = self.access_token(config).await?;
                call(token).await
            },
            other => other,
        }
    }
}

impl Default for AppTokenSource {
    fn default() -> Self {
        Self::new()
    }
}
