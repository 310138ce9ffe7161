//! App access-token acquisition (v1.0 oauth2 endpoint).

use {
    secrecy::ExposeSecret,
    serde::Deserialize,
    sinobridge_channels::token::TokenCache,
    tracing::debug,
};

use crate::{config::DingTalkConfig, error::{Error, Result}};

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(rename = "accessToken", default)]
    access_token: Option<String>,
    #[serde(rename = "expireIn", default)]
    expire_in: Option<u64>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct AppTokenSource {
    client: reqwest::Client,
    cache: TokenCache,
    base_url: String,
}

impl AppTokenSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: TokenCache::new(),
            base_url: crate::API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn access_token(&self, config: &DingTalkConfig) -> Result<String> {
        let client = self.client.clone();
        let url = format!("{}/v1.0/oauth2/accessToken", self.base_url);
        let app_key = config.client_id.clone();
        let app_secret = config.client_secret.expose_secret().clone();

        self.cache
            .get_or_refresh(&config.client_id, || async move {
                let response = client
                    .post(&url)
                    .timeout(std::time::Duration::from_secs(30))
                    .json(&serde_json::json!({
                        "appKey": app_key,
                        "appSecret": app_secret,
                    }))
                    .send()
                    .await?;
                let body: AccessTokenResponse = response.json().await?;
                if let Some(code) = body.code {
                    return Err(Error::api(code, body.message.unwrap_or_default()));
                }
                let token = body
                    .access_token
                    .ok_or_else(|| Error::message("accessToken missing from response"))?;
                let ttl = body.expire_in.unwrap_or(7200);
                debug!(app_key, ttl, "dingtalk access token refreshed");
                Ok((token, ttl))
            })
            .await
    }

    pub fn invalidate(&self, config: &DingTalkConfig) {
        self.cache.invalidate(&config.client_id);
    }

    /// Run `call` with a token; when the platform rejects it, refresh the
    /// token and retry exactly once.
    pub async fn with_token_retry<T, F, Fut>(&self, config: &DingTalkConfig, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let token = self.access_token(config).await?;
        match call(token).await {
            Err(e) if e.is_token_rejected() => {
                debug!(app_key = config.client_id, "token rejected, refreshing once");
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, secrecy::Secret};

    fn config() -> DingTalkConfig {
        DingTalkConfig {
            client_id: "ding_key".into(),
            client_secret: SecretBox::new(Box::new("ding_secret".into())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetches_token_once_and_caches() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "appKey": "ding_key",
                "appSecret": "ding_secret"
            })))
            .with_body(r#"{"accessToken":"AT","expireIn":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let source = AppTokenSource::new().with_base_url(server.url());
        assert_eq!(source.access_token(&config()).await.unwrap(), "AT");
        assert_eq!(source.access_token(&config()).await.unwrap(), "AT");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn retry_once_after_token_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"AT","expireIn":7200}"#)
            .expect(2)
            .create_async()
            .await;

        let source = AppTokenSource::new().with_base_url(server.url());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in = std::sync::Arc::clone(&attempts);
        let result = source
            .with_token_retry(&config(), move |_token| {
                let attempts = std::sync::Arc::clone(&attempts_in);
                async move {
                    if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(crate::Error::api("40014", "invalid access token"))
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "sent");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_token_errors_do_not_retry() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"AT","expireIn":7200}"#)
            .create_async()
            .await;
        let source = AppTokenSource::new().with_base_url(server.url());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in = std::sync::Arc::clone(&attempts);
        let err = source
            .with_token_retry(&config(), move |_token| {
                let attempts = std::sync::Arc::clone(&attempts_in);
                async move {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err::<(), _>(crate::Error::api("430002", "param error"))
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("430002"));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_code_surfaces() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"code":"Forbidden.AccessDenied","message":"no permission"}"#)
            .create_async()
            .await;
        let source = AppTokenSource::new().with_base_url(server.url());
        let err = source.access_token(&config()).await.unwrap_err();
        assert!(err.to_string().contains("Forbidden.AccessDenied"));
    }
}
