//! Corp access-token acquisition.

use {
    secrecy::ExposeSecret,
    serde::Deserialize,
    sinobridge_channels::token::TokenCache,
    tracing::info,
};

use crate::{config::WeComAppConfig, error::{Error, Result}};

pub const API_BASE: &str = "https://qyapi.weixin.qq.com/cgi-bin";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Fetches and caches corp tokens keyed by `(corpId, agentId)`.
pub struct CorpTokenSource {
    client: reqwest::Client,
    cache: TokenCache,
    base_url: String,
}

impl CorpTokenSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: TokenCache::new(),
            base_url: API_BASE.to_string(),
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

    fn cache_key(config: &WeComAppConfig) -> String {
        format!("{}:{}", config.corp_id, config.agent_id)
    }

    /// Cached token, or a fresh one from `gettoken`.
    pub async fn access_token(&self, config: &WeComAppConfig) -> Result<String> {
        let key = Self::cache_key(config);
        let client = self.client.clone();
        let url = format!("{}/gettoken", self.base_url);
        let corp_id = config.corp_id.clone();
        let corp_secret = config.corp_secret.expose_secret().clone();

        self.cache
            .get_or_refresh(&key, || async move {
                let body: TokenResponse = client
                    .get(&url)
                    .timeout(std::time::Duration::from_secs(30))
                    .query(&[("corpid", corp_id.as_str()), ("corpsecret", corp_secret.as_str())])
                    .send()
                    .await?
                    .json()
                    .await?;
                if body.errcode != 0 {
                    return Err(Error::api(body.errcode, body.errmsg));
                }
                let token = body
                    .access_token
                    .ok_or_else(|| Error::message("gettoken returned no access_token"))?;
                let ttl = body.expires_in.unwrap_or(7200);
                info!(corp_id, ttl, "wecom access token refreshed");
                Ok((token, ttl))
            })
            .await
    }

    /// Drop the cached token after the platform rejected it.
    pub fn invalidate(&self, config: &WeComAppConfig) {
        self.cache.invalidate(&Self::cache_key(config));
    }

    /// Run `call` with a token; on a 40014-style rejection, refresh the
    /// token and retry exactly once.
    pub async fn with_token_retry<T, F, Fut>(&self, config: &WeComAppConfig, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let token = self.access_token(config).await?;
        match call(token).await {
            Err(e) if e.is_token_rejected() => {
                info!(corp_id = config.corp_id, "token rejected, refreshing once");
                self.invalidate(config);
                let token = self.access_token(config).await?;
                call(token).await
            },
            other => other,
        }
    }
}

impl Default for CorpTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, secrecy::Secret};

    fn config() -> WeComAppConfig {
        WeComAppConfig {
            corp_id: "wx1".into(),
            corp_secret: SecretBox::new(Box::new("s".into())),
            agent_id: 7,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetches_and_caches_token() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/gettoken")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("corpid".into(), "wx1".into()),
                mockito::Matcher::UrlEncoded("corpsecret".into(), "s".into()),
            ]))
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"T1","expires_in":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let source = CorpTokenSource::new().with_base_url(server.url());
        assert_eq!(source.access_token(&config()).await.unwrap(), "T1");
        // Second call is served from cache — the mock allows one hit only.
        assert_eq!(source.access_token(&config()).await.unwrap(), "T1");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn gettoken_errcode_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/gettoken")
            .with_body(r#"{"errcode":40013,"errmsg":"invalid corpid"}"#)
            .create_async()
            .await;
        let source = CorpTokenSource::new().with_base_url(server.url());
        let err = source.access_token(&config()).await.unwrap_err();
        assert!(err.to_string().contains("40013"), "{err}");
    }

    #[tokio::test]
    async fn retry_once_after_token_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", "/gettoken")
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"T","expires_in":7200}"#)
            .expect(2)
            .create_async()
            .await;

        let source = CorpTokenSource::new().with_base_url(server.url());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in = std::sync::Arc::clone(&attempts);
        let result = source
            .with_token_retry(&config(), move |_token| {
                let attempts = std::sync::Arc::clone(&attempts_in);
                async move {
                    if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(Error::api(40014, "invalid access_token"))
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
            .mock("GET", "/gettoken")
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"T","expires_in":7200}"#)
            .create_async()
            .await;
        let source = CorpTokenSource::new().with_base_url(server.url());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in = std::sync::Arc::clone(&attempts);
        let err = source
            .with_token_retry(&config(), move |_t| {
                let attempts = std::sync::Arc::clone(&attempts_in);
                async move {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err::<(), _>(Error::api(45009, "rate limited"))
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("45009"));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
