//! Tenant access-token acquisition.

use {
    secrecy::ExposeSecret,
    serde::Deserialize,
    sinobridge_channels::token::TokenCache,
    tracing::debug,
};

use crate::{config::FeishuConfig, error::{Error, Result}};

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    /// TTL in seconds, typically 7200.
    #[serde(default)]
    expire: Option<u64>,
}

pub struct TenantTokenSource {
    client: reqwest::Client,
    cache: TokenCache,
    base_url: String,
}

impl TenantTokenSource {
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

    pub async fn access_token(&self, config: &FeishuConfig) -> Result<String> {
        let client = self.client.clone();
        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let app_id = config.app_id.clone();
        let app_secret = config.app_secret.expose_secret().clone();

        self.cache
            .get_or_refresh(&config.app_id, || async move {
                let body: TenantTokenResponse = client
                    .post(&url)
                    .timeout(std::time::Duration::from_secs(30))
                    .json(&serde_json::json!({
                        "app_id": app_id,
                        "app_secret": app_secret,
                    }))
                    .send()
                    .await?
                    .json()
                    .await?;
                if body.code != 0 {
                    return Err(Error::api(body.code, body.msg));
                }
                let token = body
                    .tenant_access_token
                    .ok_or_else(|| Error::message("tenant_access_token missing"))?;
                let ttl = body.expire.unwrap_or(7200);
                debug!(app_id, ttl, "feishu tenant token refreshed");
                Ok((token, ttl))
            })
            .await
    }

    pub fn invalidate(&self, config: &FeishuConfig) {
        self.cache.invalidate(&config.app_id);
    }

    /// Run `call` with a token; when the platform rejects it, refresh the
    /// token and retry exactly once.
    pub async fn with_token_retry<T, F, Fut>(&self, config: &FeishuConfig, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let token = self.access_token(config).await?;
        match call(token).await {
            Err(e) if e.is_token_rejected() => {
                debug!(app_id = config.app_id, "tenant token rejected, refreshing once");
                self.invalidate(config);
                let token = self.access_token(config).await?;
                call(token).await
            },
            other => other,
        }
    }
}

impl Default for TenantTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, secrecy::Secret};

    fn config() -> FeishuConfig {
        FeishuConfig {
            app_id: "cli_1".into(),
            app_secret: SecretBox::new(Box::new("s".into())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn caches_tenant_token() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"t-abc","expire":7200}"#)
            .expect(1)
            .create_async()
            .await;
        let source = TenantTokenSource::new().with_base_url(server.url());
        assert_eq!(source.access_token(&config()).await.unwrap(), "t-abc");
        assert_eq!(source.access_token(&config()).await.unwrap(), "t-abc");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn retry_once_after_token_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"TT","expire":7200}"#)
            .expect(2)
            .create_async()
            .await;

        let source = TenantTokenSource::new().with_base_url(server.url());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in = std::sync::Arc::clone(&attempts);
        let result = source
            .with_token_retry(&config(), move |_token| {
                let attempts = std::sync::Arc::clone(&attempts_in);
                async move {
                    if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(crate::Error::api(99991663, "tenant token invalid"))
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
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"TT","expire":7200}"#)
            .create_async()
            .await;
        let source = TenantTokenSource::new().with_base_url(server.url());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_in = std::sync::Arc::clone(&attempts);
        let err = source
            .with_token_retry(&config(), move |_token| {
                let attempts = std::sync::Arc::clone(&attempts_in);
                async move {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err::<(), _>(crate::Error::api(230001, "param invalid"))
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("230001"));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn api_code_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_body(r#"{"code":10003,"msg":"invalid app_secret"}"#)
            .create_async()
            .await;
        let source = TenantTokenSource::new().with_base_url(server.url());
        assert!(source.access_token(&config()).await.is_err());
    }
}
