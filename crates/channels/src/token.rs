//! Process-wide access-token cache.
//!
//! One instance per channel crate, keyed by the account's credential tuple
//! (e.g. `corpId:agentId`). Refresh calls are allowed to race; the platforms
//! return equivalent tokens within a short window, so last-writer-wins.

use std::{
    collections::HashMap,
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Tokens are refreshed this long before the platform-reported expiry.
pub const TOKEN_SAFETY_MARGIN_SECS: u64 = 300;

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// TTL-bounded token cache.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a still-valid token. Expired entries are never returned.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.token.clone())
    }

    /// Store a token. `platform_ttl_secs` is the platform-reported lifetime;
    /// the entry is kept for that minus the safety margin.
    pub fn put(&self, key: &str, token: String, platform_ttl_secs: u64) {
        let ttl = platform_ttl_secs.saturating_sub(TOKEN_SAFETY_MARGIN_SECS);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            CachedToken {
                token,
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
    }

    /// Evict an entry after the platform rejected the token (40014-style).
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Return the cached token or fetch a fresh one. `fetch` resolves to
    /// `(token, platform_ttl_secs)`. The lock is not held across the fetch,
    /// so concurrent callers may both fetch; that is acceptable.
    pub async fn get_or_refresh<F, Fut, E>(&self, key: &str, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, u64), E>>,
    {
        if let Some(token) = self.get(key) {
            return Ok(token);
        }
        let (token, ttl) = fetch().await?;
        self.put(key, token.clone(), ttl);
        Ok(token)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = TokenCache::new();
        assert!(cache.get("k").is_none());
        cache.put("k", "tok".into(), 7200);
        assert_eq!(cache.get("k").as_deref(), Some("tok"));
    }

    #[test]
    fn ttl_at_or_below_margin_expires_immediately() {
        let cache = TokenCache::new();
        cache.put("k", "tok".into(), TOKEN_SAFETY_MARGIN_SECS);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_evicts() {
        let cache = TokenCache::new();
        cache.put("k", "tok".into(), 7200);
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn refresh_populates_cache() {
        let cache = TokenCache::new();
        let token = cache
            .get_or_refresh("corp:1000002", || async {
                Ok::<_, std::convert::Infallible>(("fresh".to_string(), 7200))
            })
            .await
            .unwrap();
        assert_eq!(token, "fresh");
        assert_eq!(cache.get("corp:1000002").as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn refresh_not_called_on_hit() {
        let cache = TokenCache::new();
        cache.put("k", "cached".into(), 7200);
        let token = cache
            .get_or_refresh("k", || async {
                Err::<(String, u64), _>("must not fetch")
            })
            .await
            .unwrap();
        assert_eq!(token, "cached");
    }
}
