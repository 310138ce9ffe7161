//! Webhook route contract.
//!
//! The host owns the HTTP listener; webhook channels hand it
//! `(method, path, handler)` triples at account start and release them at
//! account stop. Handlers must be re-entrant — the platforms retry and may
//! call concurrently.

use std::{collections::HashMap, sync::Arc};

use {anyhow::Result, bytes::Bytes, futures::future::BoxFuture};

/// A platform callback, decoded only as far as transport concerns go.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Uppercase method ("GET", "POST").
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl WebhookRequest {
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// What the handler returns to the platform.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookResponse {
    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    #[must_use]
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    #[must_use]
    pub fn xml(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/xml",
            body: body.into(),
        }
    }

    #[must_use]
    pub fn ok(body: impl Into<String>) -> Self {
        Self::text(200, body)
    }

    #[must_use]
    pub fn bad_request(body: impl Into<String>) -> Self {
        Self::text(400, body)
    }

    #[must_use]
    pub fn forbidden(body: impl Into<String>) -> Self {
        Self::text(403, body)
    }
}

pub type WebhookHandler =
    Arc<dyn Fn(WebhookRequest) -> BoxFuture<'static, WebhookResponse> + Send + Sync>;

/// Handle returned by [`RouteRegistrar::register`]; passing it back to
/// `unregister` removes the route (later requests 404 at the host).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteHandle {
    pub method: String,
    pub path: String,
}

/// Route registration facility supplied by the host.
pub trait RouteRegistrar: Send + Sync {
    fn register(&self, method: &str, path: &str, handler: WebhookHandler) -> Result<RouteHandle>;
    fn unregister(&self, handle: &RouteHandle);
}

/// In-memory registrar for hosts that route callbacks themselves and for
/// tests that drive handlers directly.
#[derive(Default)]
pub struct MemoryRouter {
    routes: std::sync::RwLock<HashMap<(String, String), WebhookHandler>>,
}

impl MemoryRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch one request; `None` when no route matches (a host would
    /// answer 404).
    pub async fn dispatch(&self, req: WebhookRequest) -> Option<WebhookResponse> {
        let handler = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes
                .get(&(req.method.to_ascii_uppercase(), req.path.clone()))
                .cloned()
        };
        match handler {
            Some(handler) => Some(handler(req).await),
            None => None,
        }
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RouteRegistrar for MemoryRouter {
    fn register(&self, method: &str, path: &str, handler: WebhookHandler) -> Result<RouteHandle> {
        let method = method.to_ascii_uppercase();
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(&(method.clone(), path.to_string())) {
            anyhow::bail!("route already registered: {method} {path}");
        }
        routes.insert((method.clone(), path.to_string()), handler);
        Ok(RouteHandle {
            method,
            path: path.to_string(),
        })
    }

    fn unregister(&self, handle: &RouteHandle) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.remove(&(handle.method.clone(), handle.path.clone()));
    }
}
