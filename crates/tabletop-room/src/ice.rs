//! STUN/TURN server configuration for peer connections.
//!
//! TURN credentials are short-lived, so they are fetched from the application
//! server and cached for a TTL. Dialing never waits on that fetch: until the
//! first response arrives (or when the server is unreachable) the public STUN
//! defaults are used.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tabletop_common::http::{ApiClient, HttpError};
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Free public STUN servers.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(d)? {
        Urls::One(u) => vec![u],
        Urls::Many(v) => v,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceResponse {
    Wrapped {
        ice_servers: Vec<IceServer>,
        #[serde(default)]
        ttl: Option<u64>,
    },
    Bare(Vec<IceServer>),
}

struct Cached {
    servers: Vec<IceServer>,
    expires_at: Instant,
}

struct Inner {
    source: Option<(ApiClient, String)>,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
    refreshing: AtomicBool,
}

/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct IceNegotiationConfig {
    inner: Arc<Inner>,
}

impl IceNegotiationConfig {
    pub fn new(api: ApiClient, room_id: impl Into<String>, ttl: Duration) -> Self {
        Self::build(Some((api, room_id.into())), ttl)
    }

    /// A config that never fetches and always hands out `servers`.
    pub fn fixed(servers: Vec<IceServer>) -> Self {
        let config = Self::build(None, Duration::MAX);
        if let Ok(mut cache) = config.inner.cache.try_write() {
            *cache = Some(Cached { servers, expires_at: far_future() });
        }
        config
    }

    fn build(source: Option<(ApiClient, String)>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                ttl,
                cache: RwLock::new(None),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Cached servers, or the defaults. Starts a background refresh when the
    /// cache is empty or stale; concurrent callers share one refresh.
    pub async fn current(&self) -> Vec<IceServer> {
        let (servers, stale) = match self.inner.cache.read().await.as_ref() {
            Some(c) => (c.servers.clone(), Instant::now() >= c.expires_at),
            None => (IceServer::defaults(), true),
        };
        if stale {
            self.spawn_refresh();
        }
        servers
    }

    /// Fetch fresh servers now, updating the cache.
    pub async fn fetch(&self) -> Result<Vec<IceServer>, HttpError> {
        let Some((api, room_id)) = &self.inner.source else {
            return Ok(self.current().await);
        };
        let response: IceResponse = api.get(&format!("/rooms/{room_id}/ice-servers")).await?;
        let (servers, ttl) = match response {
            IceResponse::Wrapped { ice_servers, ttl } => {
                (ice_servers, ttl.map(Duration::from_secs).unwrap_or(self.inner.ttl))
            }
            IceResponse::Bare(servers) => (servers, self.inner.ttl),
        };
        let servers = if servers.is_empty() { IceServer::defaults() } else { servers };

        tracing::debug!(room = %room_id, count = servers.len(), ?ttl, "ICE servers refreshed");
        *self.inner.cache.write().await = Some(Cached {
            servers: servers.clone(),
            expires_at: Instant::now().checked_add(ttl).unwrap_or_else(far_future),
        });
        Ok(servers)
    }

    fn spawn_refresh(&self) {
        if self.inner.source.is_none() || self.inner.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.fetch().await {
                tracing::warn!(error = %e, "ICE server fetch failed, using cached or default servers");
            }
            this.inner.refreshing.store(false, Ordering::SeqCst);
        });
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn serve(hits: Arc<AtomicUsize>, body: serde_json::Value) -> ApiClient {
        let router = Router::new().route(
            "/rooms/{room}/ice-servers",
            get(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                async move { axum::Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ApiClient::new(&format!("http://{addr}"), "").unwrap()
    }

    fn turn_body() -> serde_json::Value {
        json!({
            "ice_servers": [
                { "urls": "turn:turn.example:3478", "username": "u", "credential": "c" }
            ],
            "ttl": 600
        })
    }

    async fn wait_for_cache(config: &IceNegotiationConfig) -> Vec<IceServer> {
        for _ in 0..100 {
            if let Some(c) = config.inner.cache.read().await.as_ref() {
                return c.servers.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cache never filled");
    }

    #[tokio::test]
    async fn current_returns_defaults_then_cached_with_one_fetch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let api = serve(hits.clone(), turn_body()).await;
        let config = IceNegotiationConfig::new(api, "12", Duration::from_secs(3600));

        assert_eq!(config.current().await, IceServer::defaults());
        assert_eq!(config.current().await, IceServer::defaults());

        let cached = wait_for_cache(&config).await;
        assert_eq!(cached[0].urls, vec!["turn:turn.example:3478".to_string()]);
        assert_eq!(config.current().await, cached);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_accepts_bare_array() {
        let hits = Arc::new(AtomicUsize::new(0));
        let api = serve(hits, json!([{ "urls": ["stun:a", "stun:b"] }])).await;
        let config = IceNegotiationConfig::new(api, "12", Duration::from_secs(60));

        let servers = config.fetch().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 2);
        assert!(servers[0].username.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_keeps_defaults() {
        let api = ApiClient::new("http://127.0.0.1:1", "").unwrap();
        let config = IceNegotiationConfig::new(api, "12", Duration::from_secs(60));

        assert!(config.fetch().await.is_err());
        assert_eq!(config.current().await, IceServer::defaults());
    }

    #[tokio::test]
    async fn fixed_config_never_fetches() {
        let servers = vec![IceServer { urls: vec!["stun:local".into()], username: None, credential: None }];
        let config = IceNegotiationConfig::fixed(servers.clone());
        assert_eq!(config.current().await, servers);
        assert_eq!(config.fetch().await.unwrap(), servers);
    }
}
