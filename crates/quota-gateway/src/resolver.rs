//! API key -> namespace resolution.
//!
//! A key seen before is answered from the mapping table. An unseen key is
//! provisioned: the upstream model listing is called with the key as bearer
//! credential, and the namespace it reports in the `Group` header is stored.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::GatewayError;
use crate::store::{MappingStore, StoreError};
use crate::upstream::Upstream;

pub const NAMESPACE_HEADER: &str = "Group";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("authorization header required")]
    MissingCredential,

    #[error("invalid authorization format")]
    MalformedCredential,

    #[error("mapping store failed: {0}")]
    Store(#[from] StoreError),

    #[error("upstream rejected key with status {0}")]
    Rejected(u16),

    #[error("upstream validation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream implementation is incorrect: missing Group header")]
    MissingGroupHeader,
}

impl From<ResolveError> for GatewayError {
    fn from(err: ResolveError) -> Self {
        let message = match err {
            ResolveError::MissingCredential => "Authorization header required",
            ResolveError::MalformedCredential => "Invalid authorization format",
            _ => "Invalid API key",
        };
        GatewayError::Authentication(message.to_string())
    }
}

/// Extract the API key from an `Authorization` header value. The `Bearer `
/// prefix is optional; anything else about the key is left unchecked.
pub fn bearer_key(header: Option<&str>) -> Result<String, ResolveError> {
    let header = header.ok_or(ResolveError::MissingCredential)?;
    if header.is_empty() {
        return Err(ResolveError::MissingCredential);
    }
    let key = header.strip_prefix(BEARER_PREFIX).unwrap_or(header);
    if key.is_empty() {
        return Err(ResolveError::MalformedCredential);
    }
    Ok(key.to_string())
}

/// Short SHA-256 fingerprint of a key, safe to write to logs.
pub fn key_fingerprint(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(&digest[..6])
}

pub struct NamespaceResolver {
    store: Arc<dyn MappingStore>,
    upstream: Arc<Upstream>,
}

impl NamespaceResolver {
    pub fn new(store: Arc<dyn MappingStore>, upstream: Arc<Upstream>) -> Self {
        Self { store, upstream }
    }

    /// Namespace for `api_key`, provisioning it on first use.
    pub async fn resolve(&self, api_key: &str) -> Result<String, ResolveError> {
        if let Some(namespace) = self.store.namespace_for_key(api_key).await? {
            return Ok(namespace);
        }

        let fingerprint = key_fingerprint(api_key);
        let namespace = match self.provision(api_key).await {
            Ok(namespace) => namespace,
            Err(ResolveError::MissingGroupHeader) => {
                log::error!(
                    "upstream accepted key {fingerprint} without a {NAMESPACE_HEADER} header"
                );
                return Err(ResolveError::MissingGroupHeader);
            }
            Err(e) => {
                log::warn!("provisioning key {fingerprint} failed: {e}");
                return Err(e);
            }
        };

        self.store.upsert_mapping(api_key, &namespace).await?;
        log::info!("provisioned key {fingerprint} into namespace {namespace}");
        Ok(namespace)
    }

    async fn provision(&self, api_key: &str) -> Result<String, ResolveError> {
        let resp = self
            .upstream
            .client()
            .get(self.upstream.models_url())
            .bearer_auth(api_key)
            .timeout(self.upstream.validation_timeout())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ResolveError::Rejected(status.as_u16()));
        }

        resp.headers()
            .get(NAMESPACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_owned)
            .ok_or(ResolveError::MissingGroupHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::UpstreamConfig;
    use crate::store::SqliteStore;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct MockUpstream {
        calls: AtomicUsize,
    }

    async fn models(State(mock): State<Arc<MockUpstream>>, headers: HeaderMap) -> Response {
        mock.calls.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers time to overlap.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        match auth {
            "Bearer key-a" => (StatusCode::OK, [("Group", "team-a")], "{}").into_response(),
            "Bearer key-no-group" => (StatusCode::OK, "{}").into_response(),
            "Bearer key-blank-group" => (StatusCode::OK, [("Group", "  ")], "{}").into_response(),
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    async fn spawn_mock() -> (SocketAddr, Arc<MockUpstream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mock = Arc::new(MockUpstream::default());
        let app = Router::new()
            .route("/v1/models", get(models))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, mock)
    }

    fn resolver_for(base_url: String, store: Arc<SqliteStore>) -> NamespaceResolver {
        let upstream = Upstream::new(&UpstreamConfig {
            base_url,
            ..UpstreamConfig::default()
        })
        .unwrap();
        NamespaceResolver::new(store, Arc::new(upstream))
    }

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(bearer_key(Some("Bearer sk-1")).unwrap(), "sk-1");
        assert_eq!(bearer_key(Some("sk-1")).unwrap(), "sk-1");
    }

    #[test]
    fn missing_or_empty_credentials() {
        assert!(matches!(bearer_key(None), Err(ResolveError::MissingCredential)));
        assert!(matches!(
            bearer_key(Some("")),
            Err(ResolveError::MissingCredential)
        ));
        assert!(matches!(
            bearer_key(Some("Bearer ")),
            Err(ResolveError::MalformedCredential)
        ));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(key_fingerprint("sk-1"), key_fingerprint("sk-1"));
        assert_ne!(key_fingerprint("sk-1"), key_fingerprint("sk-2"));
        assert_eq!(key_fingerprint("sk-1").len(), 12);
    }

    #[test]
    fn every_resolve_error_is_unauthorized() {
        for err in [
            ResolveError::MissingCredential,
            ResolveError::Rejected(401),
            ResolveError::MissingGroupHeader,
            ResolveError::Store(StoreError::Poisoned),
        ] {
            let err: GatewayError = err.into();
            assert_eq!(err.status(), 401);
        }
    }

    #[tokio::test]
    async fn unseen_key_is_provisioned_once() {
        let (addr, mock) = spawn_mock().await;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let resolver = resolver_for(format!("http://{addr}"), store.clone());

        assert_eq!(resolver.resolve("key-a").await.unwrap(), "team-a");
        assert_eq!(
            store.namespace_for_key("key-a").await.unwrap().as_deref(),
            Some("team-a")
        );

        // Second lookup is served from the store.
        assert_eq!(resolver.resolve("key-a").await.unwrap(), "team-a");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_key_writes_nothing() {
        let (addr, _mock) = spawn_mock().await;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let resolver = resolver_for(format!("http://{addr}"), store.clone());

        let err = resolver.resolve("key-bad").await.unwrap_err();
        assert!(matches!(err, ResolveError::Rejected(401)));
        assert!(!store.key_exists("key-bad").await.unwrap());
    }

    #[tokio::test]
    async fn missing_or_blank_group_header_is_rejected() {
        let (addr, _mock) = spawn_mock().await;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let resolver = resolver_for(format!("http://{addr}"), store.clone());

        for key in ["key-no-group", "key-blank-group"] {
            let err = resolver.resolve(key).await.unwrap_err();
            assert!(matches!(err, ResolveError::MissingGroupHeader));
            assert!(!store.key_exists(key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let resolver = resolver_for(format!("http://127.0.0.1:{port}"), store);

        let err = resolver.resolve("key-a").await.unwrap_err();
        assert!(matches!(err, ResolveError::Transport(_)));
    }

    #[tokio::test]
    async fn concurrent_first_use_stores_one_mapping() {
        let (addr, _mock) = spawn_mock().await;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let resolver = resolver_for(format!("http://{addr}"), store.clone());

        let (a, b) = tokio::join!(resolver.resolve("key-a"), resolver.resolve("key-a"));

        assert_eq!(a.unwrap(), "team-a");
        assert_eq!(b.unwrap(), "team-a");
        let rows = store.list_by_namespace("team-a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "key-a");
    }
}
