use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::metric::{ANONYMOUS, Metrics};
use crate::quota::QuotaEnforcer;
use crate::relay::{Relay, stream_back};
use crate::resolver::{NamespaceResolver, bearer_key};
use crate::upstream::COMPLETIONS_PATH;

pub const HEALTH_PATH: &str = "/api/healthz";
pub const USAGE_PATH: &str = "/usage";
pub const AUTHORIZATION_HEADER: &str = "authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Health,
    Usage,
    Completions,
    Unknown,
}

impl Route {
    pub fn of(method: &str, path: &str) -> Self {
        match (method, path) {
            ("GET", HEALTH_PATH) => Route::Health,
            ("GET", USAGE_PATH) => Route::Usage,
            ("POST", COMPLETIONS_PATH) => Route::Completions,
            _ => Route::Unknown,
        }
    }
}

/// Per-request state threaded through the pipeline.
pub struct RequestCtx {
    pub request_id: Uuid,
    started: Instant,
    /// Set once the caller's key has resolved.
    pub namespace: Option<String>,
    /// Status the upstream answered a relayed request with.
    pub upstream_status: Option<u16>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    message: &'static str,
}

pub struct Gateway {
    resolver: NamespaceResolver,
    enforcer: QuotaEnforcer,
    relay: Relay,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(
        resolver: NamespaceResolver,
        enforcer: QuotaEnforcer,
        relay: Relay,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver,
            enforcer,
            relay,
            metrics,
        }
    }

    async fn authorize(
        &self,
        credential: Option<String>,
        ctx: &mut RequestCtx,
    ) -> std::result::Result<String, GatewayError> {
        let api_key = bearer_key(credential.as_deref())?;
        let namespace = self.resolver.resolve(&api_key).await?;
        ctx.namespace = Some(namespace.clone());
        Ok(namespace)
    }

    async fn serve_usage(&self, session: &mut Session, ctx: &mut RequestCtx) -> Result<bool> {
        let namespace = match self.authorize(credential(session), ctx).await {
            Ok(ns) => ns,
            Err(e) => return reject(session, ctx, &e).await,
        };

        match self.enforcer.usage(&namespace).await {
            Ok(report) => {
                respond_json(session, 200, &report).await?;
                Ok(true)
            }
            Err(e) => reject(session, ctx, &e.into()).await,
        }
    }

    async fn serve_completions(
        &self,
        session: &mut Session,
        ctx: &mut RequestCtx,
    ) -> Result<bool> {
        let namespace = match self.authorize(credential(session), ctx).await {
            Ok(ns) => ns,
            Err(e) => return reject(session, ctx, &e).await,
        };

        let admission = match self.enforcer.admit(&namespace).await {
            Ok(admission) => admission,
            Err(e) => return reject(session, ctx, &e.into()).await,
        };

        let body = match read_body(session).await {
            Ok(body) => body,
            Err(e) => {
                self.enforcer.settle(&admission, false).await;
                let err = GatewayError::Internal(format!("failed to read request body: {e}"));
                return reject(session, ctx, &err).await;
            }
        };

        // Anything the client does while waiting for upstream headers, usually
        // closing the connection, abandons the relayed request.
        let forwarded = tokio::select! {
            resp = self.relay.forward(body) => Some(resp),
            _ = session.downstream_session.read_body_or_idle(true) => None,
        };
        let resp = match forwarded {
            Some(Ok(resp)) => resp,
            Some(Err(e)) => {
                self.enforcer.settle(&admission, false).await;
                return reject(session, ctx, &e).await;
            }
            None => {
                self.enforcer.settle(&admission, false).await;
                return Err(Error::explain(
                    ErrorType::ConnectionClosed,
                    "client went away before upstream responded",
                ));
            }
        };

        // The outcome is decided by the upstream status alone, so the slot can
        // be settled before the body is streamed.
        let status = resp.status();
        ctx.upstream_status = Some(status.as_u16());
        self.enforcer
            .settle(&admission, status.is_success())
            .await;

        stream_back(session, resp).await?;
        Ok(true)
    }
}

fn credential(session: &Session) -> Option<String> {
    session
        .req_header()
        .headers
        .get(AUTHORIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn read_body(session: &mut Session) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = session.read_request_body().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

async fn respond_json<T: Serialize + Sync>(
    session: &mut Session,
    status: u16,
    body: &T,
) -> Result<()> {
    let body = serde_json::to_vec(body)
        .map_err(|e| Error::because(ErrorType::InternalError, "failed to encode body", e))?;
    let mut header = ResponseHeader::build(status, Some(2))?;
    header.insert_header("Content-Type", "application/json")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session.write_response_body(Some(Bytes::from(body)), true).await
}

async fn reject(session: &mut Session, ctx: &RequestCtx, err: &GatewayError) -> Result<bool> {
    match err {
        GatewayError::Internal(_) | GatewayError::BadGateway(_) => {
            log::error!("[{}] {}", ctx.request_id, err)
        }
        _ => log::debug!("[{}] {}", ctx.request_id, err),
    }
    respond_json(session, err.status(), &err.to_response()).await?;
    Ok(true)
}

#[async_trait]
impl ProxyHttp for Gateway {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            request_id: Uuid::now_v7(),
            started: Instant::now(),
            namespace: None,
            upstream_status: None,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let route = {
            let req = session.req_header();
            Route::of(req.method.as_str(), req.uri.path())
        };

        match route {
            Route::Health => {
                let health = Health {
                    status: "ok",
                    message: "Service is healthy",
                };
                respond_json(session, 200, &health).await?;
                Ok(true)
            }
            Route::Usage => self.serve_usage(session, ctx).await,
            Route::Completions => self.serve_completions(session, ctx).await,
            // Falls through to upstream_peer, which answers 404.
            Route::Unknown => Ok(false),
        }
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let path = session.req_header().uri.path();
        Err(Error::explain(
            ErrorType::HTTPStatus(404),
            format!("no route for {path}"),
        ))
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let namespace = ctx.namespace.as_deref().unwrap_or(ANONYMOUS);
        if let Some(summary) = self.metrics.record(namespace, status) {
            log::info!("{summary}");
        }

        let req = session.req_header();
        let elapsed = ctx.started.elapsed();
        match e {
            Some(err) => log::warn!(
                "[{}] {} {} -> {} ns={} upstream={:?} {:?} error: {}",
                ctx.request_id,
                req.method,
                req.uri.path(),
                status,
                namespace,
                ctx.upstream_status,
                elapsed,
                err
            ),
            None => log::info!(
                "[{}] {} {} -> {} ns={} upstream={:?} {:?}",
                ctx.request_id,
                req.method,
                req.uri.path(),
                status,
                namespace,
                ctx.upstream_status,
                elapsed
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_match_method_and_path() {
        assert_eq!(Route::of("GET", "/api/healthz"), Route::Health);
        assert_eq!(Route::of("GET", "/usage"), Route::Usage);
        assert_eq!(Route::of("POST", "/v1/chat/completions"), Route::Completions);
    }

    #[test]
    fn wrong_method_or_path_is_unknown() {
        assert_eq!(Route::of("GET", "/v1/chat/completions"), Route::Unknown);
        assert_eq!(Route::of("POST", "/usage"), Route::Unknown);
        assert_eq!(Route::of("GET", "/v1/models"), Route::Unknown);
        assert_eq!(Route::of("GET", "/"), Route::Unknown);
    }
}
