use std::sync::Arc;

use bytes::Bytes;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

use crate::error::GatewayError;
use crate::upstream::Upstream;

/// The only upstream response headers passed back to the caller.
pub const RELAYED_RESPONSE_HEADERS: [&str; 2] = ["Content-Type", "Content-Length"];

/// Forwards completion requests to the upstream under the service credential.
pub struct Relay {
    upstream: Arc<Upstream>,
}

impl Relay {
    pub fn new(upstream: Arc<Upstream>) -> Self {
        Self { upstream }
    }

    /// Send `body` unchanged to the completions endpoint. Resolves once the
    /// upstream status and headers arrive; the body is left unread. The relay
    /// timeout covers the whole exchange, body included.
    pub async fn forward(&self, body: Bytes) -> Result<reqwest::Response, GatewayError> {
        let content_length = body.len();
        self.upstream
            .client()
            .post(self.upstream.completions_url())
            .bearer_auth(self.upstream.api_key())
            .timeout(self.upstream.relay_timeout())
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, content_length)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                log::error!("failed to proxy request to upstream: {e}");
                GatewayError::BadGateway("Failed to connect to upstream API".to_string())
            })
    }
}

/// Build the downstream response header from an upstream response: status
/// verbatim, `Content-Type` and `Content-Length` copied, nothing else.
pub fn relayed_header(resp: &reqwest::Response) -> Result<ResponseHeader> {
    let mut header = ResponseHeader::build(resp.status().as_u16(), Some(3))?;
    for name in RELAYED_RESPONSE_HEADERS {
        if let Some(value) = resp.headers().get(name).and_then(|v| v.to_str().ok()) {
            header.insert_header(name, value.to_owned())?;
        }
    }
    if !resp.headers().contains_key(CONTENT_LENGTH) {
        // Unknown length: frame the stream in chunks rather than by close.
        header.insert_header("Transfer-Encoding", "chunked")?;
    }
    Ok(header)
}

/// Stream the upstream response to the caller chunk by chunk.
pub async fn stream_back(session: &mut Session, mut resp: reqwest::Response) -> Result<()> {
    let header = relayed_header(&resp)?;
    session
        .write_response_header(Box::new(header), false)
        .await?;

    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| Error::because(ErrorType::ReadError, "upstream body interrupted", e))?
    {
        session.write_response_body(Some(chunk), false).await?;
    }
    session.write_response_body(None, true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::UpstreamConfig;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use futures_util::StreamExt;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const EVENTS: [&str; 3] = ["data: one\n\n", "data: two\n\n", "data: [DONE]\n\n"];

    async fn completions(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let length = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (
            StatusCode::ACCEPTED,
            [
                ("Content-Type", "application/json"),
                ("X-Upstream-Trace", "abc"),
            ],
            format!(
                r#"{{"auth":"{auth}","length":"{length}","body":{}}}"#,
                String::from_utf8_lossy(&body)
            ),
        )
    }

    /// Event stream without a declared length.
    async fn streamed_completions() -> impl IntoResponse {
        let events = futures_util::stream::iter(EVENTS).then(|event| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, Infallible>(event)
        });
        (
            [("Content-Type", "text/event-stream")],
            Body::from_stream(events),
        )
    }

    async fn stalled_completions() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_secs(5)).await;
        StatusCode::OK
    }

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn spawn_upstream() -> String {
        spawn(Router::new().route("/v1/chat/completions", post(completions))).await
    }

    fn relay_with(base_url: String, relay_timeout_secs: u64) -> Relay {
        let upstream = Upstream::new(&UpstreamConfig {
            base_url,
            api_key: "sk-service".into(),
            relay_timeout_secs,
            ..UpstreamConfig::default()
        })
        .unwrap();
        Relay::new(Arc::new(upstream))
    }

    fn relay_for(base_url: String) -> Relay {
        relay_with(base_url, UpstreamConfig::default().relay_timeout_secs)
    }

    #[tokio::test]
    async fn forward_uses_service_key_and_keeps_body() {
        let relay = relay_for(spawn_upstream().await);
        let payload = Bytes::from_static(br#"{"model":"m","messages":[]}"#);

        let resp = relay.forward(payload.clone()).await.unwrap();
        assert_eq!(resp.status().as_u16(), 202);

        let header = relayed_header(&resp).unwrap();
        assert_eq!(header.status.as_u16(), 202);
        assert_eq!(
            header.headers.get("content-type").unwrap(),
            "application/json"
        );
        assert!(header.headers.get("x-upstream-trace").is_none());

        let echoed: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(echoed["auth"], "Bearer sk-service");
        assert_eq!(echoed["length"], payload.len().to_string());
        assert_eq!(echoed["body"]["model"], "m");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let relay = relay_for(format!("http://127.0.0.1:{port}"));

        let err = relay.forward(Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err.status(), 502);
        assert_eq!(err.kind(), "upstream_error");
    }

    #[tokio::test]
    async fn unknown_length_response_is_chunk_framed() {
        let base = spawn(Router::new().route(
            "/v1/chat/completions",
            post(streamed_completions),
        ))
        .await;
        let relay = relay_for(base);

        let mut resp = relay
            .forward(Bytes::from_static(br#"{"stream":true}"#))
            .await
            .unwrap();
        let header = relayed_header(&resp).unwrap();
        assert_eq!(header.status.as_u16(), 200);
        assert!(header.headers.get("content-length").is_none());
        assert_eq!(header.headers.get("transfer-encoding").unwrap(), "chunked");
        assert_eq!(
            header.headers.get("content-type").unwrap(),
            "text/event-stream"
        );

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8(body).unwrap(), EVENTS.concat());
    }

    #[tokio::test]
    async fn stalled_upstream_times_out_as_bad_gateway() {
        let base = spawn(Router::new().route(
            "/v1/chat/completions",
            post(stalled_completions),
        ))
        .await;
        let relay = relay_with(base, 1);

        let started = std::time::Instant::now();
        let err = relay.forward(Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err.status(), 502);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
