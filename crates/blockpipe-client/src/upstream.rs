//! Upstream call transport.
//!
//! [`Upstream`] is the seam between the batching layer and the node. The
//! batching layer only needs a classified failure per call, so every
//! implementation maps its transport errors onto [`ErrorKind`]s:
//!
//! | Signal                                        | Kind                |
//! |-----------------------------------------------|---------------------|
//! | HTTP 429, JSON-RPC -32005, "rate limit" text  | `RateLimited`       |
//! | client-side timeout                           | `Timeout`           |
//! | connect/reset, HTTP 5xx, JSON-RPC -32603,     | `TransientUpstream` |
//! | undecodable body                              |                     |
//! | other HTTP 4xx, other JSON-RPC errors         | `PermanentRequest`  |

use crate::error::Result;
use async_trait::async_trait;
use blockpipe_core::{CallError, ErrorKind};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// A request/response transport to the node.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn invoke(&self, method: &str, params: &[Value]) -> std::result::Result<Value, CallError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "upstream"
    }
}

const JSONRPC_LIMIT_EXCEEDED: i64 = -32005;
const JSONRPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Classify a JSON-RPC error object.
pub fn classify_rpc_error(code: i64, message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if code == JSONRPC_LIMIT_EXCEEDED
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        ErrorKind::RateLimited
    } else if code == JSONRPC_INTERNAL_ERROR {
        ErrorKind::TransientUpstream
    } else {
        ErrorKind::PermanentRequest
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::TransientUpstream,
        _ => ErrorKind::PermanentRequest,
    }
}

fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else {
        ErrorKind::TransientUpstream
    }
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct JsonRpcUpstream {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcUpstream {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Upstream for JsonRpcUpstream {
    async fn invoke(&self, method: &str, params: &[Value]) -> std::result::Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::new(classify_transport(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::new(
                classify_status(status.as_u16()),
                format!("HTTP {} from {}", status, method),
            ));
        }

        let decoded: RpcResponse = response.json().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::TransientUpstream
            };
            CallError::new(kind, format!("invalid JSON-RPC response: {}", e))
        })?;

        if let Some(err) = decoded.error {
            trace!(method, code = err.code, message = %err.message, "JSON-RPC error");
            return Err(CallError::new(
                classify_rpc_error(err.code, &err.message),
                format!("JSON-RPC error {}: {}", err.code, err.message),
            ));
        }

        Ok(decoded.result.unwrap_or(Value::Null))
    }

    fn name(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // ---------------------------------------------------------------
    // Classification
    // ---------------------------------------------------------------

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(429), ErrorKind::RateLimited);
        assert_eq!(classify_status(503), ErrorKind::TransientUpstream);
        assert_eq!(classify_status(500), ErrorKind::TransientUpstream);
        assert_eq!(classify_status(400), ErrorKind::PermanentRequest);
        assert_eq!(classify_status(404), ErrorKind::PermanentRequest);
    }

    #[test]
    fn test_classify_rpc_error() {
        assert_eq!(classify_rpc_error(-32005, "limit exceeded"), ErrorKind::RateLimited);
        assert_eq!(
            classify_rpc_error(-32000, "Rate limit reached, slow down"),
            ErrorKind::RateLimited
        );
        assert_eq!(classify_rpc_error(-32603, "internal"), ErrorKind::TransientUpstream);
        assert_eq!(classify_rpc_error(-32602, "invalid params"), ErrorKind::PermanentRequest);
    }

    // ---------------------------------------------------------------
    // HTTP
    // ---------------------------------------------------------------

    async fn upstream_for(server: &MockServer) -> JsonRpcUpstream {
        JsonRpcUpstream::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_returns_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"})),
            )
            .mount(&server)
            .await;

        let upstream = upstream_for(&server).await;
        let value = upstream.invoke("eth_blockNumber", &[]).await.unwrap();
        assert_eq!(value, json!("0x10"));
    }

    #[tokio::test]
    async fn test_http_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = upstream_for(&server)
            .await
            .invoke("eth_blockNumber", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_http_502_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = upstream_for(&server)
            .await
            .invoke("eth_blockNumber", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientUpstream);
    }

    #[tokio::test]
    async fn test_rpc_error_body_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32602, "message": "invalid argument 0"}
            })))
            .mount(&server)
            .await;

        let err = upstream_for(&server)
            .await
            .invoke("eth_getBlockByNumber", &[json!("zz")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermanentRequest);
        assert!(err.message.contains("-32602"));
    }

    #[tokio::test]
    async fn test_garbage_body_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let err = upstream_for(&server)
            .await
            .invoke("eth_blockNumber", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientUpstream);
    }

    #[tokio::test]
    async fn test_slow_response_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "0x1"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let upstream = JsonRpcUpstream::new(server.uri(), Duration::from_millis(50)).unwrap();
        let err = upstream.invoke("eth_blockNumber", &[]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
