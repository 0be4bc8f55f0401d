//! The engine transport boundary (spec §4.7/§6): an opaque HTTP/JSON
//! interface the kernel never reasons about beyond status codes and
//! timeouts. Implementations own TLS, socket errors, and JSON framing;
//! everything that crosses this boundary is an opaque byte response or an
//! [`EngineError`] the implementation has already classified as best it can.
//!
//! Grounded on the teacher's `control::Transport` trait shape (associated
//! error type, decode/encode split) generalized from a single `handle` verb
//! to the three HTTP verbs the wire protocol table (spec §6) actually uses.

use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A raw, already-HTTP-complete response: status code plus body bytes.
/// 2xx/4xx/5xx are all represented here; only transport-level failures
/// (DNS, socket, deadline) become an `Err`.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| EngineError::new(crate::error::ErrorKind::Unknown, format!("response decode failed: {e}")))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type Headers = HashMap<String, String>;

/// `EngineTransport` — the sole external collaborator the kernel depends
/// on (spec §4.7). Implementations surface DNS/socket failures and
/// timed-out calls as `Err(EngineError)`, already classified per §6's
/// status-code table where the failure occurred before a response was
/// received at all (a received response, even 5xx, is always `Ok`).
#[async_trait]
pub trait EngineTransport: Send + Sync {
    async fn post(&self, url: &str, headers: &Headers, body: &[u8], timeout: Duration) -> Result<RawResponse, EngineError>;

    async fn get(&self, url: &str, headers: &Headers, timeout: Duration) -> Result<RawResponse, EngineError>;

    async fn delete(&self, url: &str, headers: &Headers, timeout: Duration) -> Result<RawResponse, EngineError>;
}

/// Classify a received response's status code per the wire protocol table
/// (spec §6). Only meaningful for non-2xx responses; callers check
/// `RawResponse::is_success` first.
pub fn classify_status(status: u16, message: impl Into<String>) -> EngineError {
    EngineError::from_status(status, message)
}

/// Parse an HTTP `Retry-After` header value (seconds, per RFC 7231 §7.1.3 —
/// only the delta-seconds form; an HTTP-date value is left unparsed since
/// the engine only ever sends the numeric form).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Build the authentication header map for a request: the engine's
/// API-key header when credentials are configured, merged with
/// caller-supplied headers last (spec §6 "Additional caller-supplied
/// headers are merged last").
pub fn build_headers(api_key_header: Option<(&str, &str)>, extra: &Headers) -> Headers {
    let mut headers = Headers::new();
    if let Some((name, value)) = api_key_header {
        headers.insert(name.to_string(), value.to_string());
    }
    for (k, v) in extra {
        headers.insert(k.clone(), v.clone());
    }
    headers
}
