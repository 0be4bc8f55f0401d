//! Error taxonomy and classification.
//!
//! Every failure that crosses the boundary between this crate and the
//! outside world — a transport call, a JSON decode, a caller-supplied
//! closure — is classified exactly once into an [`ErrorKind`]. Everything
//! above the kernel (polling, the reactive client, the cache, the queue)
//! reasons in terms of kinds, never in terms of the original failure.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// The closed set of failure kinds this crate distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Authentication,
    Workflow,
    Timeout,
    ServerError,
    RateLimit,
    Unknown,
}

impl ErrorKind {
    /// Kinds the kernel will retry by default, absent a narrower policy.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::RateLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Workflow => "workflow",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServerError => "serverError",
            ErrorKind::RateLimit => "rateLimit",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Free-form metadata attached to a classified error. `retry_after` is the
/// one field the kernel itself reads (§4.1); everything else is opaque
/// passthrough for callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorMetadata {
    pub retry_after: Option<Duration>,
    pub fields: HashMap<String, String>,
}

impl ErrorMetadata {
    pub fn with_retry_after(retry_after: Duration) -> Self {
        Self { retry_after: Some(retry_after), fields: HashMap::new() }
    }
}

/// A classified failure. This is the crate's universal error type: the
/// kernel produces it, retries reason about it, and it is what ultimately
/// reaches `errors$`.
#[derive(Debug, Clone)]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    is_retryable: bool,
    metadata: Option<ErrorMetadata>,
    created_at: SystemTime,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let is_retryable = kind.is_recoverable();
        Self {
            kind,
            message: message.into(),
            status: None,
            is_retryable,
            metadata: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable;
        self
    }

    pub fn with_metadata(mut self, metadata: ErrorMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_retryable(&self) -> bool {
        self.is_retryable
    }

    pub fn metadata(&self) -> Option<&ErrorMetadata> {
        self.metadata.as_ref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.metadata.as_ref().and_then(|m| m.retry_after)
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The error the kernel returns when the breaker is open. Reported as
    /// non-retryable per spec §4.1 so the caller's own retry loop, if any,
    /// does not spin against it.
    pub fn circuit_open(failure_count: usize, open_duration: Duration) -> Self {
        let mut fields = HashMap::new();
        fields.insert("circuitBreakerState".to_string(), "open".to_string());
        fields.insert("failureCount".to_string(), failure_count.to_string());
        Self::new(
            ErrorKind::ServerError,
            format!("circuit breaker open ({failure_count} failures, open for {open_duration:?})"),
        )
        .with_retryable(false)
        .with_metadata(ErrorMetadata { retry_after: None, fields })
    }

    /// The error returned for a status-fetch attempted on a provisional id.
    pub fn provisional_id_rejected(id: &str) -> Self {
        Self::new(ErrorKind::Workflow, format!("cannot fetch status for provisional id {id}"))
            .with_retryable(false)
    }

    /// Map an HTTP-style status code onto a kind, per the wire protocol
    /// table (spec §6).
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            200..=299 => ErrorKind::Unknown, // callers never construct this for 2xx
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::Workflow,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, message).with_status(status)
    }

    /// Classify an arbitrary upstream failure (spec §4.1 `classify`).
    ///
    /// A timeout-shaped failure (signalled via [`TimeoutLike`]) becomes
    /// [`ErrorKind::Timeout`]; an `EngineError` passes through unchanged;
    /// everything else becomes [`ErrorKind::Unknown`].
    pub fn classify<E: ClassifyInput>(failure: E) -> Self {
        failure.classify()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {status})")?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

/// Implemented by anything `classify` can turn into an [`EngineError`].
/// `EngineError` itself passes through; a bare elapsed-duration marks a
/// timeout; anything else is `unknown`.
pub trait ClassifyInput {
    fn classify(self) -> EngineError;
}

impl ClassifyInput for EngineError {
    fn classify(self) -> EngineError {
        self
    }
}

/// Marker wrapping a transport-reported deadline elapsing, so `classify`
/// can distinguish it from an arbitrary string failure.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLike {
    pub elapsed: Duration,
}

impl ClassifyInput for TimeoutLike {
    fn classify(self) -> EngineError {
        let mut fields = HashMap::new();
        fields.insert("elapsedMs".to_string(), self.elapsed.as_millis().to_string());
        EngineError::new(ErrorKind::Timeout, format!("operation timed out after {:?}", self.elapsed))
            .with_metadata(ErrorMetadata { retry_after: None, fields })
    }
}

impl ClassifyInput for &str {
    fn classify(self) -> EngineError {
        EngineError::new(ErrorKind::Unknown, self.to_string())
    }
}

impl ClassifyInput for String {
    fn classify(self) -> EngineError {
        EngineError::new(ErrorKind::Unknown, self)
    }
}
