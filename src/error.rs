//! Error types for the request pipeline and its policies.

use http::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Stage of a call at which an HTTP failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStep {
    /// The request never produced a usable response.
    Fetch,
    /// The response arrived but its body could not be decoded.
    Parse,
    /// The response carried a non-success status.
    Response,
}

impl std::fmt::Display for FailureStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureStep::Fetch => write!(f, "fetch"),
            FailureStep::Parse => write!(f, "parse"),
            FailureStep::Response => write!(f, "response"),
        }
    }
}

/// Unified error type for every operation on the engine.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Invalid options at construction or dynamic change.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation on a torn-down engine.
    #[error("engine has been destroyed")]
    Destroyed,

    /// Transport failure: DNS, connection reset, TLS, malformed response.
    #[error("network failure: {source}")]
    Network {
        #[source]
        source: reqwest::Error,
    },

    /// Non-success status, or a success status whose body failed to decode.
    #[error("http {status} on {method} {url} (attempt {attempt}, step {step})")]
    Http {
        status: StatusCode,
        /// Response headers, lowercase keys.
        headers: HashMap<String, String>,
        /// Best-effort parsed body.
        data: Option<serde_json::Value>,
        method: Method,
        url: String,
        attempt: u32,
        step: FailureStep,
    },

    /// The call exceeded its effective timeout.
    #[error("timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// External cancellation; carries the caller's reason unchanged.
    #[error("aborted: {reason}")]
    Aborted { reason: String },

    /// The rate limiter's capacity policy refused admission.
    #[error("rate limit rejected for {key}: {reason}")]
    RateLimitRejected { key: String, reason: String },

    /// All retry attempts were exhausted; wraps the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    /// A deduplicated request failed; every participant in the flight
    /// observes the same underlying error.
    #[error("deduplicated request failed: {source}")]
    Joined {
        #[source]
        source: Arc<FetchError>,
    },

    /// A user-supplied cache adapter failed during a direct invalidation
    /// call. Lookups and stores inside the pipeline never surface this;
    /// they degrade to cache misses instead.
    #[error("cache adapter failure: {message}")]
    CacheAdapter { message: String },
}

impl FetchError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_rate_limit_rejected(&self) -> bool {
        matches!(self, Self::RateLimitRejected { .. })
    }

    /// Status code for HTTP failures, looking through retry-exhaustion and
    /// dedupe wrappers.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RetryExhausted { last, .. } => last.status(),
            Self::Joined { source } => source.status(),
            _ => None,
        }
    }

    /// The innermost error, looking through wrappers.
    pub fn root(&self) -> &FetchError {
        match self {
            Self::RetryExhausted { last, .. } => last.root(),
            Self::Joined { source } => source.root(),
            other => other,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(status: u16) -> FetchError {
        FetchError::Http {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HashMap::new(),
            data: None,
            method: Method::GET,
            url: "https://api.test/x".into(),
            attempt: 1,
            step: FailureStep::Response,
        }
    }

    #[test]
    fn status_looks_through_wrappers() {
        let inner = http_error(503);
        let exhausted = FetchError::RetryExhausted { attempts: 3, last: Box::new(inner) };
        assert_eq!(exhausted.status(), Some(StatusCode::SERVICE_UNAVAILABLE));

        let joined = FetchError::Joined { source: Arc::new(exhausted) };
        assert_eq!(joined.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(joined.root().status().is_some());
    }

    #[test]
    fn display_includes_step_and_attempt() {
        let msg = http_error(404).to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("attempt 1"));
        assert!(msg.contains("step response"));
    }

    #[test]
    fn aborted_carries_reason_unchanged() {
        let err = FetchError::aborted("user walked away");
        assert!(err.is_aborted());
        assert_eq!(err.to_string(), "aborted: user walked away");
    }

    #[test]
    fn predicates_cover_variants() {
        assert!(FetchError::Timeout {
            elapsed: Duration::from_millis(120),
            limit: Duration::from_millis(100),
        }
        .is_timeout());
        assert!(FetchError::RateLimitRejected {
            key: "GET:/x".into(),
            reason: "zero capacity".into(),
        }
        .is_rate_limit_rejected());
        assert!(!FetchError::Destroyed.is_timeout());
    }
}
