//! Engine construction options and per-call overrides.

use crate::abort::AbortSignal;
use crate::error::FetchError;
use crate::policy::cache::CacheToggle;
use crate::policy::dedupe::DedupeToggle;
use crate::policy::throttle::ThrottleToggle;
use crate::policy::PolicyToggle;
use crate::request::ResponseType;
use crate::retry::{RetryConfig, RetryPredicate};
use http::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A function that rewrites the effective per-call options. Modifiers must
/// be pure over their input; the engine applies global, then
/// method-scoped, then per-call modifiers.
pub type Modifier = Arc<dyn Fn(CallOptions) -> CallOptions + Send + Sync>;

/// Validates a header/param map; an `Err` string becomes a `Config` error.
pub type MapValidator = Arc<dyn Fn(&HashMap<String, String>) -> Result<(), String> + Send + Sync>;

/// Validates the caller state bag.
pub type StateValidator =
    Arc<dyn Fn(&HashMap<String, Value>) -> Result<(), String> + Send + Sync>;

/// Validation hooks.
#[derive(Clone, Default)]
pub struct ValidateOptions {
    pub headers: Option<MapValidator>,
    pub state: Option<StateValidator>,
    /// Run the header validator against every composed request, not just
    /// on `add_header`.
    pub per_request_headers: bool,
}

impl std::fmt::Debug for ValidateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidateOptions")
            .field("headers", &self.headers.is_some())
            .field("state", &self.state.is_some())
            .field("per_request_headers", &self.per_request_headers)
            .finish()
    }
}

/// Retry configuration plus an optional custom predicate.
#[derive(Clone, Default)]
pub struct RetryOptions {
    pub config: RetryConfig,
    pub should_retry: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("config", &self.config)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

pub type RetryToggle = PolicyToggle<RetryOptions>;

/// Everything an engine is built from. All fields are optional except
/// that `base_url` must be present before any relative path is used.
#[derive(Clone, Default)]
pub struct EngineOptions {
    pub base_url: Option<String>,
    pub default_type: ResponseType,
    pub headers: HashMap<String, String>,
    pub method_headers: HashMap<Method, HashMap<String, String>>,
    pub params: HashMap<String, String>,
    pub method_params: HashMap<Method, HashMap<String, String>>,
    /// Default per-attempt timeout; per-call options override.
    pub timeout: Option<Duration>,
    pub retry: RetryToggle,
    pub dedupe: DedupeToggle,
    pub cache: CacheToggle,
    pub rate_limit: ThrottleToggle,
    pub modify_options: Option<Modifier>,
    pub modify_method_options: HashMap<Method, Modifier>,
    pub validate: ValidateOptions,
    /// Diagnostic name carried on log lines.
    pub name: Option<String>,
    /// Mirror every event through `tracing::debug!`.
    pub spy: bool,
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("base_url", &self.base_url)
            .field("default_type", &self.default_type)
            .field("timeout", &self.timeout)
            .field("name", &self.name)
            .finish()
    }
}

impl EngineOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: Some(base_url.into()), ..Default::default() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn default_type(mut self, response_type: ResponseType) -> Self {
        self.default_type = response_type;
        self
    }

    pub fn retry(mut self, retry: impl Into<RetryToggle>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn dedupe(mut self, dedupe: impl Into<DedupeToggle>) -> Self {
        self.dedupe = dedupe.into();
        self
    }

    pub fn cache(mut self, cache: impl Into<CacheToggle>) -> Self {
        self.cache = cache.into();
        self
    }

    pub fn rate_limit(mut self, rate_limit: impl Into<ThrottleToggle>) -> Self {
        self.rate_limit = rate_limit.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn spy(mut self) -> Self {
        self.spy = true;
        self
    }

    /// Structural validation, run once at construction.
    pub fn validate(&self) -> Result<(), FetchError> {
        if let Some(base) = &self.base_url {
            let url = Url::parse(base)
                .map_err(|e| FetchError::config(format!("invalid base_url {base:?}: {e}")))?;
            if url.cannot_be_a_base() {
                return Err(FetchError::config(format!(
                    "base_url {base:?} cannot serve as a base"
                )));
            }
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(FetchError::config("timeout must be greater than zero"));
        }
        if let PolicyToggle::Configured(retry) = &self.retry {
            if retry.config.max_attempts == 0 {
                return Err(FetchError::config("retry.max_attempts must be at least 1"));
            }
            if retry.config.jitter_factor < 0.0 || !retry.config.jitter_factor.is_finite() {
                return Err(FetchError::config("retry.jitter_factor must be finite and >= 0"));
            }
            if retry.config.backoff_multiplier < 1.0 {
                return Err(FetchError::config("retry.backoff_multiplier must be >= 1"));
            }
            if retry.config.base_delay > retry.config.max_delay {
                return Err(FetchError::config("retry.base_delay exceeds retry.max_delay"));
            }
        }
        if let PolicyToggle::Configured(cache) = &self.cache {
            if cache.settings.ttl.is_zero() {
                return Err(FetchError::config("cache.ttl must be greater than zero"));
            }
            if cache
                .settings
                .stale_in
                .is_some_and(|stale| stale > cache.settings.ttl)
            {
                return Err(FetchError::config("cache.stale_in exceeds cache.ttl"));
            }
        }
        if let PolicyToggle::Configured(throttle) = &self.rate_limit {
            let bucket = &throttle.settings.bucket;
            if !bucket.capacity.is_finite() || bucket.capacity < 0.0 {
                return Err(FetchError::config("rate_limit.capacity must be finite and >= 0"));
            }
            if !bucket.refill_per_sec.is_finite() || bucket.refill_per_sec < 0.0 {
                return Err(FetchError::config(
                    "rate_limit.refill_per_sec must be finite and >= 0",
                ));
            }
        }
        Ok(())
    }
}

/// Per-call overrides handed to a verb method.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub response_type: Option<ResponseType>,
    /// Rate-limit waiter priority; lower is served earlier.
    pub priority: Option<i64>,
    pub signal: Option<AbortSignal>,
    /// Applied after the engine's global and method modifiers.
    pub modify: Option<Modifier>,
    pub skip_cache: bool,
    pub skip_dedupe: bool,
    pub skip_rate_limit: bool,
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("skip_cache", &self.skip_cache)
            .field("skip_dedupe", &self.skip_dedupe)
            .field("skip_rate_limit", &self.skip_rate_limit)
            .finish()
    }
}

impl CallOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn modify(mut self, modify: Modifier) -> Self {
        self.modify = Some(modify);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn skip_dedupe(mut self) -> Self {
        self.skip_dedupe = true;
        self
    }

    pub fn skip_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }
}
