//! Retry driver: attempt loop with backoff, jitter, and a pluggable
//! predicate.
//!
//! The driver only recovers errors its predicate votes to retry; anything
//! else surfaces immediately. Delays run through the [`Sleeper`] trait and
//! are interruptible by the call's abort signal. The driver assumes the
//! operation is safe to re-run; policy rules should restrict retries to
//! idempotent methods.

use crate::abort::AbortSignal;
use crate::error::FetchError;
use crate::sleeper::{Sleeper, TokioSleeper};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of the retry predicate for one failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryVerdict {
    /// Surface the error now.
    Stop,
    /// Retry after the computed backoff delay.
    Retry,
    /// Retry after exactly this delay. Zero retries immediately.
    After(Duration),
}

pub type RetryPredicate = Arc<dyn Fn(&FetchError, u32) -> RetryVerdict + Send + Sync>;

/// Backoff and attempt limits.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the multiplicative jitter term: the delay is scaled
    /// by `1 + uniform(0, jitter_factor)`.
    pub jitter_factor: f64,
    pub retryable_status: Vec<u16>,
    /// On exhaustion, propagate the last underlying error instead of a
    /// `RetryExhausted` wrapper.
    pub throw_last_error: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
            retryable_status: vec![408, 425, 429, 500, 502, 503, 504],
            throw_last_error: false,
        }
    }
}

/// Per-run callbacks.
pub struct RetryHooks<'a, T> {
    /// Invoked before every attempt after the first, with the error being
    /// retried, the upcoming attempt number, and the chosen delay.
    pub on_retry: Option<&'a (dyn Fn(&FetchError, u32, Duration) + Send + Sync)>,
    /// Invoked at exhaustion; a `Some` return replaces the error entirely
    /// and takes precedence over `throw_last_error`.
    pub on_exhausted: Option<&'a (dyn Fn(&FetchError) -> Option<T> + Send + Sync)>,
}

impl<T> Default for RetryHooks<'_, T> {
    fn default() -> Self {
        Self { on_retry: None, on_exhausted: None }
    }
}

#[derive(Clone)]
pub struct RetryDriver {
    config: RetryConfig,
    predicate: RetryPredicate,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryDriver")
            .field("config", &self.config)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl RetryDriver {
    pub fn new(config: RetryConfig) -> Self {
        let predicate = Self::default_predicate(config.retryable_status.clone());
        Self { config, predicate, sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries transport failures, timeouts, and HTTP failures whose
    /// status is in the retryable set.
    pub fn default_predicate(retryable_status: Vec<u16>) -> RetryPredicate {
        Arc::new(move |error, _attempt| match error {
            FetchError::Network { .. } | FetchError::Timeout { .. } => RetryVerdict::Retry,
            FetchError::Http { status, .. } if retryable_status.contains(&status.as_u16()) => {
                RetryVerdict::Retry
            }
            _ => RetryVerdict::Stop,
        })
    }

    /// `min(max_delay, base × multiplier^(attempt−1)) × (1 + uniform(0, jitter))`.
    fn computed_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let exp = base * self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let jitter = if self.config.jitter_factor > 0.0 {
            rand::rng().random_range(0.0..=self.config.jitter_factor)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).round() as u64)
    }

    /// Run `op(attempt)` (1-based) until it succeeds, the predicate stops
    /// the loop, the signal aborts, or attempts run out.
    pub async fn run<T, F, Fut>(
        &self,
        signal: &AbortSignal,
        hooks: RetryHooks<'_, T>,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if signal.is_aborted() {
                return Err(FetchError::aborted(signal.reason()));
            }

            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = match (self.predicate)(&error, attempt) {
                RetryVerdict::Stop => return Err(error),
                RetryVerdict::Retry => self.computed_delay(attempt),
                RetryVerdict::After(delay) => delay,
            };

            if attempt == max_attempts {
                return self.exhausted(error, &hooks);
            }

            if let Some(on_retry) = hooks.on_retry {
                on_retry(&error, attempt + 1, delay);
            }

            tokio::select! {
                _ = signal.cancelled() => return Err(FetchError::aborted(signal.reason())),
                _ = self.sleeper.backoff(attempt + 1, delay) => {}
            }
        }

        unreachable!("retry loop returns from its final attempt")
    }

    fn exhausted<T>(
        &self,
        last: FetchError,
        hooks: &RetryHooks<'_, T>,
    ) -> Result<T, FetchError> {
        tracing::debug!(attempts = self.config.max_attempts, error = %last, "retries exhausted");
        if let Some(on_exhausted) = hooks.on_exhausted {
            if let Some(replacement) = on_exhausted(&last) {
                return Ok(replacement);
            }
        }
        if self.config.throw_last_error {
            return Err(last);
        }
        Err(FetchError::RetryExhausted {
            attempts: self.config.max_attempts,
            last: Box::new(last),
        })
    }
}
