//! Token-bucket rate limiter with priority-ordered waiters.
//!
//! Buckets are keyed by endpoint and refill lazily: every admission and
//! dispatch first credits `elapsed × refill_rate` tokens, clamped to
//! capacity. Fractional tokens accumulate; nothing about a waiter arriving
//! mints one. When no whole token is available the caller parks in a
//! priority queue (FIFO within a priority) and a single timer per bucket
//! sleeps until the next whole-token instant, then resolves as many
//! waiters as there are whole tokens. A waiter that stops listening gives
//! its place up without consuming a token or disturbing its peers.

use crate::abort::AbortSignal;
use crate::clock::Clock;
use crate::error::FetchError;
use crate::heap::{PriorityQueue, TieBreak};
use futures::future::OptionFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

/// Shape of one bucket. Capacity and refill rate may differ per endpoint
/// rule; the bucket picks up changes on its next admission.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Waiters beyond this are rejected outright.
    pub max_queue: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { capacity: 10.0, refill_per_sec: 10.0, max_queue: 1024 }
    }
}

#[derive(Debug)]
struct Waiter {
    tx: oneshot::Sender<()>,
    #[allow(dead_code)]
    enqueued_at: u64,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill: u64,
    waiters: PriorityQueue<Waiter>,
    timer_armed: bool,
}

impl Bucket {
    fn new(config: &BucketConfig, now: u64) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_ms: config.refill_per_sec / 1_000.0,
            tokens: config.capacity,
            last_refill: now,
            waiters: PriorityQueue::new(TieBreak::Fifo),
            timer_armed: false,
        }
    }

    fn reconfigure(&mut self, config: &BucketConfig) {
        self.capacity = config.capacity;
        self.refill_per_ms = config.refill_per_sec / 1_000.0;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Milliseconds until a whole token exists, at the current rate.
    fn millis_until_token(&self) -> u64 {
        if self.tokens >= 1.0 {
            return 0;
        }
        if self.refill_per_ms <= 0.0 {
            return u64::MAX;
        }
        (((1.0 - self.tokens) / self.refill_per_ms).ceil() as u64).max(1)
    }
}

/// Result of a non-blocking admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// A token was available; the caller may proceed.
    Granted,
    /// The caller is parked; await the wait for its token.
    Enqueued(TokenWait),
}

/// A parked waiter's ticket. Dropping it abandons the spot.
#[derive(Debug)]
pub struct TokenWait {
    rx: oneshot::Receiver<()>,
}

impl TokenWait {
    pub async fn acquired(self) -> Result<(), FetchError> {
        self.rx
            .await
            .map_err(|_| FetchError::aborted("rate limiter shut down"))
    }
}

struct LimiterInner {
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

/// Per-endpoint token buckets sharing one clock.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self.inner.buckets.lock().unwrap_or_else(|p| p.into_inner());
        f.debug_struct("RateLimiter").field("buckets", &buckets.len()).finish()
    }
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(LimiterInner { clock, buckets: Mutex::new(HashMap::new()) }),
        }
    }

    /// Try to take a token from `key`'s bucket, parking on contention.
    /// Rejections (zero capacity, full queue) are immediate.
    pub fn admit(
        &self,
        key: &str,
        config: &BucketConfig,
        priority: i64,
    ) -> Result<Admission, FetchError> {
        if config.capacity < 1.0 {
            return Err(FetchError::RateLimitRejected {
                key: key.to_string(),
                reason: "bucket capacity is zero".to_string(),
            });
        }

        let now = self.inner.clock.now_millis();
        let mut buckets = self.lock_buckets();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(config, now));
        bucket.reconfigure(config);
        bucket.refill(now);

        if bucket.waiters.len() >= config.max_queue {
            // Abandoned waiters still occupy slots until a dispatch skips
            // them; purge before giving up.
            bucket.waiters.retain(|w| !w.tx.is_closed());
        }
        if bucket.waiters.len() >= config.max_queue {
            return Err(FetchError::RateLimitRejected {
                key: key.to_string(),
                reason: format!("waiter queue full ({})", config.max_queue),
            });
        }

        if bucket.waiters.is_empty() && bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(Admission::Granted);
        }

        let (tx, rx) = oneshot::channel();
        bucket.waiters.push(Waiter { tx, enqueued_at: now }, priority);
        self.arm_timer(key, bucket);
        Ok(Admission::Enqueued(TokenWait { rx }))
    }

    /// Blocking admission: waits for a token, a signal abort, or the
    /// timeout, whichever lands first.
    pub async fn acquire(
        &self,
        key: &str,
        config: &BucketConfig,
        priority: i64,
        signal: Option<&AbortSignal>,
        timeout: Option<Duration>,
    ) -> Result<(), FetchError> {
        let wait = match self.admit(key, config, priority)? {
            Admission::Granted => return Ok(()),
            Admission::Enqueued(wait) => wait,
        };

        let signal_cancelled: OptionFuture<_> = signal.map(|s| s.cancelled()).into();
        // Bounded stand-in when no timeout is set; the precondition below
        // keeps the arm from ever firing, but the sleep is still built.
        let deadline = timeout.unwrap_or(Duration::from_secs(86_400));
        tokio::select! {
            outcome = wait.acquired() => outcome,
            Some(()) = signal_cancelled => Err(FetchError::aborted(
                signal.map(|s| s.reason()).unwrap_or_else(|| "aborted".to_string()),
            )),
            _ = tokio::time::sleep(deadline), if timeout.is_some() => Err(FetchError::Timeout {
                elapsed: deadline,
                limit: deadline,
            }),
        }
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.inner.buckets.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Schedule the next dispatch for `key`. One timer per bucket.
    fn arm_timer(&self, key: &str, bucket: &mut Bucket) {
        if bucket.timer_armed || bucket.waiters.is_empty() {
            return;
        }
        let wait_ms = bucket.millis_until_token();
        if wait_ms == u64::MAX {
            return;
        }
        bucket.timer_armed = true;

        let limiter = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            limiter.dispatch(&key);
        });
    }

    /// Resolve as many waiters as there are whole tokens, skipping
    /// abandoned ones, then re-arm if anyone is still parked.
    fn dispatch(&self, key: &str) {
        let now = self.inner.clock.now_millis();
        let mut buckets = self.lock_buckets();
        let Some(bucket) = buckets.get_mut(key) else { return };
        bucket.timer_armed = false;
        bucket.refill(now);

        while bucket.tokens >= 1.0 {
            match bucket.waiters.pop() {
                None => break,
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        bucket.tokens -= 1.0;
                    }
                }
            }
        }

        if !bucket.waiters.is_empty() {
            self.arm_timer(key, bucket);
        }
    }

    /// Live waiter count for a bucket.
    pub fn queue_len(&self, key: &str) -> usize {
        self.lock_buckets().get(key).map_or(0, |b| b.waiters.len())
    }
}
