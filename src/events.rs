//! Lifecycle event bus.
//!
//! A small synchronous pub/sub used by the engine to report every stage of
//! a call. Listeners subscribe to an exact event name or a regex over
//! names; handlers run inline from `emit` in registration order and are
//! panic-isolated so one bad listener cannot break the call or its peers.

use regex::Regex;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Canonical lifecycle event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Before,
    After,
    Response,
    Error,
    Retry,
    Abort,
    ModifyOptionsChange,
    ModifyMethodOptionsChange,
    StateSet,
    StateReset,
    HeaderAdd,
    HeaderRemove,
    ParamAdd,
    ParamRemove,
    UrlChange,
    DedupeStart,
    DedupeJoin,
    DedupeComplete,
    DedupeError,
    CacheHit,
    CacheMiss,
    CacheStale,
    CacheSet,
    CacheExpire,
    CacheRevalidate,
    CacheRevalidateError,
    RateLimitWait,
    RateLimitAcquire,
    RateLimitReject,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "fetch-before",
            Self::After => "fetch-after",
            Self::Response => "fetch-response",
            Self::Error => "fetch-error",
            Self::Retry => "fetch-retry",
            Self::Abort => "fetch-abort",
            Self::ModifyOptionsChange => "fetch-modify-options-change",
            Self::ModifyMethodOptionsChange => "fetch-modify-method-options-change",
            Self::StateSet => "fetch-state-set",
            Self::StateReset => "fetch-state-reset",
            Self::HeaderAdd => "fetch-header-add",
            Self::HeaderRemove => "fetch-header-remove",
            Self::ParamAdd => "fetch-param-add",
            Self::ParamRemove => "fetch-param-remove",
            Self::UrlChange => "fetch-url-change",
            Self::DedupeStart => "fetch-dedupe-start",
            Self::DedupeJoin => "fetch-dedupe-join",
            Self::DedupeComplete => "fetch-dedupe-complete",
            Self::DedupeError => "fetch-dedupe-error",
            Self::CacheHit => "fetch-cache-hit",
            Self::CacheMiss => "fetch-cache-miss",
            Self::CacheStale => "fetch-cache-stale",
            Self::CacheSet => "fetch-cache-set",
            Self::CacheExpire => "fetch-cache-expire",
            Self::CacheRevalidate => "fetch-cache-revalidate",
            Self::CacheRevalidateError => "fetch-cache-revalidate-error",
            Self::RateLimitWait => "fetch-ratelimit-wait",
            Self::RateLimitAcquire => "fetch-ratelimit-acquire",
            Self::RateLimitReject => "fetch-ratelimit-reject",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An emitted event: a name plus a plain data record.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: EventName,
    pub data: Value,
}

/// What a listener subscribes to.
#[derive(Debug, Clone)]
pub enum EventFilter {
    Exact(EventName),
    Pattern(Regex),
}

impl EventFilter {
    fn matches(&self, name: EventName) -> bool {
        match self {
            Self::Exact(expected) => *expected == name,
            Self::Pattern(re) => re.is_match(name.as_str()),
        }
    }

    fn same_as(&self, other: &EventFilter) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl From<EventName> for EventFilter {
    fn from(name: EventName) -> Self {
        Self::Exact(name)
    }
}

impl From<Regex> for EventFilter {
    fn from(re: Regex) -> Self {
        Self::Pattern(re)
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token identifying a registration, for `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    filter: EventFilter,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct BusInner {
    listeners: Vec<Listener>,
    next_id: u64,
}

/// Synchronous event bus with exact and regex subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, filter: impl Into<EventFilter>, handler: Handler) -> ListenerId {
        self.register(filter.into(), handler, false)
    }

    /// Like [`on`](Self::on) but the listener removes itself after the
    /// first matching event.
    pub fn once(&self, filter: impl Into<EventFilter>, handler: Handler) -> ListenerId {
        self.register(filter.into(), handler, true)
    }

    fn register(&self, filter: EventFilter, handler: Handler, once: bool) -> ListenerId {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push(Listener { id, filter, handler, once });
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.listeners.len();
        inner.listeners.retain(|l| l.id != id);
        inner.listeners.len() != before
    }

    /// Remove a specific handler registered under an equivalent filter.
    pub fn off_handler(&self, filter: &EventFilter, handler: &Handler) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.listeners.len();
        inner
            .listeners
            .retain(|l| !(l.filter.same_as(filter) && Arc::ptr_eq(&l.handler, handler)));
        inner.listeners.len() != before
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).listeners.len()
    }

    /// Dispatch to every matching listener, in registration order. A
    /// panicking handler is reported and skipped; the rest still run.
    pub fn emit(&self, name: EventName, data: Value) {
        let event = Event { name, data };
        let matched: Vec<Handler> = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let matched: Vec<Handler> = inner
                .listeners
                .iter()
                .filter(|l| l.filter.matches(name))
                .map(|l| Arc::clone(&l.handler))
                .collect();
            inner.listeners.retain(|l| !(l.once && l.filter.matches(name)));
            matched
        };
        for handler in matched {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(event = %name, "event listener panicked; continuing");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
