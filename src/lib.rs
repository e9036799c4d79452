#![forbid(unsafe_code)]

//! # Surefetch
//!
//! A resilient HTTP client engine for async Rust: one long-lived
//! [`FetchEngine`] issues requests against a configured base endpoint and
//! runs every call through the same pipeline of composable policies.
//!
//! ## Features
//!
//! - **Retries** with exponential backoff, jitter, and a pluggable predicate
//! - **Response caching** with TTL and stale-while-revalidate
//! - **Request deduplication**: concurrent equivalent calls share one flight
//! - **Per-endpoint rate limiting** with priority-ordered waiters
//! - **Timeouts and cancellation** that propagate through every stage
//! - **Lifecycle events** with exact-name and regex subscriptions
//!
//! ## Quick Start
//!
//! ```no_run
//! use surefetch::{EngineOptions, FetchEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), surefetch::FetchError> {
//!     let engine = FetchEngine::new(
//!         EngineOptions::new("https://api.example.com")
//!             .retry(true)
//!             .dedupe(true)
//!             .cache(true),
//!     )?;
//!
//!     let user = engine.get("/users/1").await?;
//!     println!("status {}", user.status);
//!
//!     engine.destroy();
//!     Ok(())
//! }
//! ```

mod abort;
mod clock;
mod engine;
mod error;
mod events;
mod heap;
mod policy;
mod rate_limit;
mod request;
mod retry;
mod serialize;
mod single_flight;
mod sleeper;

// Re-exports
pub use abort::{AbortController, AbortSignal};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use engine::options::{
    CallOptions, EngineOptions, MapValidator, Modifier, RetryOptions, RetryToggle,
    StateValidator, ValidateOptions,
};
pub use engine::FetchEngine;
pub use error::{FailureStep, FetchError};
pub use events::{Event, EventBus, EventFilter, EventName, ListenerId};
pub use heap::{PriorityQueue, TieBreak};
pub use policy::cache::{CacheOptions, CachePolicy, CacheRule, CacheSettings, CacheToggle};
pub use policy::dedupe::{DedupeOptions, DedupePolicy, DedupeRule, DedupeToggle};
pub use policy::rules::{Rule, RouteMatch};
pub use policy::throttle::{
    ThrottleOptions, ThrottlePolicy, ThrottleRule, ThrottleSettings, ThrottleToggle,
};
pub use policy::{PolicyOptions, PolicySpec, PolicyToggle};
pub use rate_limit::{Admission, BucketConfig, RateLimiter, TokenWait};
pub use request::{RequestContext, ResolvedCall, ResponseData, ResponseEnvelope, ResponseType};
pub use retry::{RetryConfig, RetryDriver, RetryHooks, RetryPredicate, RetryVerdict};
pub use serialize::{endpoint_key, request_key, KeyOptions, KeySerializer};
pub use single_flight::store::{CacheItem, CacheStore, InMemoryStore, StoreError, StoreResult};
pub use single_flight::{CacheLookup, Flight, FlightHandle, FlightStats, JoinedFlight, SingleFlight};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};

pub mod prelude;
