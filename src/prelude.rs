//! Convenient re-exports for common Surefetch types.
pub use crate::{
    abort::{AbortController, AbortSignal},
    engine::options::{CallOptions, EngineOptions, RetryOptions},
    engine::FetchEngine,
    error::{FailureStep, FetchError},
    events::{Event, EventFilter, EventName},
    policy::cache::{CacheOptions, CacheRule, CacheSettings},
    policy::dedupe::{DedupeOptions, DedupeRule},
    policy::rules::{Rule, RouteMatch},
    policy::throttle::{ThrottleOptions, ThrottleRule, ThrottleSettings},
    policy::PolicyToggle,
    rate_limit::BucketConfig,
    request::{ResponseData, ResponseEnvelope, ResponseType},
    retry::{RetryConfig, RetryVerdict},
    serialize::KeySerializer,
    single_flight::store::InMemoryStore,
};
