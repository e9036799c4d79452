//! Rate-limit policy: per-endpoint bucket shapes.
//!
//! Bucket selection uses the endpoint serializer (`METHOD:path`) so every
//! call to the same route shares a token reservoir regardless of query or
//! payload.

use super::{PolicyCore, PolicyOptions, PolicySpec, PolicyToggle};
use crate::rate_limit::BucketConfig;
use crate::serialize::KeySerializer;
use http::Method;
use std::collections::HashSet;

/// Effective rate-limit settings for a matched route.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleSettings {
    pub bucket: BucketConfig,
    /// Default waiter priority; lower is served earlier. Per-call options
    /// override.
    pub priority: i64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self { bucket: BucketConfig::default(), priority: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThrottleRule {
    pub capacity: Option<f64>,
    pub refill_per_sec: Option<f64>,
    pub max_queue: Option<usize>,
    pub priority: Option<i64>,
}

pub struct ThrottleSpec;

impl PolicySpec for ThrottleSpec {
    type Settings = ThrottleSettings;
    type RuleFields = ThrottleRule;

    fn default_methods() -> HashSet<Method> {
        [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ]
        .into_iter()
        .collect()
    }

    fn default_serializer() -> KeySerializer {
        KeySerializer::Endpoint
    }

    fn merge(defaults: &ThrottleSettings, fields: &ThrottleRule) -> ThrottleSettings {
        ThrottleSettings {
            bucket: BucketConfig {
                capacity: fields.capacity.unwrap_or(defaults.bucket.capacity),
                refill_per_sec: fields.refill_per_sec.unwrap_or(defaults.bucket.refill_per_sec),
                max_queue: fields.max_queue.unwrap_or(defaults.bucket.max_queue),
            },
            priority: fields.priority.unwrap_or(defaults.priority),
        }
    }
}

pub type ThrottlePolicy = PolicyCore<ThrottleSpec>;
pub type ThrottleOptions = PolicyOptions<ThrottleSpec>;
pub type ThrottleToggle = PolicyToggle<ThrottleOptions>;

impl ThrottlePolicy {
    pub fn from_toggle(toggle: ThrottleToggle) -> Self {
        PolicyCore::init(toggle, ThrottleSettings::default())
    }
}
