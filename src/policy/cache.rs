//! Cache policy: per-route TTL and stale-while-revalidate settings.

use super::{PolicyCore, PolicyOptions, PolicySpec, PolicyToggle};
use crate::serialize::KeySerializer;
use http::{Method, StatusCode};
use std::collections::HashSet;
use std::time::Duration;

/// Effective cache settings for a matched route.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub ttl: Duration,
    /// Entries older than this serve stale and trigger revalidation.
    pub stale_in: Option<Duration>,
    /// Half-open `[lo, hi)` range of storable statuses.
    pub storable_status: (u16, u16),
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            stale_in: None,
            storable_status: (200, 300),
        }
    }
}

impl CacheSettings {
    pub fn is_storable(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        self.storable_status.0 <= code && code < self.storable_status.1
    }
}

/// Per-rule overrides.
#[derive(Debug, Clone, Default)]
pub struct CacheRule {
    pub ttl: Option<Duration>,
    pub stale_in: Option<Duration>,
    pub storable_status: Option<(u16, u16)>,
}

pub struct CacheSpec;

impl PolicySpec for CacheSpec {
    type Settings = CacheSettings;
    type RuleFields = CacheRule;

    fn default_methods() -> HashSet<Method> {
        [Method::GET, Method::HEAD].into_iter().collect()
    }

    fn default_serializer() -> KeySerializer {
        KeySerializer::default()
    }

    fn merge(defaults: &CacheSettings, fields: &CacheRule) -> CacheSettings {
        CacheSettings {
            ttl: fields.ttl.unwrap_or(defaults.ttl),
            stale_in: fields.stale_in.or(defaults.stale_in),
            storable_status: fields.storable_status.unwrap_or(defaults.storable_status),
        }
    }
}

pub type CachePolicy = PolicyCore<CacheSpec>;
pub type CacheOptions = PolicyOptions<CacheSpec>;
pub type CacheToggle = PolicyToggle<CacheOptions>;

impl CachePolicy {
    pub fn from_toggle(toggle: CacheToggle) -> Self {
        PolicyCore::init(toggle, CacheSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::{Rule, RouteMatch};

    #[test]
    fn rule_overrides_merge_over_defaults() {
        let policy = CachePolicy::from_toggle(PolicyToggle::Configured(
            CacheOptions::new(CacheSettings {
                ttl: Duration::from_secs(60),
                stale_in: Some(Duration::from_secs(30)),
                ..Default::default()
            })
            .rule(Rule::new(
                RouteMatch::StartsWith("/u".into()),
                CacheRule { ttl: Some(Duration::from_secs(5)), ..Default::default() },
            )),
        ));

        let settings = policy.resolve(&Method::GET, "/u/1", None).unwrap();
        assert_eq!(settings.ttl, Duration::from_secs(5));
        assert_eq!(settings.stale_in, Some(Duration::from_secs(30)));
    }

    #[test]
    fn default_methods_cover_safe_reads_only() {
        let policy = CachePolicy::from_toggle(CacheToggle::Defaults);
        assert!(policy.resolve(&Method::GET, "/x", None).is_some());
        assert!(policy.resolve(&Method::HEAD, "/x", None).is_some());
        assert!(policy.resolve(&Method::POST, "/x", None).is_none());
    }

    #[test]
    fn storable_status_is_a_half_open_range() {
        let settings = CacheSettings::default();
        assert!(settings.is_storable(StatusCode::OK));
        assert!(settings.is_storable(StatusCode::NO_CONTENT));
        assert!(!settings.is_storable(StatusCode::MULTIPLE_CHOICES));
        assert!(!settings.is_storable(StatusCode::NOT_FOUND));
    }
}
