//! Dedupe policy: which routes share an in-flight request.
//!
//! The policy itself only answers "does this call dedupe, and under what
//! key"; the engine performs the originate-or-join dance against the
//! single-flight coordinator.

use super::{PolicyCore, PolicyOptions, PolicySpec, PolicyToggle};
use crate::serialize::KeySerializer;
use http::Method;
use std::collections::HashSet;

/// Dedupe carries no tunables; a resolved value means the call dedupes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeSettings;

#[derive(Debug, Clone, Default)]
pub struct DedupeRule;

pub struct DedupeSpec;

impl PolicySpec for DedupeSpec {
    type Settings = DedupeSettings;
    type RuleFields = DedupeRule;

    fn default_methods() -> HashSet<Method> {
        [Method::GET, Method::HEAD, Method::OPTIONS].into_iter().collect()
    }

    fn default_serializer() -> KeySerializer {
        KeySerializer::default()
    }

    fn merge(_defaults: &DedupeSettings, _fields: &DedupeRule) -> DedupeSettings {
        DedupeSettings
    }
}

pub type DedupePolicy = PolicyCore<DedupeSpec>;
pub type DedupeOptions = PolicyOptions<DedupeSpec>;
pub type DedupeToggle = PolicyToggle<DedupeOptions>;

impl DedupePolicy {
    pub fn from_toggle(toggle: DedupeToggle) -> Self {
        PolicyCore::init(toggle, DedupeSettings)
    }
}
