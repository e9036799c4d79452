//! Route rules: path matchers plus per-rule overrides.

use http::Method;
use regex::Regex;
use std::collections::HashSet;

/// Path matcher for a rule or an invalidation pattern.
#[derive(Debug, Clone)]
pub enum RouteMatch {
    Is(String),
    StartsWith(String),
    EndsWith(String),
    Includes(String),
    Pattern(Regex),
}

impl RouteMatch {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Is(expected) => path == expected,
            Self::StartsWith(prefix) => path.starts_with(prefix),
            Self::EndsWith(suffix) => path.ends_with(suffix),
            Self::Includes(fragment) => path.contains(fragment),
            Self::Pattern(re) => re.is_match(path),
        }
    }
}

/// One entry in a policy's ordered rule list. The first matching rule
/// wins for a given `(method, path)`.
#[derive(Debug, Clone)]
pub struct Rule<F> {
    pub route: RouteMatch,
    /// Restricts the rule to these methods; absent means the policy's
    /// default method set applies.
    pub methods: Option<HashSet<Method>>,
    /// A matched-but-disabled rule switches the policy off for the route.
    pub enabled: bool,
    pub fields: F,
}

impl<F> Rule<F> {
    pub fn new(route: RouteMatch, fields: F) -> Self {
        Self { route, methods: None, enabled: true, fields }
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
