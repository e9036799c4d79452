//! Shared policy lifecycle: toggle normalization, rule resolution, and
//! per-request memoization.
//!
//! Each policy (cache, dedupe, rate limit) is a [`PolicyCore`] specialized
//! by a [`PolicySpec`] supplying its default method set, key serializer,
//! and rule-merge hook. Resolution scans the ordered rule list once per
//! `(method, path)` and memoizes the merged outcome; skip callbacks are
//! context-dependent and run on every call, never memoized.

pub mod cache;
pub mod dedupe;
pub mod rules;
pub mod throttle;

use crate::serialize::KeySerializer;
use http::Method;
use rules::Rule;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// `false | true | {…}` construction input for a policy.
#[derive(Debug, Clone)]
pub enum PolicyToggle<C> {
    Disabled,
    /// Enabled with the policy's built-in defaults.
    Defaults,
    Configured(C),
}

impl<C> Default for PolicyToggle<C> {
    fn default() -> Self {
        Self::Disabled
    }
}

impl<C> From<bool> for PolicyToggle<C> {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Defaults
        } else {
            Self::Disabled
        }
    }
}

/// Hooks a policy subsystem supplies to the shared core.
pub trait PolicySpec {
    /// Effective per-route settings after merging.
    type Settings: Clone + Send;
    /// Per-rule overrides.
    type RuleFields: Clone + Send;

    fn default_methods() -> HashSet<Method>;
    fn default_serializer() -> KeySerializer;
    fn merge(defaults: &Self::Settings, fields: &Self::RuleFields) -> Self::Settings;
}

/// Full configuration payload for a policy.
pub struct PolicyOptions<S: PolicySpec> {
    /// Policy-wide defaults, applied where rules do not override.
    pub settings: S::Settings,
    pub methods: Option<HashSet<Method>>,
    pub serializer: Option<KeySerializer>,
    pub rules: Vec<Rule<S::RuleFields>>,
}

impl<S: PolicySpec> Clone for PolicyOptions<S> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            methods: self.methods.clone(),
            serializer: self.serializer.clone(),
            rules: self.rules.clone(),
        }
    }
}

impl<S: PolicySpec> PolicyOptions<S> {
    pub fn new(settings: S::Settings) -> Self {
        Self { settings, methods: None, serializer: None, rules: Vec::new() }
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    pub fn serializer(mut self, serializer: KeySerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn rule(mut self, rule: Rule<S::RuleFields>) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Per-instance policy state.
pub struct PolicyCore<S: PolicySpec> {
    enabled: bool,
    methods: HashSet<Method>,
    serializer: KeySerializer,
    settings: S::Settings,
    rules: Vec<Rule<S::RuleFields>>,
    memo: Mutex<HashMap<String, Option<S::Settings>>>,
}

impl<S: PolicySpec> std::fmt::Debug for PolicyCore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCore")
            .field("enabled", &self.enabled)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl<S: PolicySpec> PolicyCore<S> {
    /// Normalize construction input. State only moves through here:
    /// disabled → defaults → configured-with-rules.
    pub fn init(toggle: PolicyToggle<PolicyOptions<S>>, default_settings: S::Settings) -> Self {
        let (enabled, options) = match toggle {
            PolicyToggle::Disabled => (false, PolicyOptions::new(default_settings)),
            PolicyToggle::Defaults => (true, PolicyOptions::new(default_settings)),
            PolicyToggle::Configured(options) => (true, options),
        };
        Self {
            enabled,
            methods: options.methods.unwrap_or_else(S::default_methods),
            serializer: options.serializer.unwrap_or_else(S::default_serializer),
            settings: options.settings,
            rules: options.rules,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn serializer(&self) -> &KeySerializer {
        &self.serializer
    }

    /// Merged settings for this call, or `None` when the policy does not
    /// apply. Memoized per `(method, path)`; `skip` runs every call.
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
        skip: Option<&dyn Fn() -> bool>,
    ) -> Option<S::Settings> {
        if !self.enabled {
            return None;
        }
        if skip.is_some_and(|skip| skip()) {
            return None;
        }

        let memo_key = format!("{method} {path}");
        if let Some(memoized) = self
            .memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&memo_key)
        {
            return memoized.clone();
        }

        let computed = self.compute(method, path);
        self.memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(memo_key, computed.clone());
        computed
    }

    /// O(n) first-match-wins rule scan. Without rules the policy applies
    /// to every request on its method set; with rules, only to matched
    /// routes.
    fn compute(&self, method: &Method, path: &str) -> Option<S::Settings> {
        if self.rules.is_empty() {
            return self.methods.contains(method).then(|| self.settings.clone());
        }
        for rule in &self.rules {
            if !rule.route.matches(path) {
                continue;
            }
            let methods = rule.methods.as_ref().unwrap_or(&self.methods);
            if !methods.contains(method) {
                continue;
            }
            if !rule.enabled {
                return None;
            }
            return Some(S::merge(&self.settings, &rule.fields));
        }
        None
    }

    /// Flush memoization; enablement and rules are untouched.
    pub fn clear_memo(&self) {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    #[cfg(test)]
    pub(crate) fn memo_len(&self) -> usize {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::rules::{Rule, RouteMatch};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Settings {
        limit: u32,
    }

    #[derive(Debug, Clone)]
    struct Overrides {
        limit: Option<u32>,
    }

    struct Spec;

    impl PolicySpec for Spec {
        type Settings = Settings;
        type RuleFields = Overrides;

        fn default_methods() -> HashSet<Method> {
            [Method::GET].into_iter().collect()
        }

        fn default_serializer() -> KeySerializer {
            KeySerializer::default()
        }

        fn merge(defaults: &Settings, fields: &Overrides) -> Settings {
            Settings { limit: fields.limit.unwrap_or(defaults.limit) }
        }
    }

    fn configured(rules: Vec<Rule<Overrides>>) -> PolicyCore<Spec> {
        PolicyCore::init(
            PolicyToggle::Configured(
                rules
                    .into_iter()
                    .fold(PolicyOptions::new(Settings { limit: 1 }), |opts, r| opts.rule(r)),
            ),
            Settings { limit: 1 },
        )
    }

    #[test]
    fn disabled_resolves_to_none() {
        let policy = PolicyCore::<Spec>::init(false.into(), Settings { limit: 1 });
        assert!(!policy.enabled());
        assert_eq!(policy.resolve(&Method::GET, "/a", None), None);
    }

    #[test]
    fn defaults_apply_to_the_method_set_only() {
        let policy = PolicyCore::<Spec>::init(true.into(), Settings { limit: 9 });
        assert_eq!(
            policy.resolve(&Method::GET, "/anything", None),
            Some(Settings { limit: 9 })
        );
        assert_eq!(policy.resolve(&Method::POST, "/anything", None), None);
    }

    #[test]
    fn rules_act_as_an_allowlist_with_first_match_winning() {
        let policy = configured(vec![
            Rule::new(RouteMatch::StartsWith("/api".into()), Overrides { limit: Some(5) }),
            Rule::new(RouteMatch::StartsWith("/api/v2".into()), Overrides { limit: Some(7) }),
        ]);

        // Declaration order wins even when a later rule is more specific.
        assert_eq!(
            policy.resolve(&Method::GET, "/api/v2/users", None),
            Some(Settings { limit: 5 })
        );
        assert_eq!(policy.resolve(&Method::GET, "/other", None), None);
    }

    #[test]
    fn matched_disabled_rule_switches_the_route_off() {
        let policy = configured(vec![
            Rule::new(RouteMatch::Is("/opt-out".into()), Overrides { limit: None }).disabled(),
            Rule::new(RouteMatch::StartsWith("/".into()), Overrides { limit: Some(3) }),
        ]);
        assert_eq!(policy.resolve(&Method::GET, "/opt-out", None), None);
        assert_eq!(
            policy.resolve(&Method::GET, "/other", None),
            Some(Settings { limit: 3 })
        );
    }

    #[test]
    fn rule_method_restriction_falls_back_to_policy_methods() {
        let policy = configured(vec![Rule::new(
            RouteMatch::Is("/w".into()),
            Overrides { limit: Some(2) },
        )
        .methods([Method::POST])]);
        assert_eq!(policy.resolve(&Method::GET, "/w", None), None);
        assert_eq!(
            policy.resolve(&Method::POST, "/w", None),
            Some(Settings { limit: 2 })
        );
    }

    #[test]
    fn resolution_is_memoized_and_clearable() {
        let policy = configured(vec![Rule::new(
            RouteMatch::StartsWith("/m".into()),
            Overrides { limit: Some(4) },
        )]);
        assert_eq!(policy.memo_len(), 0);
        policy.resolve(&Method::GET, "/m/1", None);
        policy.resolve(&Method::GET, "/m/1", None);
        policy.resolve(&Method::GET, "/m/2", None);
        assert_eq!(policy.memo_len(), 2);

        policy.clear_memo();
        assert_eq!(policy.memo_len(), 0);
        assert!(policy.enabled());
    }

    #[test]
    fn skip_runs_every_call_and_bypasses_the_memo() {
        let policy = PolicyCore::<Spec>::init(true.into(), Settings { limit: 1 });
        let evaluations = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(AtomicUsize::new(1));

        let evaluations_in_skip = evaluations.clone();
        let gate_in_skip = gate.clone();
        let skip = move || {
            evaluations_in_skip.fetch_add(1, Ordering::SeqCst);
            gate_in_skip.load(Ordering::SeqCst) == 1
        };

        assert_eq!(policy.resolve(&Method::GET, "/s", Some(&skip)), None);
        gate.store(0, Ordering::SeqCst);
        assert_eq!(
            policy.resolve(&Method::GET, "/s", Some(&skip)),
            Some(Settings { limit: 1 })
        );
        assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    }
}
