//! The request pipeline.
//!
//! One engine owns the HTTP client, the policy handles, the single-flight
//! coordinator, the rate limiter, and the event bus. Every call runs the
//! same path: compose effective options → cache consult → dedupe claim →
//! rate-limit admission → retry-driven network exchange → cache store,
//! with lifecycle events at each stage. Cancellation is drop-based: the
//! whole pipeline races the caller's signal and the instance destroy
//! controller, and dropping the in-progress future releases rate-limit
//! slots, detaches dedupe joiners, and abandons the network request.

pub mod options;

use crate::abort::{AbortController, AbortSignal};
use crate::clock::{Clock, MonotonicClock};
use crate::error::FetchError;
use crate::events::{Event, EventBus, EventFilter, EventName, ListenerId};
use crate::policy::cache::{CachePolicy, CacheSettings};
use crate::policy::dedupe::DedupePolicy;
use crate::policy::rules::RouteMatch;
use crate::policy::throttle::ThrottlePolicy;
use crate::policy::PolicyToggle;
use crate::rate_limit::{Admission, RateLimiter};
use crate::request::{decode_response, RequestContext, ResolvedCall, ResponseEnvelope, ResponseType};
use crate::retry::{RetryConfig, RetryDriver, RetryHooks};
use crate::serialize::key_path;
use crate::single_flight::store::{CacheStore, InMemoryStore, StoreError};
use crate::single_flight::{CacheLookup, Flight, FlightStats, SingleFlight};
use arc_swap::ArcSwap;
use futures::future::OptionFuture;
use http::Method;
use options::{CallOptions, EngineOptions, Modifier};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

/// Headers or params with an engine-wide scope plus per-method overlays.
#[derive(Debug, Default)]
struct ScopedMap {
    base: HashMap<String, String>,
    by_method: HashMap<Method, HashMap<String, String>>,
}

impl ScopedMap {
    fn effective(&self, method: &Method) -> HashMap<String, String> {
        let mut merged = self.base.clone();
        if let Some(scoped) = self.by_method.get(method) {
            merged.extend(scoped.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    fn insert(&mut self, scope: Option<&Method>, name: String, value: String) {
        match scope {
            None => {
                self.base.insert(name, value);
            }
            Some(method) => {
                self.by_method.entry(method.clone()).or_default().insert(name, value);
            }
        }
    }

    fn remove(&mut self, scope: Option<&Method>, name: &str) -> bool {
        match scope {
            None => self.base.remove(name).is_some(),
            Some(method) => self
                .by_method
                .get_mut(method)
                .is_some_and(|scoped| scoped.remove(name).is_some()),
        }
    }

    fn contains(&self, scope: Option<&Method>, name: &str) -> bool {
        match scope {
            None => self.base.contains_key(name),
            Some(method) => self
                .by_method
                .get(method)
                .is_some_and(|scoped| scoped.contains_key(name)),
        }
    }
}

/// Everything compose() resolves for one call.
struct ComposedCall {
    method: Method,
    path: String,
    url: Url,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    body: Option<Value>,
    state: HashMap<String, Value>,
    timeout: Option<Duration>,
    response_type: ResponseType,
    priority: Option<i64>,
    external: Option<AbortSignal>,
    ctx_signal: AbortSignal,
    skip_cache: bool,
    skip_dedupe: bool,
    skip_rate_limit: bool,
}

impl ComposedCall {
    fn context(&self, attempt: u32) -> RequestContext {
        RequestContext {
            method: self.method.clone(),
            path: self.path.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            state: self.state.clone(),
            attempt,
            signal: self.ctx_signal.clone(),
        }
    }

    fn resolved(&self) -> ResolvedCall {
        ResolvedCall {
            method: self.method.clone(),
            url: self.url.to_string(),
            timeout: self.timeout,
            response_type: self.response_type,
        }
    }
}

struct EngineInner {
    name: String,
    http: reqwest::Client,
    base_url: ArcSwap<Option<Url>>,
    default_type: ResponseType,
    timeout: Option<Duration>,
    headers: Mutex<ScopedMap>,
    params: Mutex<ScopedMap>,
    state: Mutex<HashMap<String, Value>>,
    modify: ArcSwap<Option<Modifier>>,
    method_modify: ArcSwap<HashMap<Method, Modifier>>,
    validators: ArcSwap<Option<options::ValidateOptions>>,
    bus: EventBus,
    flights: SingleFlight<ResponseEnvelope>,
    limiter: RateLimiter,
    cache: CachePolicy,
    dedupe: DedupePolicy,
    throttle: ThrottlePolicy,
    retry: RetryDriver,
    destroy: AbortController,
    destroyed: AtomicBool,
}

/// Long-lived HTTP client engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FetchEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for FetchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchEngine")
            .field("name", &self.inner.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl FetchEngine {
    pub fn new(options: EngineOptions) -> Result<Self, FetchError> {
        Self::with_parts(
            options,
            Arc::new(InMemoryStore::new()),
            Arc::new(MonotonicClock::default()),
        )
    }

    /// Build with a caller-supplied cache adapter.
    pub fn with_store(
        options: EngineOptions,
        store: Arc<dyn CacheStore<ResponseEnvelope>>,
    ) -> Result<Self, FetchError> {
        Self::with_parts(options, store, Arc::new(MonotonicClock::default()))
    }

    /// Build with a custom cache adapter and clock.
    pub fn with_parts(
        options: EngineOptions,
        store: Arc<dyn CacheStore<ResponseEnvelope>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FetchError> {
        options.validate()?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::config(format!("cannot build http client: {e}")))?;
        let base_url = match &options.base_url {
            Some(base) => Some(
                Url::parse(base)
                    .map_err(|e| FetchError::config(format!("invalid base_url {base:?}: {e}")))?,
            ),
            None => None,
        };
        let retry = match options.retry {
            PolicyToggle::Disabled => {
                // Single attempt, and failures surface raw rather than as
                // retry exhaustion.
                RetryDriver::new(RetryConfig { max_attempts: 1, ..Default::default() })
                    .with_predicate(Arc::new(|_, _| crate::retry::RetryVerdict::Stop))
            }
            PolicyToggle::Defaults => RetryDriver::new(RetryConfig::default()),
            PolicyToggle::Configured(retry) => {
                let driver = RetryDriver::new(retry.config);
                match retry.should_retry {
                    Some(predicate) => driver.with_predicate(predicate),
                    None => driver,
                }
            }
        };
        let spy = options.spy;

        let inner = EngineInner {
            name: options.name.unwrap_or_else(|| "surefetch".to_string()),
            http,
            base_url: ArcSwap::from_pointee(base_url),
            default_type: options.default_type,
            timeout: options.timeout,
            headers: Mutex::new(ScopedMap {
                base: options.headers,
                by_method: options.method_headers,
            }),
            params: Mutex::new(ScopedMap {
                base: options.params,
                by_method: options.method_params,
            }),
            state: Mutex::new(HashMap::new()),
            modify: ArcSwap::from_pointee(options.modify_options),
            method_modify: ArcSwap::from_pointee(options.modify_method_options),
            validators: ArcSwap::from_pointee(Some(options.validate)),
            bus: EventBus::new(),
            flights: SingleFlight::new(store, Arc::clone(&clock)),
            limiter: RateLimiter::new(clock),
            cache: CachePolicy::from_toggle(options.cache),
            dedupe: DedupePolicy::from_toggle(options.dedupe),
            throttle: ThrottlePolicy::from_toggle(options.rate_limit),
            retry,
            destroy: AbortController::new(),
            destroyed: AtomicBool::new(false),
        };

        let engine = Self { inner: Arc::new(inner) };
        if spy {
            let name = engine.inner.name.clone();
            engine.inner.bus.on(
                Regex::new(".*").expect("static pattern"),
                Arc::new(move |event: &Event| {
                    tracing::debug!(engine = %name, event = %event.name, data = %event.data);
                }),
            );
        }
        Ok(engine)
    }

    // --- verbs ---

    pub async fn get(&self, path: &str) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::GET, path, None, CallOptions::default()).await
    }

    pub async fn get_with(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::GET, path, None, options).await
    }

    pub async fn head(&self, path: &str) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::HEAD, path, None, CallOptions::default()).await
    }

    pub async fn head_with(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::HEAD, path, None, options).await
    }

    pub async fn options(&self, path: &str) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::OPTIONS, path, None, CallOptions::default()).await
    }

    pub async fn options_with(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::OPTIONS, path, None, options).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::POST, path, Some(body), CallOptions::default()).await
    }

    pub async fn post_with(
        &self,
        path: &str,
        body: Option<Value>,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::POST, path, body, options).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::PUT, path, Some(body), CallOptions::default()).await
    }

    pub async fn put_with(
        &self,
        path: &str,
        body: Option<Value>,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::PUT, path, body, options).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::PATCH, path, Some(body), CallOptions::default()).await
    }

    pub async fn patch_with(
        &self,
        path: &str,
        body: Option<Value>,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::PATCH, path, body, options).await
    }

    pub async fn delete(&self, path: &str) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::DELETE, path, None, CallOptions::default()).await
    }

    pub async fn delete_with(
        &self,
        path: &str,
        body: Option<Value>,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.request(Method::DELETE, path, body, options).await
    }

    /// Pipeline entry for any verb.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, FetchError> {
        if self.is_destroyed() {
            return Err(FetchError::Destroyed);
        }
        let call = self.compose(method, path, body, options)?;
        self.emit(
            EventName::Before,
            json!({
                "method": call.method.as_str(),
                "url": call.url.as_str(),
                "path": call.path,
            }),
        );

        let destroy = self.inner.destroy.signal();
        let outcome = {
            let external_cancelled: OptionFuture<_> =
                call.external.as_ref().map(|signal| signal.cancelled()).into();
            let work = self.dispatch(&call);
            tokio::pin!(work, external_cancelled);
            tokio::select! {
                biased;
                Some(()) = &mut external_cancelled => Err(FetchError::aborted(
                    call.external.as_ref().map(|s| s.reason()).unwrap_or_default(),
                )),
                _ = destroy.cancelled() => Err(FetchError::aborted(destroy.reason())),
                result = &mut work => result,
            }
        };

        match &outcome {
            Ok((envelope, from_cache)) => {
                if !from_cache {
                    self.emit(
                        EventName::Response,
                        json!({
                            "method": call.method.as_str(),
                            "url": call.url.as_str(),
                            "status": envelope.status.as_u16(),
                        }),
                    );
                }
            }
            Err(error) => {
                if let FetchError::Aborted { reason } = error {
                    self.emit(
                        EventName::Abort,
                        json!({
                            "method": call.method.as_str(),
                            "url": call.url.as_str(),
                            "reason": reason,
                        }),
                    );
                }
                let attempt = match error.root() {
                    FetchError::Http { attempt, .. } => json!(attempt),
                    _ => Value::Null,
                };
                self.emit(
                    EventName::Error,
                    json!({
                        "method": call.method.as_str(),
                        "url": call.url.as_str(),
                        "attempt": attempt,
                        "error": error.to_string(),
                    }),
                );
            }
        }
        self.emit(
            EventName::After,
            json!({"method": call.method.as_str(), "url": call.url.as_str()}),
        );

        outcome.map(|(envelope, _)| envelope)
    }

    // --- pipeline stages ---

    /// Merge engine, method, and per-call options; run validators and the
    /// modifier chain; compose the URL.
    fn compose(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        per_call: CallOptions,
    ) -> Result<ComposedCall, FetchError> {
        let mut options = per_call;

        {
            let headers = self.lock(&self.inner.headers);
            let mut merged = headers.effective(&method);
            merged.extend(std::mem::take(&mut options.headers));
            options.headers = merged;
        }
        {
            let params = self.lock(&self.inner.params);
            let mut merged = params.effective(&method);
            merged.extend(std::mem::take(&mut options.params));
            options.params = merged;
        }
        if options.timeout.is_none() {
            options.timeout = self.inner.timeout;
        }
        if options.response_type.is_none() {
            options.response_type = Some(self.inner.default_type);
        }

        // Modifier chain: global, method-scoped, per-call.
        let per_call_modify = options.modify.take();
        if let Some(global) = &*self.inner.modify.load_full() {
            options = global(options);
        }
        if let Some(scoped) = self.inner.method_modify.load_full().get(&method) {
            options = scoped(options);
        }
        if let Some(modify) = per_call_modify {
            options = modify(options);
        }

        if let Some(validators) = &*self.inner.validators.load_full() {
            if validators.per_request_headers {
                if let Some(check) = &validators.headers {
                    check(&options.headers).map_err(FetchError::config)?;
                }
            }
        }

        let base = self.inner.base_url.load_full();
        let url = compose_url(base.as_ref().as_ref(), path, &options.params)?;
        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let state = self.lock(&self.inner.state).clone();
        let external = options.signal.clone();
        let ctx_signal = external.clone().unwrap_or_else(|| self.inner.destroy.signal());

        Ok(ComposedCall {
            method,
            path: path.to_string(),
            url,
            headers: options.headers,
            query,
            body,
            state,
            timeout: options.timeout,
            response_type: options.response_type.unwrap_or_default(),
            priority: options.priority,
            external,
            ctx_signal,
            skip_cache: options.skip_cache,
            skip_dedupe: options.skip_dedupe,
            skip_rate_limit: options.skip_rate_limit,
        })
    }

    /// Cache → dedupe → network → store. The boolean marks cache-served
    /// responses, which do not emit `fetch-response`.
    async fn dispatch(
        &self,
        call: &ComposedCall,
    ) -> Result<(ResponseEnvelope, bool), FetchError> {
        let cache_rule = if call.skip_cache {
            None
        } else {
            self.inner.cache.resolve(&call.method, &call.path, None)
        };
        let cache_key = cache_rule.as_ref().map(|_| {
            self.inner.cache.serializer().key(&call.method, &call.url, call.body.as_ref())
        });

        if let (Some(rule), Some(key)) = (&cache_rule, &cache_key) {
            match self.inner.flights.get_cache(key).await {
                Ok(CacheLookup::Hit { value, is_stale: false }) => {
                    self.emit(EventName::CacheHit, json!({"key": key}));
                    return Ok((value, true));
                }
                Ok(CacheLookup::Hit { value, is_stale: true }) => {
                    self.emit(EventName::CacheStale, json!({"key": key}));
                    if !self.inner.flights.has_inflight(key) {
                        self.spawn_revalidation(call, key.clone(), rule.clone());
                    }
                    return Ok((value, true));
                }
                Ok(CacheLookup::Expired) => {
                    self.emit(EventName::CacheExpire, json!({"key": key}));
                    self.emit(EventName::CacheMiss, json!({"key": key}));
                }
                Ok(CacheLookup::Miss) => {
                    self.emit(EventName::CacheMiss, json!({"key": key}));
                }
                Err(error) => {
                    tracing::warn!(
                        engine = %self.inner.name,
                        key = %key,
                        error = %error,
                        "cache adapter lookup failed; treating as miss"
                    );
                    self.emit(EventName::CacheMiss, json!({"key": key}));
                }
            }
        }

        let dedupe_key = if call.skip_dedupe {
            None
        } else {
            self.inner
                .dedupe
                .resolve(&call.method, &call.path, None)
                .map(|_| {
                    self.inner
                        .dedupe
                        .serializer()
                        .key(&call.method, &call.url, call.body.as_ref())
                })
        };

        let (envelope, joined) = match dedupe_key {
            None => (self.network_phase(call).await?, false),
            Some(key) => match self.inner.flights.claim(&key) {
                Flight::Joiner(join) => {
                    self.emit(
                        EventName::DedupeJoin,
                        json!({"key": key, "waiting": join.waiting_count}),
                    );
                    let envelope = join
                        .outcome()
                        .await
                        .map_err(|source| FetchError::Joined { source })?;
                    (envelope, true)
                }
                Flight::Originator(handle) => {
                    self.emit(EventName::DedupeStart, json!({"key": key}));
                    match self.network_phase(call).await {
                        Ok(envelope) => {
                            handle.settle(Ok(envelope.clone()));
                            self.emit(EventName::DedupeComplete, json!({"key": key}));
                            (envelope, false)
                        }
                        Err(error) => {
                            let shared = Arc::new(error);
                            handle.settle(Err(Arc::clone(&shared)));
                            self.emit(
                                EventName::DedupeError,
                                json!({"key": key, "error": shared.to_string()}),
                            );
                            return Err(FetchError::Joined { source: shared });
                        }
                    }
                }
            },
        };

        // Joiners do not store; the originator already did.
        if !joined {
            if let (Some(rule), Some(key)) = (&cache_rule, &cache_key) {
                if rule.is_storable(envelope.status) {
                    match self
                        .inner
                        .flights
                        .set_cache(key, envelope.clone(), rule.ttl, rule.stale_in)
                        .await
                    {
                        Ok(()) => self.emit(EventName::CacheSet, json!({"key": key})),
                        Err(error) => tracing::warn!(
                            engine = %self.inner.name,
                            key = %key,
                            error = %error,
                            "cache adapter store failed"
                        ),
                    }
                }
            }
        }

        Ok((envelope, false))
    }

    /// Rate-limit admission, then the retry-driven exchange.
    async fn network_phase(&self, call: &ComposedCall) -> Result<ResponseEnvelope, FetchError> {
        if !call.skip_rate_limit {
            if let Some(settings) = self.inner.throttle.resolve(&call.method, &call.path, None) {
                let key = self.inner.throttle.serializer().key(&call.method, &call.url, None);
                let priority = call.priority.unwrap_or(settings.priority);
                match self.inner.limiter.admit(&key, &settings.bucket, priority) {
                    Ok(Admission::Granted) => {
                        self.emit(EventName::RateLimitAcquire, json!({"key": key}));
                    }
                    Ok(Admission::Enqueued(wait)) => {
                        self.emit(
                            EventName::RateLimitWait,
                            json!({"key": key, "priority": priority}),
                        );
                        wait.acquired().await?;
                        self.emit(EventName::RateLimitAcquire, json!({"key": key}));
                    }
                    Err(error) => {
                        self.emit(
                            EventName::RateLimitReject,
                            json!({"key": key, "error": error.to_string()}),
                        );
                        return Err(error);
                    }
                }
            }
        }

        let on_retry = |error: &FetchError, attempt: u32, delay: Duration| {
            self.emit(
                EventName::Retry,
                json!({
                    "method": call.method.as_str(),
                    "url": call.url.as_str(),
                    "attempt": attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "error": error.to_string(),
                }),
            );
        };
        let hooks = RetryHooks { on_retry: Some(&on_retry), on_exhausted: None };
        self.inner
            .retry
            .run(&call.ctx_signal, hooks, |attempt| self.perform_attempt(call, attempt))
            .await
    }

    /// One network attempt. The timeout starts at the handoff to the HTTP
    /// primitive and is released on every exit path when the guard drops.
    async fn perform_attempt(
        &self,
        call: &ComposedCall,
        attempt: u32,
    ) -> Result<ResponseEnvelope, FetchError> {
        let context = call.context(attempt);
        let resolved = call.resolved();
        let mut request = self.inner.http.request(context.method.clone(), context.url.clone());
        for (name, value) in &context.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &context.body {
            request = request.json(body);
        }

        let response_type = call.response_type;
        let started = std::time::Instant::now();
        let exchange = async move {
            let response = request
                .send()
                .await
                .map_err(|source| FetchError::Network { source })?;
            decode_response(response, response_type, context, resolved).await
        };

        match call.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout { elapsed: started.elapsed(), limit }),
            },
            None => exchange.await,
        }
    }

    /// Fire-and-forget refresh of a stale entry through the normal
    /// pipeline with caching disabled; rate limiting still applies.
    fn spawn_revalidation(&self, call: &ComposedCall, key: String, rule: CacheSettings) {
        let engine = self.clone();
        let method = call.method.clone();
        let path = call.path.clone();
        let body = call.body.clone();
        tokio::spawn(async move {
            let options = CallOptions::default().skip_cache();
            match engine.request(method, &path, body, options).await {
                Ok(envelope) => {
                    match engine
                        .inner
                        .flights
                        .set_cache(&key, envelope, rule.ttl, rule.stale_in)
                        .await
                    {
                        Ok(()) => engine.emit(EventName::CacheRevalidate, json!({"key": key})),
                        Err(error) => tracing::warn!(
                            engine = %engine.inner.name,
                            key = %key,
                            error = %error,
                            "revalidation store failed"
                        ),
                    }
                }
                Err(error) => {
                    engine.emit(
                        EventName::CacheRevalidateError,
                        json!({"key": key, "error": error.to_string()}),
                    );
                }
            }
        });
    }

    // --- headers, params, state ---

    pub fn add_header(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
        scope: Option<Method>,
    ) -> Result<(), FetchError> {
        let name = name.into();
        let value = value.into();
        {
            let mut headers = self.lock(&self.inner.headers);
            if let Some(validators) = &*self.inner.validators.load_full() {
                if let Some(check) = &validators.headers {
                    let probe = scope.clone().unwrap_or(Method::GET);
                    let mut candidate = headers.effective(&probe);
                    candidate.insert(name.clone(), value.clone());
                    check(&candidate).map_err(FetchError::config)?;
                }
            }
            headers.insert(scope.as_ref(), name.clone(), value);
        }
        self.emit(
            EventName::HeaderAdd,
            json!({"name": name, "scope": scope.as_ref().map(|m| m.as_str())}),
        );
        Ok(())
    }

    pub fn remove_header(&self, name: &str, scope: Option<Method>) -> bool {
        let removed = self.lock(&self.inner.headers).remove(scope.as_ref(), name);
        if removed {
            self.emit(
                EventName::HeaderRemove,
                json!({"name": name, "scope": scope.as_ref().map(|m| m.as_str())}),
            );
        }
        removed
    }

    pub fn has_header(&self, name: &str, scope: Option<Method>) -> bool {
        self.lock(&self.inner.headers).contains(scope.as_ref(), name)
    }

    pub fn add_param(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
        scope: Option<Method>,
    ) {
        let name = name.into();
        self.lock(&self.inner.params).insert(scope.as_ref(), name.clone(), value.into());
        self.emit(
            EventName::ParamAdd,
            json!({"name": name, "scope": scope.as_ref().map(|m| m.as_str())}),
        );
    }

    pub fn remove_param(&self, name: &str, scope: Option<Method>) -> bool {
        let removed = self.lock(&self.inner.params).remove(scope.as_ref(), name);
        if removed {
            self.emit(
                EventName::ParamRemove,
                json!({"name": name, "scope": scope.as_ref().map(|m| m.as_str())}),
            );
        }
        removed
    }

    pub fn has_param(&self, name: &str, scope: Option<Method>) -> bool {
        self.lock(&self.inner.params).contains(scope.as_ref(), name)
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) -> Result<(), FetchError> {
        let key = key.into();
        {
            let mut state = self.lock(&self.inner.state);
            if let Some(validators) = &*self.inner.validators.load_full() {
                if let Some(check) = &validators.state {
                    let mut candidate = state.clone();
                    candidate.insert(key.clone(), value.clone());
                    check(&candidate).map_err(FetchError::config)?;
                }
            }
            state.insert(key.clone(), value);
        }
        self.emit(EventName::StateSet, json!({"key": key}));
        Ok(())
    }

    pub fn merge_state(&self, entries: HashMap<String, Value>) -> Result<(), FetchError> {
        let keys: Vec<String> = entries.keys().cloned().collect();
        {
            let mut state = self.lock(&self.inner.state);
            if let Some(validators) = &*self.inner.validators.load_full() {
                if let Some(check) = &validators.state {
                    let mut candidate = state.clone();
                    candidate.extend(entries.clone());
                    check(&candidate).map_err(FetchError::config)?;
                }
            }
            state.extend(entries);
        }
        self.emit(EventName::StateSet, json!({"keys": keys}));
        Ok(())
    }

    pub fn state(&self) -> HashMap<String, Value> {
        self.lock(&self.inner.state).clone()
    }

    pub fn reset_state(&self) {
        self.lock(&self.inner.state).clear();
        self.emit(EventName::StateReset, json!({}));
    }

    // --- dynamic configuration ---

    pub fn change_base_url(&self, base_url: &str) -> Result<(), FetchError> {
        let url = Url::parse(base_url)
            .map_err(|e| FetchError::config(format!("invalid base_url {base_url:?}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(FetchError::config(format!(
                "base_url {base_url:?} cannot serve as a base"
            )));
        }
        self.inner.base_url.store(Arc::new(Some(url)));
        self.emit(EventName::UrlChange, json!({"base_url": base_url}));
        Ok(())
    }

    pub fn change_modify_options(&self, modify: Option<Modifier>) {
        let installed = modify.is_some();
        self.inner.modify.store(Arc::new(modify));
        self.emit(EventName::ModifyOptionsChange, json!({"installed": installed}));
    }

    pub fn change_modify_method_options(&self, method: Method, modify: Option<Modifier>) {
        let installed = modify.is_some();
        let mut map: HashMap<Method, Modifier> =
            self.inner.method_modify.load_full().as_ref().clone();
        match modify {
            Some(modifier) => {
                map.insert(method.clone(), modifier);
            }
            None => {
                map.remove(&method);
            }
        }
        self.inner.method_modify.store(Arc::new(map));
        self.emit(
            EventName::ModifyMethodOptionsChange,
            json!({"method": method.as_str(), "installed": installed}),
        );
    }

    // --- cache invalidation surface ---

    pub async fn clear_cache(&self) -> Result<(), FetchError> {
        self.inner.flights.clear_cache().await.map_err(adapter_error)
    }

    pub async fn delete_cache(&self, key: &str) -> Result<bool, FetchError> {
        self.inner.flights.delete_cache(key).await.map_err(adapter_error)
    }

    /// Delete every entry whose key satisfies the predicate. Returns the
    /// number removed.
    pub async fn invalidate_cache(
        &self,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<usize, FetchError> {
        let keys = self.inner.flights.cache_keys().await.map_err(adapter_error)?;
        let mut removed = 0;
        for key in keys {
            if predicate(&key)
                && self.inner.flights.delete_cache(&key).await.map_err(adapter_error)?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every entry whose request path matches the pattern.
    pub async fn invalidate_path(&self, pattern: &RouteMatch) -> Result<usize, FetchError> {
        self.invalidate_cache(|key| pattern.matches(key_path(key))).await
    }

    pub async fn cache_stats(&self) -> Result<FlightStats, FetchError> {
        self.inner.flights.stats().await.map_err(adapter_error)
    }

    /// The cache key a call would use, for priming and targeted deletes.
    pub fn cache_key(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<String, FetchError> {
        let call = self.compose(method, path, body, CallOptions::default())?;
        Ok(self.inner.cache.serializer().key(&call.method, &call.url, call.body.as_ref()))
    }

    /// Shared coordinator handle, for priming caches and inspecting
    /// flights.
    pub fn flights(&self) -> &SingleFlight<ResponseEnvelope> {
        &self.inner.flights
    }

    // --- events ---

    pub fn on(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.bus.on(filter, Arc::new(handler))
    }

    pub fn once(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.bus.once(filter, Arc::new(handler))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    // --- teardown ---

    /// Abort everything in flight, drop listeners, and release modifier
    /// and validator references. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.destroy.abort("engine destroyed");
        self.inner.bus.clear();
        self.inner.modify.store(Arc::new(None));
        self.inner.method_modify.store(Arc::new(HashMap::new()));
        self.inner.validators.store(Arc::new(None));
        tracing::debug!(engine = %self.inner.name, "engine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    // --- internals ---

    fn emit(&self, name: EventName, data: Value) {
        self.inner.bus.emit(name, data);
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn adapter_error(error: StoreError) -> FetchError {
    FetchError::CacheAdapter { message: error.to_string() }
}

/// URL composition: absolute paths bypass the base; otherwise exactly one
/// trailing slash is stripped from the base and the path is concatenated
/// verbatim. Effective params merge with query already present in the
/// path, which wins on collision.
fn compose_url(
    base: Option<&Url>,
    path: &str,
    params: &HashMap<String, String>,
) -> Result<Url, FetchError> {
    let mut url = match Url::parse(path) {
        Ok(absolute) => absolute,
        Err(_) => {
            let base = base.ok_or_else(|| {
                FetchError::config(format!("relative path {path:?} requires a base_url"))
            })?;
            let mut joined = base.as_str().to_string();
            if let Some(stripped) = joined.strip_suffix('/') {
                joined = stripped.to_string();
            }
            joined.push_str(path);
            Url::parse(&joined).map_err(|e| {
                FetchError::config(format!("cannot compose url from {path:?}: {e}"))
            })?
        }
    };

    if !params.is_empty() {
        let existing: std::collections::HashSet<String> =
            url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        let mut sorted: Vec<(&String, &String)> = params.iter().collect();
        sorted.sort();
        let mut pairs = url.query_pairs_mut();
        for (name, value) in sorted {
            if !existing.contains(name.as_str()) {
                pairs.append_pair(name, value);
            }
        }
    }
    Ok(url)
}
