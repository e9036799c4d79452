//! Deterministic request keys.
//!
//! Cache and dedupe lookups hinge on two equivalent requests producing
//! byte-identical keys, so canonicalization sorts everything an HTTP caller
//! can reorder: query pairs and JSON object keys at every depth. Payloads
//! are digested rather than embedded, keeping keys bounded for large
//! bodies.

use http::Method;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use url::Url;

/// Which request parts participate in the full key.
#[derive(Debug, Clone, Copy)]
pub struct KeyOptions {
    pub include_query: bool,
    pub include_payload: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self { include_query: true, include_payload: true }
    }
}

/// Key builder attached to a policy.
#[derive(Clone)]
pub enum KeySerializer {
    /// `METHOD:path?sorted-query#payload-digest` — distinguishes calls.
    Full(KeyOptions),
    /// `METHOD:path` — groups calls by endpoint (rate limiting).
    Endpoint,
    /// Caller-supplied strategy.
    Custom(Arc<dyn Fn(&Method, &Url, Option<&Value>) -> String + Send + Sync>),
}

impl fmt::Debug for KeySerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(opts) => f.debug_tuple("Full").field(opts).finish(),
            Self::Endpoint => write!(f, "Endpoint"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Default for KeySerializer {
    fn default() -> Self {
        Self::Full(KeyOptions::default())
    }
}

impl KeySerializer {
    pub fn key(&self, method: &Method, url: &Url, payload: Option<&Value>) -> String {
        match self {
            Self::Full(opts) => request_key(method, url, payload, opts),
            Self::Endpoint => endpoint_key(method, url),
            Self::Custom(f) => f(method, url, payload),
        }
    }
}

/// Full request key. Two semantically equal inputs produce identical keys
/// regardless of query-pair or object-key order.
pub fn request_key(
    method: &Method,
    url: &Url,
    payload: Option<&Value>,
    opts: &KeyOptions,
) -> String {
    let mut key = format!("{}:{}", method, url.path());
    if opts.include_query {
        if let Some(query) = sorted_query(url) {
            key.push('?');
            key.push_str(&query);
        }
    }
    if opts.include_payload {
        if let Some(value) = payload {
            key.push('#');
            key.push_str(&format!("{:016x}", payload_digest(value)));
        }
    }
    key
}

/// Endpoint key: method and path only.
pub fn endpoint_key(method: &Method, url: &Url) -> String {
    format!("{}:{}", method, url.path())
}

/// Path portion of a full key, for path-pattern invalidation.
pub(crate) fn key_path(key: &str) -> &str {
    let after_method = key.split_once(':').map(|(_, rest)| rest).unwrap_or(key);
    let end = after_method
        .find(['?', '#'])
        .unwrap_or(after_method.len());
    &after_method[..end]
}

fn sorted_query(url: &Url) -> Option<String> {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort();
    Some(
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&"),
    )
}

/// Fixed-key hash over the canonical payload text. `DefaultHasher::new()`
/// constructs SipHash with constant keys, so digests are stable across
/// processes.
fn payload_digest(value: &Value) -> u64 {
    let mut canon = String::new();
    canonicalize(value, &mut canon);
    let mut hasher = DefaultHasher::new();
    hasher.write(canon.as_bytes());
    hasher.finish()
}

fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json escaping keeps `"a,b"` distinct from `"a","b"`.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                canonicalize(&map[k], out);
            }
            out.push('}');
        }
    }
}
