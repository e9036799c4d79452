//! Request contexts, response envelopes, and body decoding.

use crate::abort::AbortSignal;
use crate::error::{FailureStep, FetchError};
use bytes::Bytes;
use http::{Method, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// How a response body is decoded into the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Bytes,
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    /// Empty body (204s, HEAD responses).
    Empty,
}

impl ResponseData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Immutable snapshot describing one attempt of one call. Rebuilt for
/// every retry attempt.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// The path as the caller wrote it.
    pub path: String,
    /// The fully composed URL, query included.
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
    /// Caller-scoped state snapshot taken at composition time.
    pub state: HashMap<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub signal: AbortSignal,
}

/// The per-call options that actually applied, recorded on the envelope.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub method: Method,
    pub url: String,
    pub timeout: Option<Duration>,
    pub response_type: ResponseType,
}

/// What a successful call returns. Never mutated after emission; cache
/// hits hand out clones.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub data: ResponseData,
    /// Response headers as a plain map with lowercase keys.
    pub headers: HashMap<String, String>,
    pub status: StatusCode,
    pub request: RequestContext,
    pub config: ResolvedCall,
}

/// Flatten a header map to `String → String` with lowercase names.
/// Repeated headers keep the last value; non-UTF-8 values are dropped.
pub(crate) fn normalize_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Turn a raw response into an envelope, or an `Http` error for
/// non-success statuses and undecodable bodies.
pub(crate) async fn decode_response(
    response: reqwest::Response,
    response_type: ResponseType,
    context: RequestContext,
    config: ResolvedCall,
) -> Result<ResponseEnvelope, FetchError> {
    let status = response.status();
    let headers = normalize_headers(response.headers());
    let url = config.url.clone();
    let method = context.method.clone();
    let attempt = context.attempt;

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(source) => {
            return Err(FetchError::Network { source });
        }
    };

    if !status.is_success() {
        // Body is parsed best-effort so handlers can inspect API error
        // payloads.
        let data = serde_json::from_slice::<Value>(&bytes).ok();
        return Err(FetchError::Http {
            status,
            headers,
            data,
            method,
            url,
            attempt,
            step: FailureStep::Response,
        });
    }

    let data = if bytes.is_empty() {
        ResponseData::Empty
    } else {
        match response_type {
            ResponseType::Json => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => ResponseData::Json(value),
                Err(_) => {
                    return Err(FetchError::Http {
                        status,
                        headers,
                        data: None,
                        method,
                        url,
                        attempt,
                        step: FailureStep::Parse,
                    });
                }
            },
            ResponseType::Text => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => ResponseData::Text(text),
                Err(_) => {
                    return Err(FetchError::Http {
                        status,
                        headers,
                        data: None,
                        method,
                        url,
                        attempt,
                        step: FailureStep::Parse,
                    });
                }
            },
            ResponseType::Bytes => ResponseData::Bytes(bytes),
        }
    };

    Ok(ResponseEnvelope { data, headers, status, request: context, config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

    #[test]
    fn headers_normalize_to_lowercase() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Custom-Header", HeaderValue::from_static("yes"));

        let normalized = normalize_headers(&headers);
        assert_eq!(normalized.get("content-type").unwrap(), "application/json");
        assert_eq!(normalized.get("x-custom-header").unwrap(), "yes");
        assert!(!normalized.contains_key("X-Custom-Header"));
    }

    #[test]
    fn response_data_accessors() {
        let json = ResponseData::Json(serde_json::json!({"a": 1}));
        assert!(json.as_json().is_some());
        assert!(json.as_text().is_none());

        let text = ResponseData::Text("hi".into());
        assert_eq!(text.as_text(), Some("hi"));

        let bytes = ResponseData::Bytes(Bytes::from_static(b"\x00\x01"));
        assert_eq!(bytes.as_bytes().unwrap().len(), 2);
    }
}
