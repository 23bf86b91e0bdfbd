//! CORS and origin policy for browser clients.
//!
//! # Responsibilities
//! - Decide which origins may call the gateway over HTTP
//! - Decide which origins may open a WebSocket channel
//! - Recognize gRPC-web pre-flights and answer them
//! - Optionally restrict pre-flights to served endpoints
//!
//! # Design Decisions
//! - Injected predicates override the configured origin list
//! - WebSocket upgrades default to same-origin (Origin host equals Host)
//! - Requests without an Origin header are not browser requests and pass
//!   the WebSocket check

use std::fmt;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};

use crate::config::CorsConfig;
use crate::routing::{EndpointMatcher, Matcher};

/// Decides whether an HTTP origin may receive CORS headers.
pub type OriginPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Decides whether a WebSocket upgrade request may proceed, given its headers.
pub type WebsocketOriginPredicate = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Marker request header sent by gRPC-web clients.
pub const GRPC_WEB_MARKER: &str = "x-grpc-web";

/// Request headers always allowed when the list is explicit.
const DEFAULT_ALLOWED_HEADERS: &[&str] = &[
    "x-grpc-web",
    "content-type",
    "x-user-agent",
    "grpc-timeout",
];

/// Response headers always exposed to scripts.
const DEFAULT_EXPOSED_HEADERS: &[&str] = &["grpc-status", "grpc-message"];

/// Outcome of evaluating a pre-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightDecision {
    Allowed,
    /// Origin missing or not allowed (403).
    ForbiddenOrigin,
    /// Path is not a served endpoint (405).
    MethodNotAllowed,
}

#[derive(Clone)]
pub struct CorsPolicy {
    any_origin: bool,
    allowed_origins: Vec<String>,
    origin_predicate: Option<OriginPredicate>,
    websocket_origin_predicate: Option<WebsocketOriginPredicate>,
    any_request_header: bool,
    allowed_request_headers: Vec<HeaderName>,
    exposed_headers: Vec<HeaderName>,
    max_age_secs: u64,
    registered_endpoints_only: bool,
    endpoints: Option<EndpointMatcher>,
}

impl fmt::Debug for CorsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsPolicy")
            .field("any_origin", &self.any_origin)
            .field("allowed_origins", &self.allowed_origins)
            .field("has_origin_predicate", &self.origin_predicate.is_some())
            .field(
                "has_websocket_origin_predicate",
                &self.websocket_origin_predicate.is_some(),
            )
            .field("registered_endpoints_only", &self.registered_endpoints_only)
            .finish_non_exhaustive()
    }
}

fn header_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<HeaderName> {
    names
        .into_iter()
        .filter(|n| *n != "*")
        .filter_map(|n| HeaderName::from_bytes(n.trim().as_bytes()).ok())
        .collect()
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig, endpoints: Option<EndpointMatcher>) -> Self {
        let mut allowed_request_headers =
            header_names(DEFAULT_ALLOWED_HEADERS.iter().copied());
        for name in header_names(config.allowed_request_headers.iter().map(String::as_str)) {
            if !allowed_request_headers.contains(&name) {
                allowed_request_headers.push(name);
            }
        }
        let mut exposed_headers = header_names(DEFAULT_EXPOSED_HEADERS.iter().copied());
        for name in header_names(config.exposed_headers.iter().map(String::as_str)) {
            if !exposed_headers.contains(&name) {
                exposed_headers.push(name);
            }
        }

        Self {
            any_origin: config.allowed_origins.iter().any(|o| o == "*"),
            allowed_origins: config
                .allowed_origins
                .iter()
                .filter(|o| *o != "*")
                .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
                .collect(),
            origin_predicate: None,
            websocket_origin_predicate: None,
            any_request_header: config.allowed_request_headers.iter().any(|h| h == "*"),
            allowed_request_headers,
            exposed_headers,
            max_age_secs: config.max_age_secs,
            registered_endpoints_only: config.cors_for_registered_endpoints_only,
            endpoints,
        }
    }

    pub fn with_origin_predicate(mut self, predicate: OriginPredicate) -> Self {
        self.origin_predicate = Some(predicate);
        self
    }

    pub fn with_websocket_origin_predicate(mut self, predicate: WebsocketOriginPredicate) -> Self {
        self.websocket_origin_predicate = Some(predicate);
        self
    }

    pub fn allow_origin(&self, origin: &str) -> bool {
        if let Some(predicate) = &self.origin_predicate {
            return predicate(origin);
        }
        if self.any_origin {
            return true;
        }
        let origin = origin.trim_end_matches('/').to_ascii_lowercase();
        self.allowed_origins.iter().any(|o| *o == origin)
    }

    /// The request's Origin header, if present and allowed.
    pub fn allowed_origin<'a>(&self, headers: &'a HeaderMap) -> Option<&'a HeaderValue> {
        let value = headers.get(header::ORIGIN)?;
        let origin = value.to_str().ok()?;
        self.allow_origin(origin).then_some(value)
    }

    pub fn allow_websocket_origin(&self, headers: &HeaderMap) -> bool {
        match &self.websocket_origin_predicate {
            Some(predicate) => predicate(headers),
            None => same_origin(headers),
        }
    }

    /// `OPTIONS` carrying `x-grpc-web` in `Access-Control-Request-Headers`.
    pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
        method == Method::OPTIONS
            && headers
                .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.to_ascii_lowercase().contains(GRPC_WEB_MARKER))
    }

    pub fn preflight_decision(&self, path: &str, headers: &HeaderMap) -> PreflightDecision {
        if self.allowed_origin(headers).is_none() {
            return PreflightDecision::ForbiddenOrigin;
        }
        if !self.registered_endpoints_only {
            return PreflightDecision::Allowed;
        }
        match &self.endpoints {
            Some(endpoints) if endpoints.matches(path) => PreflightDecision::Allowed,
            Some(_) => PreflightDecision::MethodNotAllowed,
            None => {
                tracing::warn!(
                    path,
                    "CORS restricted to registered endpoints but no endpoint list is configured"
                );
                PreflightDecision::MethodNotAllowed
            }
        }
    }

    /// Add CORS headers for an actual (non pre-flight) response.
    pub fn apply(&self, origin: &HeaderValue, response: &mut HeaderMap) {
        self.apply_common(origin, response);
        if let Some(v) = join(&self.exposed_headers) {
            response.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, v);
        }
    }

    /// Add CORS headers answering the pre-flight described by `request`.
    pub fn apply_preflight(&self, origin: &HeaderValue, request: &HeaderMap, response: &mut HeaderMap) {
        self.apply_common(origin, response);
        response.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        );
        let requested = request.get(header::ACCESS_CONTROL_REQUEST_HEADERS);
        let allow_headers = match requested {
            Some(v) if self.any_request_header => Some(v.clone()),
            _ => join(&self.allowed_request_headers),
        };
        if let Some(v) = allow_headers {
            response.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, v);
        }
        response.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age_secs));
    }

    fn apply_common(&self, origin: &HeaderValue, response: &mut HeaderMap) {
        response.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        response.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        response.append(header::VARY, HeaderValue::from_static("Origin"));
    }
}

fn join(names: &[HeaderName]) -> Option<HeaderValue> {
    if names.is_empty() {
        return None;
    }
    let joined = names.iter().map(HeaderName::as_str).collect::<Vec<_>>().join(", ");
    HeaderValue::from_str(&joined).ok()
}

/// Origin `host[:port]` equals the `Host` header. No Origin passes.
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Some(origin) = origin.to_str().ok().and_then(|o| url::Url::parse(o).ok()) else {
        return false;
    };
    let Some(host) = origin.host_str() else {
        return false;
    };
    let authority = match origin.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|h| h.eq_ignore_ascii_case(&authority))
}
