use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, OriginalUri, Request};
use axum::http::HeaderValue;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::AbeError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Path as the client sent it. Routers nested under a base path strip the
/// prefix from `req.uri()`; the original URI keeps it.
pub fn full_path(req: &Request) -> String {
    req.extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

/// Identity of the in-flight request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub request_time: DateTime<Utc>,
    started: Instant,
}

impl RequestMeta {
    pub fn new(request_id: impl Into<String>) -> Self {
        RequestMeta {
            request_id: request_id.into(),
            request_time: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestMeta {
    type Rejection = AbeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestMeta>()
            .cloned()
            .ok_or_else(|| AbeError::Internal("request meta middleware not installed".into()))
    }
}

/// Records the request id and start time.
///
/// Reads `X-Request-ID` (set upstream by the request-id layer, or by the
/// client) and generates one when missing. The id is echoed on the response.
pub async fn request_meta(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestMeta::new(request_id.clone()));

    let mut response = next.run(req).await;
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

/// Errors reported while handling one request.
///
/// The error-handler middleware installs a sink per request and classifies
/// the last reported error once the chain has returned.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    errors: Arc<Mutex<Vec<AbeError>>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, err: AbeError) {
        self.errors.lock().push(err);
    }

    pub fn last(&self) -> Option<AbeError> {
        self.errors.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}
