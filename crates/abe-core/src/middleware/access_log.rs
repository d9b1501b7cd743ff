use std::any::Any;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AbeError;
use crate::request::RequestMeta;

/// One structured line per request: method, path, status, latency, client.
pub async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_default();
    let meta = req.extensions().get::<RequestMeta>().cloned();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let latency_ms = meta
        .as_ref()
        .map(|m| m.elapsed().as_secs_f64() * 1000.0)
        .unwrap_or_default();
    let request_id = meta.map(|m| m.request_id).unwrap_or_default();
    match status {
        500..=u16::MAX => tracing::error!(%method, %path, ?query, status, latency_ms, %client, %request_id, "http request"),
        400..=499 => tracing::warn!(%method, %path, ?query, status, latency_ms, %client, %request_id, "http request"),
        _ => tracing::info!(%method, %path, ?query, status, latency_ms, %client, %request_id, "http request"),
    }
    response
}

/// Response for a handler that panicked; used with `CatchPanicLayer::custom`.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    AbeError::Internal(format!("handler panicked: {detail}")).into_response()
}
