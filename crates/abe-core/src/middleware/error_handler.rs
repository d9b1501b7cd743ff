use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::engine::Engine;
use crate::error::{AbeError, ResponseError};
use crate::i18n::{Locale, Localizer, error_message_id};
use crate::request::{ErrorSink, RequestMeta};

/// Classifies request errors once, at the end of the chain.
///
/// The last error reported to the request's [`ErrorSink`] wins; otherwise
/// the error attached to the response by `AbeError::into_response` is used.
/// Validation details and generic messages are translated to the request
/// locale.
pub async fn error_handler(State(engine): State<Engine>, mut req: Request, next: Next) -> Response {
    let sink = ErrorSink::new();
    req.extensions_mut().insert(sink.clone());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let locale = req.extensions().get::<Locale>().cloned();
    let localizer = req.extensions().get::<Localizer>().cloned();
    let request_id = req
        .extensions()
        .get::<RequestMeta>()
        .map(|m| m.request_id.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    let err = match sink.last() {
        Some(err) => err,
        None => match response.extensions().get::<ResponseError>() {
            Some(attached) => (*attached.0).clone(),
            None => return response,
        },
    };

    let status = err.status_code();
    let mut body = err.to_error_response();
    if let AbeError::Validation(errors) = &err {
        body.details = engine
            .validator()
            .translate(errors, locale.as_ref().map(|l| l.as_str()));
    }
    if let (Some(localizer), Some(id)) = (&localizer, error_message_id(&err)) {
        let message = localizer.localize(id, &[]);
        if message != id {
            body.message = message;
        }
    }

    if status.is_server_error() {
        tracing::error!(
            %path,
            %method,
            status = status.as_u16(),
            code = body.code.as_i32(),
            %request_id,
            error = %err,
            "request failed"
        );
    } else {
        tracing::warn!(
            %path,
            %method,
            status = status.as_u16(),
            code = body.code.as_i32(),
            %request_id,
            error = %err,
            "request rejected"
        );
    }

    err.render(body)
}
