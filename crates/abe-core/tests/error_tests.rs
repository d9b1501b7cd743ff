use std::time::Duration;

use abe_core::axum::body::to_bytes;
use abe_core::axum::http::StatusCode;
use abe_core::axum::response::IntoResponse;
use abe_core::error::{AbeError, ErrorCode, ErrorDetail};
use abe_core::plugin::PluginError;
use abe_core::pool::PoolError;
use abe_core::response::ApiResponse;
use abe_core::sea_orm::DbErr;
use serde_json::{Value, json};

async fn render(err: AbeError) -> (StatusCode, Option<String>, Value) {
    let response = err.into_response();
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, retry_after, serde_json::from_slice(&bytes).unwrap())
}

// ═══ Classification ═══

#[test]
fn test_client_errors() {
    let cases = [
        (AbeError::invalid_input("bad"), StatusCode::BAD_REQUEST, ErrorCode::ValidationFailed),
        (AbeError::InvalidJson("eof".into()), StatusCode::BAD_REQUEST, ErrorCode::InvalidJson),
        (AbeError::Unauthorized("who".into()), StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized),
        (AbeError::TokenExpired, StatusCode::UNAUTHORIZED, ErrorCode::TokenExpired),
        (AbeError::TokenInvalid("sig".into()), StatusCode::UNAUTHORIZED, ErrorCode::TokenInvalid),
        (AbeError::Forbidden("no".into()), StatusCode::FORBIDDEN, ErrorCode::Forbidden),
        (AbeError::not_found("user"), StatusCode::NOT_FOUND, ErrorCode::NotFound),
        (AbeError::conflict("taken"), StatusCode::CONFLICT, ErrorCode::Conflict),
    ];
    for (err, status, code) in cases {
        assert_eq!(err.status_code(), status, "{err}");
        assert_eq!(err.error_code(), code, "{err}");
    }
}

#[test]
fn test_server_errors_hide_their_cause() {
    let cases = [
        AbeError::Internal("secret stack".into()),
        AbeError::Dependency("missing Foo".into()),
        AbeError::Server("bind failed".into()),
        AbeError::ShutdownTimeout(Duration::from_secs(5)),
        AbeError::Plugin(PluginError::Init {
            key: "acme.audit".into(),
            reason: "db down".into(),
        }),
    ];
    for err in cases {
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR, "{err}");
        assert_eq!(err.error_code(), ErrorCode::InternalError, "{err}");
        assert_eq!(err.public_message(), "internal server error");
    }
}

#[test]
fn test_service_unavailable() {
    let err = AbeError::from(PoolError::Overload);
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.error_code().as_i32(), 6001);
    assert_eq!(err.public_message(), "service unavailable");
}

#[test]
fn test_database_errors() {
    let missing = AbeError::from(DbErr::RecordNotFound("user 3".into()));
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(missing.error_code(), ErrorCode::NotFound);

    let other = AbeError::from(DbErr::Custom("connection reset".into()));
    assert_eq!(other.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(other.error_code().as_i32(), 5002);
    assert_eq!(other.public_message(), "internal server error");
}

#[test]
fn test_not_found_message_includes_id() {
    assert_eq!(AbeError::not_found("order").public_message(), "order not found");
    assert_eq!(AbeError::not_found_id("order", 7).public_message(), "order[7] not found");
}

#[test]
fn test_error_code_values() {
    assert_eq!(ErrorCode::ValidationFailed.as_i32(), 1001);
    assert_eq!(ErrorCode::Forbidden.as_i32(), 2101);
    assert_eq!(ErrorCode::NotFound.as_i32(), 3001);
    assert_eq!(ErrorCode::RateLimited.as_i32(), 4001);
    assert_eq!(ErrorCode::InternalError.as_i32(), 5001);
}

// ═══ Rendering ═══

#[tokio::test]
async fn test_envelope_shape() {
    let err = AbeError::InvalidInput {
        message: "bad range".into(),
        details: vec![ErrorDetail::field("end", "must follow start")],
    };
    let (status, _, body) = render(err).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({
            "code": 1001,
            "message": "bad range",
            "details": [{ "field": "end", "reason": "must follow start" }],
        })
    );
}

#[tokio::test]
async fn test_empty_details_are_omitted() {
    let (_, _, body) = render(AbeError::Forbidden("no".into())).await;
    assert_eq!(body, json!({ "code": 2101, "message": "forbidden" }));
}

#[tokio::test]
async fn test_rate_limited_sets_retry_after() {
    let err = AbeError::RateLimited {
        scope: "ip".into(),
        rate: 5.0,
        burst: 10,
        retry_after: Duration::from_millis(200),
    };
    let (status, retry_after, body) = render(err).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(retry_after.as_deref(), Some("1"));
    assert_eq!(body["code"], 4001);
    assert_eq!(body["details"][0]["field"], "rate_limit");
}

#[tokio::test]
async fn test_success_envelope() {
    let response = ApiResponse::success(json!({ "id": 1 })).into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["id"], 1);
}
