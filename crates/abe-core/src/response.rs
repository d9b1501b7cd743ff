use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Success envelope shared by abe endpoints.
///
/// ```json
/// { "code": 0, "message": "ok", "data": { ... } }
/// ```
///
/// Failures use [`ErrorResponse`](crate::error::ErrorResponse) instead.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip)]
    status: StatusCode,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        ApiResponse {
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
            status: StatusCode::OK,
        }
    }

    /// Create a `201 Created` response with data.
    pub fn created(data: T) -> Self {
        ApiResponse {
            status: StatusCode::CREATED,
            ..Self::success(data)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl ApiResponse<()> {
    /// Success without a payload.
    pub fn ok() -> Self {
        ApiResponse {
            code: 0,
            message: "ok".to_string(),
            data: None,
            status: StatusCode::OK,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, axum::Json(self)).into_response()
    }
}
