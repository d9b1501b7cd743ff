use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sea_orm::{DbErr, SqlErr};
use serde::{Serialize, Serializer};
use thiserror::Error;
use utoipa::ToSchema;
use validator::ValidationErrors;

use crate::config::ConfigError;
use crate::events::EventError;
use crate::middleware::MiddlewareError;
use crate::plugin::PluginError;
use crate::pool::PoolError;
use crate::scheduler::SchedulerError;

/// Business error codes, independent of the HTTP status.
///
/// Clients branch on these numbers; the HTTP status only conveys the
/// semantic class of the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ValidationFailed = 1001,
    InvalidJson = 1002,
    InvalidFormat = 1003,

    Unauthorized = 2001,
    TokenExpired = 2002,
    TokenInvalid = 2003,
    Forbidden = 2101,
    InsufficientPermission = 2102,

    NotFound = 3001,
    AlreadyExists = 3002,
    Conflict = 3003,
    ResourceGone = 3004,
    PreconditionFailed = 3005,

    RateLimited = 4001,
    QuotaExceeded = 4002,
    RequestTooLarge = 4003,
    MethodNotAllowed = 4004,

    InternalError = 5001,
    DatabaseError = 5002,
    CacheError = 5003,

    ServiceUnavailable = 6001,
    GatewayTimeout = 6002,
    ExternalApiError = 6003,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

/// One entry of the `details` list of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub reason: String,
}

impl ErrorDetail {
    pub fn new(reason: impl Into<String>) -> Self {
        ErrorDetail {
            field: None,
            reason: reason.into(),
        }
    }

    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ErrorDetail {
            field: Some(field.into()),
            reason: reason.into(),
        }
    }
}

/// Uniform error envelope written for every failed request.
///
/// ```json
/// {
///   "code": 1001,
///   "message": "validation failed",
///   "details": [{ "field": "email", "reason": "email must be a valid email" }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(value_type = i32)]
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

/// Standard error type for the abe framework.
#[derive(Debug, Clone, Error)]
pub enum AbeError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("{resource} not found")]
    NotFound {
        resource: String,
        id: Option<String>,
    },

    #[error("conflict: {message}")]
    Conflict {
        message: String,
        field: Option<String>,
    },

    #[error("rate limit exceeded for {scope}")]
    RateLimited {
        scope: String,
        rate: f64,
        burst: u32,
        retry_after: Duration,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("request canceled")]
    Canceled,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("dependency resolution failed: {0}")]
    Dependency(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(Arc<DbErr>),

    #[error("{message}")]
    Http {
        status: StatusCode,
        code: ErrorCode,
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("graceful shutdown exceeded {0:?}")]
    ShutdownTimeout(Duration),

    #[error("server error: {0}")]
    Server(String),
}

impl From<DbErr> for AbeError {
    fn from(err: DbErr) -> Self {
        AbeError::Database(Arc::new(err))
    }
}

impl From<std::io::Error> for AbeError {
    fn from(err: std::io::Error) -> Self {
        AbeError::Io(Arc::new(err))
    }
}

impl From<ValidationErrors> for AbeError {
    fn from(err: ValidationErrors) -> Self {
        AbeError::Validation(err)
    }
}

impl From<jsonwebtoken::errors::Error> for AbeError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AbeError::TokenExpired,
            _ => AbeError::TokenInvalid(err.to_string()),
        }
    }
}

impl AbeError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        AbeError::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    pub fn not_found_id(resource: impl Into<String>, id: impl ToString) -> Self {
        AbeError::NotFound {
            resource: resource.into(),
            id: Some(id.to_string()),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AbeError::Conflict {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        AbeError::InvalidInput {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AbeError::Validation(_) | AbeError::InvalidInput { .. } | AbeError::InvalidJson(_) => {
                StatusCode::BAD_REQUEST
            }
            AbeError::NotFound { .. } => StatusCode::NOT_FOUND,
            AbeError::Conflict { .. } => StatusCode::CONFLICT,
            AbeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AbeError::Unauthorized(_) | AbeError::TokenExpired | AbeError::TokenInvalid(_) => {
                StatusCode::UNAUTHORIZED
            }
            AbeError::Forbidden(_) => StatusCode::FORBIDDEN,
            AbeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // 499 "client closed request"
            AbeError::Canceled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AbeError::ServiceUnavailable(_) | AbeError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            AbeError::Database(err) => match db_error_kind(err) {
                DbErrorKind::NotFound => StatusCode::NOT_FOUND,
                DbErrorKind::Duplicate => StatusCode::CONFLICT,
                DbErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AbeError::Http { status, .. } => *status,
            AbeError::Dependency(_)
            | AbeError::Internal(_)
            | AbeError::Config(_)
            | AbeError::Plugin(_)
            | AbeError::Middleware(_)
            | AbeError::Event(_)
            | AbeError::Scheduler(_)
            | AbeError::Io(_)
            | AbeError::ShutdownTimeout(_)
            | AbeError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the business code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AbeError::Validation(_) | AbeError::InvalidInput { .. } => ErrorCode::ValidationFailed,
            AbeError::InvalidJson(_) => ErrorCode::InvalidJson,
            AbeError::NotFound { .. } => ErrorCode::NotFound,
            AbeError::Conflict { .. } => ErrorCode::Conflict,
            AbeError::RateLimited { .. } => ErrorCode::RateLimited,
            AbeError::Unauthorized(_) => ErrorCode::Unauthorized,
            AbeError::TokenExpired => ErrorCode::TokenExpired,
            AbeError::TokenInvalid(_) => ErrorCode::TokenInvalid,
            AbeError::Forbidden(_) => ErrorCode::Forbidden,
            AbeError::Timeout(_) => ErrorCode::GatewayTimeout,
            AbeError::ServiceUnavailable(_) | AbeError::Pool(_) => ErrorCode::ServiceUnavailable,
            AbeError::Database(err) => match db_error_kind(err) {
                DbErrorKind::NotFound => ErrorCode::NotFound,
                DbErrorKind::Duplicate => ErrorCode::AlreadyExists,
                DbErrorKind::Other => ErrorCode::DatabaseError,
            },
            AbeError::Http { code, .. } => *code,
            AbeError::Canceled
            | AbeError::Dependency(_)
            | AbeError::Internal(_)
            | AbeError::Config(_)
            | AbeError::Plugin(_)
            | AbeError::Middleware(_)
            | AbeError::Event(_)
            | AbeError::Scheduler(_)
            | AbeError::Io(_)
            | AbeError::ShutdownTimeout(_)
            | AbeError::Server(_) => ErrorCode::InternalError,
        }
    }

    /// Client-facing message. Server-side failures never leak their cause.
    pub fn public_message(&self) -> String {
        match self {
            AbeError::Validation(_) => "validation failed".to_string(),
            AbeError::InvalidInput { message, .. } => message.clone(),
            AbeError::InvalidJson(_) => "malformed request body".to_string(),
            AbeError::NotFound { resource, id } => match id {
                Some(id) => format!("{resource}[{id}] not found"),
                None => format!("{resource} not found"),
            },
            AbeError::Conflict { message, .. } => message.clone(),
            AbeError::RateLimited { retry_after, .. } => format!(
                "too many requests, retry in {} seconds",
                retry_after.as_secs().max(1)
            ),
            AbeError::Unauthorized(_) => "unauthorized".to_string(),
            AbeError::TokenExpired => "token expired".to_string(),
            AbeError::TokenInvalid(_) => "token invalid".to_string(),
            AbeError::Forbidden(_) => "forbidden".to_string(),
            AbeError::Timeout(_) => "request timed out".to_string(),
            AbeError::Canceled => "request canceled".to_string(),
            AbeError::ServiceUnavailable(_) | AbeError::Pool(_) => {
                "service unavailable".to_string()
            }
            AbeError::Database(err) => match db_error_kind(err) {
                DbErrorKind::NotFound => "record not found".to_string(),
                DbErrorKind::Duplicate => "record already exists".to_string(),
                DbErrorKind::Other => "internal server error".to_string(),
            },
            AbeError::Http { message, .. } => message.clone(),
            _ => "internal server error".to_string(),
        }
    }

    /// Field-level details, untranslated.
    ///
    /// Validation failures are rendered from their raw codes here; the
    /// error-handler middleware replaces them with locale-aware messages.
    pub fn details(&self) -> Vec<ErrorDetail> {
        match self {
            AbeError::Validation(errors) => errors
                .field_errors()
                .into_iter()
                .flat_map(|(field, errs)| {
                    errs.iter().map(move |e| {
                        let reason = e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("failed '{}' validation", e.code));
                        ErrorDetail::field(field.to_string(), reason)
                    })
                })
                .collect(),
            AbeError::InvalidInput { details, .. } | AbeError::Http { details, .. } => {
                details.clone()
            }
            AbeError::InvalidJson(reason) => vec![ErrorDetail::new(reason.clone())],
            AbeError::Conflict {
                field: Some(field), ..
            } => vec![ErrorDetail::field(field.clone(), "conflicting value")],
            AbeError::RateLimited {
                scope,
                rate,
                burst,
                retry_after,
            } => vec![ErrorDetail::field(
                "rate_limit",
                format!(
                    "{scope} limit hit: rate {rate:.1} req/s, burst {burst}, retry in {}s",
                    retry_after.as_secs().max(1)
                ),
            )],
            _ => Vec::new(),
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.error_code(),
            message: self.public_message(),
            details: self.details(),
        }
    }

    /// Build the HTTP response for an already-classified body.
    pub(crate) fn render(&self, body: ErrorResponse) -> Response {
        let status = self.status_code();
        let mut response = (status, axum::Json(body)).into_response();
        if let AbeError::RateLimited { retry_after, .. } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

enum DbErrorKind {
    NotFound,
    Duplicate,
    Other,
}

fn db_error_kind(err: &DbErr) -> DbErrorKind {
    if matches!(err, DbErr::RecordNotFound(_)) {
        return DbErrorKind::NotFound;
    }
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => DbErrorKind::Duplicate,
        _ => DbErrorKind::Other,
    }
}

/// Error carried on a response so the error-handler middleware can
/// classify it once with request context.
#[derive(Debug, Clone)]
pub(crate) struct ResponseError(pub(crate) Arc<AbeError>);

impl IntoResponse for AbeError {
    fn into_response(self) -> Response {
        let body = self.to_error_response();
        let mut response = self.render(body);
        response
            .extensions_mut()
            .insert(ResponseError(Arc::new(self)));
        response
    }
}
