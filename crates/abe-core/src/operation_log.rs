//! Audit trail of write operations performed by authenticated users.
//!
//! The handler must be registered as a global middleware so that it wraps
//! the group-level authentication handler: claims are read from the
//! response once the chain has returned. What gets recorded, how risky it
//! is and where it goes are decided by an [`OperationBehavior`].
//!
//! ```rust,ignore
//! let audit = OperationLogger::new(&engine, Arc::new(AdminAudit::new(db)));
//! engine.middlewares().register_global([audit.handler()]);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::auth::UserClaims;
use crate::config::OperationLogConfig;
use crate::engine::Engine;
use crate::error::{AbeError, ErrorCode, ResponseError};
use crate::middleware::Handler;
use crate::pool::WorkerPool;
use crate::request::{ErrorSink, RequestMeta, full_path};

const DEFAULT_MAX_BODY: usize = 10 * 1024;
const BUFFER_LIMIT: usize = 8 * 1024 * 1024;
const TRUNCATED: &str = "[request body too large, truncated]";
const SANITIZED_SUFFIX: &str = " [sensitive fields sanitized]";
const MASK: &str = "******";

/// Risk levels understood by the logger. Behaviors may return any string;
/// `high` and `critical` trigger a warning.
pub mod risk {
    pub const LOW: &str = "low";
    pub const MEDIUM: &str = "medium";
    pub const HIGH: &str = "high";
    pub const CRITICAL: &str = "critical";
}

/// What a behavior extracts from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationInfo {
    pub module: String,
    pub action: String,
    pub resource: Option<String>,
    pub description: String,
}

/// The parts of a finished request a behavior may inspect.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub method: Method,
    pub path: String,
    /// Route template, e.g. `/users/{id}`, when the router matched one.
    pub route: Option<String>,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

/// One audit record.
#[derive(Debug, Clone)]
pub struct OperationLogEntry {
    pub user_id: u64,
    pub username: String,
    pub display_name: String,

    pub module: String,
    pub action: String,
    pub resource: Option<String>,
    pub description: String,

    pub request_id: String,
    pub method: String,
    pub path: String,
    pub ip_address: String,
    pub user_agent: Option<String>,

    pub request_body: Option<String>,
    pub response_status: u16,
    pub response_message: Option<String>,
    pub is_success: bool,

    pub duration_ms: u64,
    pub risk_level: String,
}

#[async_trait]
pub trait OperationBehavior: Send + Sync {
    /// `None` (or an empty module) means the request is not recorded.
    fn parse(&self, request: &OperationRequest) -> Option<OperationInfo>;

    fn determine_risk(&self, module: &str, action: &str) -> String;

    async fn write(&self, entry: OperationLogEntry) -> Result<(), AbeError>;
}

#[derive(Clone)]
pub struct OperationLogger {
    pool: WorkerPool,
    behavior: Arc<dyn OperationBehavior>,
    config: Arc<OperationLogConfig>,
}

impl OperationLogger {
    /// Logger configured from `operation_log.*`.
    pub fn new(engine: &Engine, behavior: Arc<dyn OperationBehavior>) -> Self {
        let config = engine.config().settings().operation_log.clone();
        Self::with_config(engine, behavior, config)
    }

    pub fn with_config(
        engine: &Engine,
        behavior: Arc<dyn OperationBehavior>,
        mut config: OperationLogConfig,
    ) -> Self {
        if config.max_body_size == 0 {
            config.max_body_size = DEFAULT_MAX_BODY;
        }
        if config.sensitive_fields.is_empty() {
            config.sensitive_fields = OperationLogConfig::default().sensitive_fields;
        }
        OperationLogger {
            pool: engine.pool().clone(),
            behavior,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &OperationLogConfig {
        &self.config
    }

    pub fn handler(&self) -> Handler {
        let logger = self.clone();
        Handler::new("operation_log", move |req: Request, next: Next| {
            let logger = logger.clone();
            async move { logger.handle(req, next).await }
        })
    }

    async fn handle(&self, req: Request, next: Next) -> Response {
        let method = req.method().clone();
        if !is_write(&method) {
            return next.run(req).await;
        }

        let meta = req.extensions().get::<RequestMeta>().cloned();
        let started = std::time::Instant::now();
        let sink = req.extensions().get::<ErrorSink>().cloned();
        let snapshot = OperationRequest {
            method: method.clone(),
            path: full_path(&req),
            route: req.extensions().get::<MatchedPath>().map(|p| p.as_str().to_string()),
            query: req.uri().query().map(str::to_string),
            headers: req.headers().clone(),
        };

        let (req, body) = if method == Method::DELETE {
            (req, None)
        } else {
            match self.capture_body(req).await {
                Ok((req, body)) => (req, body),
                Err(response) => return response,
            }
        };

        let response = next.run(req).await;

        let Some(claims) = response.extensions().get::<UserClaims>().cloned() else {
            return response;
        };
        let status = response.status();
        let message = response
            .extensions()
            .get::<ResponseError>()
            .map(|e| e.0.public_message())
            .or_else(|| sink.and_then(|s| s.last()).map(|e| e.public_message()));
        let duration = meta.as_ref().map(RequestMeta::elapsed).unwrap_or_else(|| started.elapsed());
        let request_id = meta.map(|m| m.request_id).unwrap_or_default();

        let record = Record {
            claims,
            request: snapshot,
            body,
            status,
            message,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            request_id,
        };
        let logger = self.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.submit(async move { logger.record(record).await }).await {
                tracing::warn!(error = %err, "operation log dropped");
            }
        });

        response
    }

    async fn capture_body(&self, req: Request) -> Result<(Request, Option<String>), Response> {
        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, BUFFER_LIMIT).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "failed to buffer request body for operation log");
                return Err(AbeError::Http {
                    status: StatusCode::PAYLOAD_TOO_LARGE,
                    code: ErrorCode::RequestTooLarge,
                    message: "request body too large".to_string(),
                    details: Vec::new(),
                }
                .into_response());
            }
        };
        let captured = if bytes.is_empty() {
            None
        } else if bytes.len() > self.config.max_body_size {
            Some(TRUNCATED.to_string())
        } else {
            Some(sanitize(&bytes, &self.config.sensitive_fields))
        };
        Ok((Request::from_parts(parts, Body::from(bytes)), captured))
    }

    async fn record(&self, record: Record) {
        let Some(info) = self.behavior.parse(&record.request).filter(|i| !i.module.is_empty()) else {
            return;
        };
        let risk = self.behavior.determine_risk(&info.module, &info.action);
        let claims = &record.claims;

        let entry = OperationLogEntry {
            user_id: leading_digits(&claims.user_id),
            username: claims.username.clone(),
            display_name: claims.display_name.clone(),
            module: info.module.clone(),
            action: info.action.clone(),
            resource: info.resource.clone(),
            description: info.description.clone(),
            request_id: record.request_id.clone(),
            method: record.request.method.to_string(),
            path: record.request.route.clone().unwrap_or_else(|| record.request.path.clone()),
            ip_address: client_ip(&record.request.headers),
            user_agent: record
                .request
                .headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            request_body: record.body.clone(),
            response_status: record.status.as_u16(),
            response_message: record.message.clone(),
            is_success: record.status.is_success(),
            duration_ms: record.duration_ms,
            risk_level: risk.clone(),
        };
        let ip = entry.ip_address.clone();

        if let Err(err) = self.behavior.write(entry).await {
            tracing::error!(
                error = %err,
                username = %claims.username,
                module = %info.module,
                action = %info.action,
                "failed to write operation log"
            );
        }

        if self.config.log_high_risk && (risk == risk::HIGH || risk == risk::CRITICAL) {
            tracing::warn!(
                username = %claims.username,
                module = %info.module,
                action = %info.action,
                description = %info.description,
                risk_level = %risk,
                %ip,
                "high-risk operation"
            );
        }
    }
}

struct Record {
    claims: UserClaims,
    request: OperationRequest,
    body: Option<String>,
    status: StatusCode,
    message: Option<String>,
    duration_ms: u64,
    request_id: String,
}

fn is_write(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Mask sensitive fields of a JSON body. Non-JSON bodies that mention a
/// sensitive field are kept as-is with a marker appended.
pub fn sanitize(body: &[u8], sensitive: &[String]) -> String {
    if let Ok(mut value) = serde_json::from_slice::<Value>(body) {
        if mask(&mut value, sensitive) {
            return value.to_string();
        }
    }
    let text = String::from_utf8_lossy(body).into_owned();
    if sensitive.iter().any(|f| !f.is_empty() && text.contains(f.as_str())) {
        format!("{text}{SANITIZED_SUFFIX}")
    } else {
        text
    }
}

fn mask(value: &mut Value, sensitive: &[String]) -> bool {
    match value {
        Value::Object(map) => {
            let mut masked = false;
            for (key, nested) in map.iter_mut() {
                if sensitive.iter().any(|f| is_sensitive(key, f)) {
                    *nested = Value::String(MASK.to_string());
                    masked = true;
                } else {
                    masked |= mask(nested, sensitive);
                }
            }
            masked
        }
        Value::Array(items) => items.iter_mut().fold(false, |acc, v| mask(v, sensitive) | acc),
        _ => false,
    }
}

// `newPassword`, `new_password` and `NEW_PASSWORD` all match `new_password`
fn is_sensitive(key: &str, field: &str) -> bool {
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect()
    };
    !field.is_empty() && squash(key) == squash(field)
}

fn leading_digits(id: &str) -> u64 {
    id.chars()
        .filter(char::is_ascii_digit)
        .fold(0u64, |acc, c| {
            acc.saturating_mul(10)
                .saturating_add(u64::from(c.to_digit(10).unwrap_or(0)))
        })
}

fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded.or(real).unwrap_or_default().to_string()
}
