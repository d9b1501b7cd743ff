mod common;

use std::sync::Arc;
use std::time::Duration;

use abe_core::axum::body::Body;
use abe_core::axum::http::{Request, StatusCode};
use abe_core::auth::UserClaims;
use abe_core::config::OperationLogConfig;
use abe_core::controller;
use abe_core::middleware::{MiddlewareRegistry, apply_route};
use abe_core::operation_log::{
    OperationBehavior, OperationInfo, OperationLogEntry, OperationLogger, OperationRequest, risk,
};
use abe_core::prelude::*;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use common::{engine, send};

const SECRET_YAML: &str = "auth:\n  jwt_secret: test-secret\n";

struct Recorder {
    tx: mpsc::UnboundedSender<OperationLogEntry>,
}

#[async_trait]
impl OperationBehavior for Recorder {
    fn parse(&self, request: &OperationRequest) -> Option<OperationInfo> {
        if request.path.starts_with("/ignored") {
            return None;
        }
        let action = match request.method.as_str() {
            "DELETE" => "delete",
            _ => "update",
        };
        Some(OperationInfo {
            module: "users".into(),
            action: action.into(),
            resource: request.path.rsplit('/').next().map(str::to_string),
            description: format!("{action} user"),
        })
    }

    fn determine_risk(&self, _module: &str, action: &str) -> String {
        if action == "delete" { risk::HIGH } else { risk::LOW }.to_string()
    }

    async fn write(&self, entry: OperationLogEntry) -> Result<(), AbeError> {
        self.tx
            .send(entry)
            .map_err(|_| AbeError::Internal("recorder closed".into()))
    }
}

#[derive(Clone)]
struct UsersController;

impl Controller for UsersController {
    fn register_routes(
        &self,
        router: Router<Engine>,
        _middlewares: &MiddlewareRegistry,
        engine: &Engine,
    ) -> Router<Engine> {
        let guarded = Router::new()
            .route("/users/{id}", post(update).put(update).delete(remove).get(show))
            .route("/ignored/{id}", post(update));
        router
            .merge(apply_route(guarded, &[engine.auth().authentication()]))
            .route("/public", post(update))
    }
}

async fn update(body: String) -> Json<Value> {
    Json(json!({ "received": body.len() }))
}

async fn remove() -> Result<(), AbeError> {
    Err(AbeError::Forbidden("protected user".into()))
}

async fn show() -> &'static str {
    "alice"
}

async fn app(config: Option<OperationLogConfig>) -> (Engine, Router, mpsc::UnboundedReceiver<OperationLogEntry>) {
    let engine = engine(SECRET_YAML).await;
    let (tx, rx) = mpsc::unbounded_channel();
    let behavior = Arc::new(Recorder { tx });
    let logger = match config {
        Some(config) => OperationLogger::with_config(&engine, behavior, config),
        None => OperationLogger::new(&engine, behavior),
    };
    engine.middlewares().register_global([logger.handler()]);
    engine.add_controller([controller::provider(UsersController)]);
    let router = engine.mount().unwrap();
    (engine, router, rx)
}

fn token(engine: &Engine) -> String {
    let mut claims = UserClaims::new("5", "dave");
    claims.display_name = "Dave".into();
    engine.generate_token(&claims).unwrap()
}

fn write_request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("user-agent", "abe-tests")
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn next_entry(rx: &mut mpsc::UnboundedReceiver<OperationLogEntry>) -> OperationLogEntry {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no operation log within 5s")
        .expect("recorder dropped")
}

async fn assert_nothing_logged(rx: &mut mpsc::UnboundedReceiver<OperationLogEntry>) {
    let next = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(next.is_err(), "unexpected entry: {:?}", next.ok().flatten());
}

// ═══ Recording ═══

#[tokio::test]
async fn test_write_by_authenticated_user_is_recorded() {
    let (engine, router, mut rx) = app(None).await;
    let token = token(&engine);
    let body = json!({ "name": "Alice", "password": "hunter2", "profile": { "newPassword": "x" } });

    let reply = send(&router, write_request("POST", "/users/7", Some(&token), &body.to_string())).await;
    assert_eq!(reply.status, StatusCode::OK);

    let entry = next_entry(&mut rx).await;
    assert_eq!(entry.user_id, 5);
    assert_eq!(entry.username, "dave");
    assert_eq!(entry.display_name, "Dave");
    assert_eq!(entry.module, "users");
    assert_eq!(entry.action, "update");
    assert_eq!(entry.resource.as_deref(), Some("7"));
    assert_eq!(entry.method, "POST");
    assert!(entry.path.starts_with("/users/"), "{}", entry.path);
    assert_eq!(entry.ip_address, "203.0.113.9");
    assert_eq!(entry.user_agent.as_deref(), Some("abe-tests"));
    assert_eq!(entry.response_status, 200);
    assert!(entry.is_success);
    assert_eq!(entry.risk_level, "low");

    let logged: Value = serde_json::from_str(entry.request_body.as_deref().unwrap()).unwrap();
    assert_eq!(logged["name"], "Alice");
    assert_eq!(logged["password"], "******");
    assert_eq!(logged["profile"]["newPassword"], "******");
}

#[tokio::test]
async fn test_handler_still_sees_the_full_body() {
    let (engine, router, mut rx) = app(None).await;
    let token = token(&engine);
    let body = json!({ "password": "hunter2" }).to_string();

    let reply = send(&router, write_request("PUT", "/users/7", Some(&token), &body)).await;
    assert_eq!(reply.body["received"], body.len());
    next_entry(&mut rx).await;
}

#[tokio::test]
async fn test_failed_delete_is_recorded_as_high_risk() {
    let (engine, router, mut rx) = app(None).await;
    let token = token(&engine);

    let reply = send(&router, write_request("DELETE", "/users/7", Some(&token), "")).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    let entry = next_entry(&mut rx).await;
    assert_eq!(entry.action, "delete");
    assert_eq!(entry.risk_level, "high");
    assert_eq!(entry.response_status, 403);
    assert!(!entry.is_success);
    assert_eq!(entry.request_body, None);
    assert!(entry.response_message.is_some());
}

#[tokio::test]
async fn test_oversized_body_is_truncated() {
    let config = OperationLogConfig {
        max_body_size: 16,
        ..OperationLogConfig::default()
    };
    let (engine, router, mut rx) = app(Some(config)).await;
    let token = token(&engine);
    let body = json!({ "bio": "a".repeat(64) }).to_string();

    send(&router, write_request("POST", "/users/7", Some(&token), &body)).await;
    let entry = next_entry(&mut rx).await;
    assert_eq!(entry.request_body.as_deref(), Some("[request body too large, truncated]"));
}

// ═══ Skipped ═══

#[tokio::test]
async fn test_reads_are_not_recorded() {
    let (engine, router, mut rx) = app(None).await;
    let token = token(&engine);

    let reply = send(&router, common::bearer("/users/7", &token)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_nothing_logged(&mut rx).await;
}

#[tokio::test]
async fn test_anonymous_writes_are_not_recorded() {
    let (_engine, router, mut rx) = app(None).await;

    let reply = send(&router, write_request("POST", "/public", None, "{}")).await;
    assert_eq!(reply.status, StatusCode::OK);
    let rejected = send(&router, write_request("POST", "/users/7", None, "{}")).await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
    assert_nothing_logged(&mut rx).await;
}

#[tokio::test]
async fn test_behavior_can_decline_a_request() {
    let (engine, router, mut rx) = app(None).await;
    let token = token(&engine);

    send(&router, write_request("POST", "/ignored/1", Some(&token), "{}")).await;
    assert_nothing_logged(&mut rx).await;
}
