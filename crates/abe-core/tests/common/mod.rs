#![allow(dead_code)]

use abe_core::axum::Router;
use abe_core::axum::body::{Body, to_bytes};
use abe_core::axum::http::{HeaderMap, Request, StatusCode};
use abe_core::controller::{self, Controller};
use abe_core::middleware::MiddlewareRegistry;
use abe_core::{Engine, TestApp};
use serde_json::Value;
use tower::ServiceExt;

pub async fn engine(yaml: &str) -> Engine {
    TestApp::engine(yaml).await.unwrap()
}

/// Controller built from a plain function.
#[derive(Clone)]
pub struct Routes(pub fn(Router<Engine>) -> Router<Engine>);

impl Controller for Routes {
    fn register_routes(
        &self,
        router: Router<Engine>,
        _middlewares: &MiddlewareRegistry,
        _engine: &Engine,
    ) -> Router<Engine> {
        (self.0)(router)
    }
}

/// Add `routes` as a controller and mount the engine.
pub fn mount(engine: &Engine, routes: fn(Router<Engine>) -> Router<Engine>) -> Router {
    engine.add_controller([controller::provider(Routes(routes))]);
    engine.mount().unwrap()
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(router: &Router, request: Request<Body>) -> Reply {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Reply { status, headers, body }
}

pub async fn get(router: &Router, uri: &str) -> Reply {
    send(router, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn post_json(router: &Router, uri: &str, body: &Value) -> Reply {
    send(
        router,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

/// Engine over a fresh in-memory sqlite database with framework
/// migrations applied.
pub async fn sqlite_engine(yaml: &str) -> Engine {
    use abe_core::sea_orm::{ConnectOptions, Database};

    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.unwrap();
    Engine::builder(abe_core::Config::from_yaml_str(yaml).unwrap())
        .database(db)
        .skip_logging()
        .build()
        .await
        .unwrap()
}

pub fn bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}
