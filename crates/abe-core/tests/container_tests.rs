mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use abe_core::axum::Json;
use abe_core::axum::body::Body;
use abe_core::axum::extract::Request;
use abe_core::axum::http::StatusCode;
use abe_core::axum::middleware::Next;
use abe_core::axum::routing::get;
use abe_core::config::Config;
use abe_core::middleware::Handler;
use abe_core::prelude::*;
use serde_json::{Value, json};

use common::{engine, mount, send};

// ═══ Container ═══

#[derive(Debug)]
struct Counter {
    id: usize,
}

#[test]
fn test_factory_builds_once_per_container() {
    let built = Arc::new(AtomicUsize::new(0));
    let container = Container::new();
    let counter = built.clone();
    container.provide(move |_| {
        Ok(Counter {
            id: counter.fetch_add(1, Ordering::SeqCst),
        })
    });

    let a = container.resolve_arc::<Counter>().unwrap();
    let b = container.resolve_arc::<Counter>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(built.load(Ordering::SeqCst), 1);

    let other = Container::new();
    let counter = built.clone();
    other.provide(move |_| {
        Ok(Counter {
            id: counter.fetch_add(1, Ordering::SeqCst),
        })
    });
    let c = other.resolve_arc::<Counter>().unwrap();
    assert_ne!(a.id, c.id);
}

#[test]
fn test_resolve_value_and_contains() {
    let container = Container::new();
    assert!(!container.contains::<String>());
    container.provide_value("hello".to_string());
    assert!(container.contains::<String>());
    assert_eq!(container.resolve::<String>().unwrap(), "hello");
}

#[test]
fn test_missing_dependency_is_reported() {
    let container = Container::new();
    let err = container.resolve_arc::<Counter>().unwrap_err();
    match err {
        AbeError::Dependency(msg) => assert!(msg.contains("Counter"), "message was {msg}"),
        other => panic!("expected dependency error, got {other:?}"),
    }
}

#[derive(Debug)]
struct Left;
#[derive(Debug)]
struct Right;

#[test]
fn test_dependency_cycle_is_detected() {
    let container = Container::new();
    container.provide(|c: &Container| {
        c.resolve_arc::<Right>()?;
        Ok(Left)
    });
    container.provide(|c: &Container| {
        c.resolve_arc::<Left>()?;
        Ok(Right)
    });

    let err = container.resolve_arc::<Left>().unwrap_err();
    match err {
        AbeError::Dependency(msg) => assert!(msg.contains("cycle"), "message was {msg}"),
        other => panic!("expected dependency error, got {other:?}"),
    }
    // the failed attempt does not poison later resolutions
    container.provide(|_: &Container| Ok(Right));
    assert!(container.resolve_arc::<Left>().is_ok());
}

#[test]
fn test_shutdown_runs_cleanups_once_in_reverse() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let container = Container::new();
    for n in 1..=3 {
        let order = order.clone();
        container.on_shutdown(move || order.lock().unwrap().push(n));
    }
    container.provide_value(Counter { id: 1 });

    assert!(container.shutdown());
    assert!(!container.shutdown());
    assert!(container.is_shut_down());
    assert_eq!(*order.lock().unwrap(), [3, 2, 1]);
    assert!(container.resolve_arc::<Counter>().is_err());
}

#[test]
fn test_cleanup_after_shutdown_runs_immediately() {
    let ran = Arc::new(AtomicUsize::new(0));
    let container = Container::new();
    container.shutdown();
    let counter = ran.clone();
    container.on_shutdown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_cleanup_does_not_stop_others() {
    let ran = Arc::new(AtomicUsize::new(0));
    let container = Container::new();
    let counter = ran.clone();
    container.on_shutdown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    container.on_shutdown(|| panic!("cleanup failed"));
    container.shutdown();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

// ═══ Request scope ═══

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

struct Scoped {
    id: usize,
}

fn scoped_provider() -> Handler {
    Handler::new("scoped", |req: Request, next: Next| async move {
        if let Ok(container) = Container::from_extensions(req.extensions()) {
            container.provide(|_: &Container| {
                Ok(Scoped {
                    id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
                })
            });
            container.on_shutdown(|| {
                CLEANUPS.fetch_add(1, Ordering::SeqCst);
            });
        }
        next.run(req).await
    })
}

async fn scoped_handler(ctx: RequestContext) -> Result<Json<Value>, AbeError> {
    let first = ctx.resolve_arc::<Scoped>()?;
    let second = ctx.resolve_arc::<Scoped>()?;
    Ok(Json(json!({ "id": first.id, "same": Arc::ptr_eq(&first, &second) })))
}

#[tokio::test]
async fn test_each_request_gets_its_own_container() {
    let engine = engine("{}").await;
    engine.middlewares().register_global([scoped_provider()]);
    let app = mount(&engine, |r| r.route("/scoped", get(scoped_handler)));

    let before = CLEANUPS.load(Ordering::SeqCst);
    let first = common::get(&app, "/scoped").await;
    let second = common::get(&app, "/scoped").await;

    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["same"], true);
    assert_eq!(second.body["same"], true);
    assert_ne!(first.body["id"], second.body["id"]);
    assert_eq!(CLEANUPS.load(Ordering::SeqCst) - before, 2);
}

async fn identity(Inject(meta): Inject<RequestMeta>, Inject(config): Inject<Config>) -> Json<Value> {
    Json(json!({
        "request_id": meta.request_id,
        "app": config.settings().app.name,
    }))
}

#[tokio::test]
async fn test_engine_services_are_injectable() {
    let engine = engine("app:\n  name: inject-test\n").await;
    let app = mount(&engine, |r| r.route("/identity", get(identity)));

    let reply = send(
        &app,
        abe_core::axum::http::Request::builder()
            .uri("/identity")
            .header("x-request-id", "req-42")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["request_id"], "req-42");
    assert_eq!(reply.body["app"], "inject-test");
    assert_eq!(reply.headers["x-request-id"], "req-42");
}

// ═══ Use cases ═══

struct FindOrder;

impl Injectable for FindOrder {
    fn inject(_container: &Container) -> Result<Self, AbeError> {
        Ok(FindOrder)
    }
}

#[async_trait]
impl UseCase for FindOrder {
    type Input = u64;
    type Output = String;

    async fn handle(&self, _ctx: &RequestContext, id: u64) -> Result<String, AbeError> {
        if id == 1 {
            return Ok("order-1".to_string());
        }
        Err(AbeError::not_found_id("order", id))
    }
}

struct NeedsMissing;

impl Injectable for NeedsMissing {
    fn inject(container: &Container) -> Result<Self, AbeError> {
        container.resolve_arc::<Scoped>()?;
        Ok(NeedsMissing)
    }
}

#[async_trait]
impl UseCase for NeedsMissing {
    type Input = ();
    type Output = ();

    async fn handle(&self, _ctx: &RequestContext, _input: ()) -> Result<(), AbeError> {
        Ok(())
    }
}

async fn find_order(ctx: RequestContext, Path(id): Path<u64>) -> Result<ApiResponse<String>, AbeError> {
    Ok(ApiResponse::success(invoke::<FindOrder>(&ctx, id).await?))
}

async fn broken(ctx: RequestContext) -> Result<ApiResponse<()>, AbeError> {
    invoke::<NeedsMissing>(&ctx, ()).await?;
    Ok(ApiResponse::ok())
}

fn use_case_routes(router: Router<Engine>) -> Router<Engine> {
    router
        .route("/orders/{id}", get(find_order))
        .route("/broken", get(broken))
}

#[tokio::test]
async fn test_use_case_success() {
    let engine = engine("{}").await;
    let app = mount(&engine, use_case_routes);

    let reply = common::get(&app, "/orders/1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["code"], 0);
    assert_eq!(reply.body["data"], "order-1");
}

#[tokio::test]
async fn test_use_case_error_renders_envelope() {
    let engine = engine("{}").await;
    let app = mount(&engine, use_case_routes);

    let reply = common::get(&app, "/orders/7").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["code"], 3001);
    assert_eq!(reply.body["message"], "order[7] not found");
}

#[tokio::test]
async fn test_resolution_failure_is_internal_error() {
    let engine = engine("{}").await;
    let app = mount(&engine, use_case_routes);

    let reply = common::get(&app, "/broken").await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.body["code"], 5001);
    assert_eq!(reply.body["message"], "internal server error");
}

async fn reports_error(ctx: RequestContext) -> &'static str {
    ctx.report(AbeError::Forbidden("not yours".into()));
    "ignored"
}

#[tokio::test]
async fn test_reported_error_replaces_response() {
    let engine = engine("{}").await;
    let app = mount(&engine, |r| r.route("/report", get(reports_error)));

    let reply = common::get(&app, "/report").await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.body["code"], 2101);
}
