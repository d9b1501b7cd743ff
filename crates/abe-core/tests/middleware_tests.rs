use std::sync::{Arc, Mutex};

use abe_core::middleware::{Handler, MiddlewareError, MiddlewareRegistry, apply, apply_route};
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::routing::get;
use tower::ServiceExt;

type Trace = Arc<Mutex<Vec<String>>>;

fn tracing_handler(name: &str, trace: &Trace) -> Handler {
    let label = name.to_string();
    let trace = trace.clone();
    Handler::new(name.to_string(), move |req: Request, next: Next| {
        let label = label.clone();
        let trace = trace.clone();
        async move {
            trace.lock().unwrap().push(label);
            next.run(req).await
        }
    })
}

fn noop(name: &str) -> Handler {
    Handler::new(name.to_string(), |req: Request, next: Next| async move { next.run(req).await })
}

fn names(handlers: &[Handler]) -> Vec<String> {
    handlers.iter().map(|h| h.name().to_string()).collect()
}

async fn get_status(router: Router, uri: &str) -> StatusCode {
    router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

// ═══ Global ═══

#[test]
fn test_globals_keep_registration_order() {
    let mw = MiddlewareRegistry::new();
    mw.register_global([noop("a"), noop("b")]);
    mw.register_global([noop("c")]);
    assert_eq!(names(&mw.globals()), ["a", "b", "c"]);
}

#[test]
fn test_globals_returns_copy() {
    let mw = MiddlewareRegistry::new();
    mw.register_global([noop("a")]);
    let snapshot = mw.globals();
    mw.register_global([noop("b")]);
    assert_eq!(names(&snapshot), ["a"]);
}

// ═══ Shared ═══

#[test]
fn test_register_shared_rejects_duplicate() {
    let mw = MiddlewareRegistry::new();
    mw.register_shared("auth", noop("auth")).unwrap();
    let err = mw.register_shared("auth", noop("auth2")).unwrap_err();
    assert_eq!(err, MiddlewareError::Duplicate("auth".into()));
}

#[test]
fn test_update_shared_requires_existing() {
    let mw = MiddlewareRegistry::new();
    let err = mw.update_shared("missing", noop("x")).unwrap_err();
    assert_eq!(err, MiddlewareError::NotFound("missing".into()));

    mw.register_shared("auth", noop("v1")).unwrap();
    mw.update_shared("auth", noop("v2")).unwrap();
    assert_eq!(mw.get_shared("auth").unwrap().name(), "v2");
}

#[test]
fn test_list_and_remove_shared() {
    let mw = MiddlewareRegistry::new();
    mw.register_shared("zeta", noop("z")).unwrap();
    mw.register_shared("alpha", noop("a")).unwrap();
    assert_eq!(mw.list_shared(), ["alpha", "zeta"]);
    assert!(mw.remove_shared("zeta"));
    assert!(!mw.remove_shared("zeta"));
    assert_eq!(mw.list_shared(), ["alpha"]);
}

#[test]
#[should_panic(expected = "not found")]
fn test_must_shared_panics_when_missing() {
    MiddlewareRegistry::new().must_shared("nope");
}

// ═══ Groups ═══

#[test]
fn test_group_from_shared_keeps_order() {
    let mw = MiddlewareRegistry::new();
    mw.register_shared("auth", noop("auth")).unwrap();
    mw.register_shared("audit", noop("audit")).unwrap();
    mw.create_group_from_shared("admin", &["audit", "auth"]).unwrap();
    assert_eq!(names(&mw.must_group("admin")), ["audit", "auth"]);
}

#[test]
fn test_group_from_missing_shared_fails() {
    let mw = MiddlewareRegistry::new();
    let err = mw.create_group_from_shared("admin", &["auth"]).unwrap_err();
    assert_eq!(err, MiddlewareError::NotFound("auth".into()));
    assert!(mw.get_group("admin").is_none());
}

#[test]
fn test_flatten_is_concatenation() {
    let mw = MiddlewareRegistry::new();
    mw.create_group("g1", [noop("a"), noop("b")]).unwrap();
    mw.create_group("g2", [noop("c")]).unwrap();
    mw.create_group("g3", [noop("d"), noop("e")]).unwrap();
    mw.create_group_from_groups("all", &["g1", "g2", "g3"]).unwrap();
    assert_eq!(names(&mw.must_group("all")), ["a", "b", "c", "d", "e"]);
}

#[test]
fn test_flatten_requires_sources() {
    let mw = MiddlewareRegistry::new();
    let err = mw.create_group_from_groups("empty", &[]).unwrap_err();
    assert!(matches!(err, MiddlewareError::InvalidMerge(_)));
}

#[test]
fn test_flatten_rejects_repeated_source() {
    let mw = MiddlewareRegistry::new();
    mw.create_group("a", [noop("x")]).unwrap();
    let err = mw.create_group_from_groups("twice", &["a", "a"]).unwrap_err();
    assert!(matches!(err, MiddlewareError::InvalidMerge(_)), "got {err:?}");
    assert!(mw.get_group("twice").is_none());
}

#[test]
fn test_flatten_missing_group() {
    let mw = MiddlewareRegistry::new();
    let err = mw.create_group_from_groups("all", &["ghost"]).unwrap_err();
    assert_eq!(err, MiddlewareError::NotFound("ghost".into()));
}

#[test]
fn test_direct_cycle_rejected() {
    let mw = MiddlewareRegistry::new();
    mw.create_group("a", [noop("x")]).unwrap();
    let err = mw.update_group_from_groups("a", &["a"]).unwrap_err();
    assert!(matches!(err, MiddlewareError::Cycle { .. }), "got {err:?}");
}

#[test]
fn test_indirect_cycle_rejected() {
    let mw = MiddlewareRegistry::new();
    mw.create_group("base", [noop("x")]).unwrap();
    mw.create_group_from_groups("a", &["base"]).unwrap();
    mw.create_group_from_groups("b", &["a"]).unwrap();
    let err = mw.update_group_from_groups("base", &["b"]).unwrap_err();
    match err {
        MiddlewareError::Cycle { group, path } => {
            assert_eq!(group, "base");
            assert!(path.contains("b -> a -> base"), "path was {path}");
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    // the failed update left the group untouched
    assert_eq!(names(&mw.must_group("base")), ["x"]);
}

#[test]
fn test_get_group_returns_copy() {
    let mw = MiddlewareRegistry::new();
    mw.create_group("g", [noop("a")]).unwrap();
    let copy = mw.get_group("g").unwrap();
    mw.append_to_group("g", [noop("b")]).unwrap();
    assert_eq!(names(&copy), ["a"]);
    assert_eq!(names(&mw.must_group("g")), ["a", "b"]);
}

#[test]
fn test_append_shared_and_update_group() {
    let mw = MiddlewareRegistry::new();
    mw.register_shared("auth", noop("auth")).unwrap();
    mw.create_group("g", [noop("a")]).unwrap();
    mw.append_shared_to_group("g", &["auth"]).unwrap();
    assert_eq!(names(&mw.must_group("g")), ["a", "auth"]);

    mw.update_group("g", [noop("z")]).unwrap();
    assert_eq!(names(&mw.must_group("g")), ["z"]);
    assert!(mw.update_group("nope", [noop("z")]).is_err());
}

#[test]
fn test_list_and_remove_groups() {
    let mw = MiddlewareRegistry::new();
    mw.create_group("b", Vec::new()).unwrap();
    mw.create_group("a", Vec::new()).unwrap();
    assert_eq!(mw.list_groups(), ["a", "b"]);
    assert!(mw.remove_group("a"));
    assert_eq!(mw.list_groups(), ["b"]);
}

#[test]
#[should_panic(expected = "not found")]
fn test_must_group_panics_when_missing() {
    MiddlewareRegistry::new().must_group("nope");
}

// ═══ Applying handlers ═══

#[tokio::test]
async fn test_apply_runs_in_slice_order() {
    let trace: Trace = Arc::default();
    let handlers = vec![
        tracing_handler("first", &trace),
        tracing_handler("second", &trace),
        tracing_handler("third", &trace),
    ];
    let router = apply(Router::new().route("/", get(|| async { "ok" })), &handlers);

    assert_eq!(get_status(router, "/").await, StatusCode::OK);
    assert_eq!(*trace.lock().unwrap(), ["first", "second", "third"]);
}

#[tokio::test]
async fn test_handler_can_short_circuit() {
    let deny = Handler::new("deny", |_req: Request, _next: Next| async { StatusCode::FORBIDDEN });
    let router = apply(Router::new().route("/", get(|| async { "ok" })), &[deny]);
    assert_eq!(get_status(router, "/").await, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_apply_route_skips_unmatched_paths() {
    let trace: Trace = Arc::default();
    let router = apply_route(
        Router::new().route("/", get(|| async { "ok" })),
        &[tracing_handler("only-matched", &trace)],
    );

    assert_eq!(get_status(router.clone(), "/missing").await, StatusCode::NOT_FOUND);
    assert!(trace.lock().unwrap().is_empty());

    assert_eq!(get_status(router, "/").await, StatusCode::OK);
    assert_eq!(*trace.lock().unwrap(), ["only-matched"]);
}
