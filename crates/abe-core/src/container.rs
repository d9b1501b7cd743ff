//! Request-scoped dependency container.
//!
//! Every request routed through the engine gets its own [`Container`]. The
//! engine's shared services are registered as pre-built values, together
//! with the request's [`RequestMeta`]. Application services are registered
//! lazily with [`Container::provide`] and built at most once per request.
//!
//! ```rust,ignore
//! struct CreateOrder { db: DatabaseConnection }
//!
//! impl Injectable for CreateOrder {
//!     fn inject(c: &Container) -> Result<Self, AbeError> {
//!         Ok(CreateOrder { db: c.resolve()? })
//!     }
//! }
//!
//! #[async_trait]
//! impl UseCase for CreateOrder {
//!     type Input = NewOrder;
//!     type Output = Order;
//!
//!     async fn handle(&self, ctx: &RequestContext, input: NewOrder) -> Result<Order, AbeError> {
//!         ...
//!     }
//! }
//!
//! async fn create(ctx: RequestContext, Json(body): Json<NewOrder>) -> Result<Json<Order>, AbeError> {
//!     Ok(Json(invoke::<CreateOrder>(&ctx, body).await?))
//! }
//! ```

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::{Mutex, RwLock};
use sea_orm::DatabaseConnection;

use crate::auth::AuthManager;
use crate::auth::enforcer::Enforcer;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::AbeError;
use crate::events::EventBus;
use crate::logging::Logger;
use crate::pool::WorkerPool;
use crate::request::{ErrorSink, RequestMeta};
use crate::validation::Validator;

type AnyArc = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Container) -> Result<AnyArc, AbeError> + Send + Sync>;
type Cleanup = Box<dyn FnOnce() + Send>;

/// Type-indexed registry of singletons.
#[derive(Default)]
pub struct Container {
    values: RwLock<HashMap<TypeId, AnyArc>>,
    factories: RwLock<HashMap<TypeId, Factory>>,
    resolving: Mutex<Vec<(TypeId, ThreadId)>>,
    cleanups: Mutex<Vec<Cleanup>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("values", &self.values.read().len())
            .field("factories", &self.factories.read().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container pre-populated with the engine's shared services and the
    /// request identity.
    pub fn for_request(engine: &Engine, meta: RequestMeta) -> Self {
        let container = Container::new();
        container.provide_value(engine.clone());
        container.provide_value(engine.config().clone());
        container.provide_value(engine.logger().for_request(&meta.request_id));
        container.provide_value(engine.db().clone());
        container.provide_value(engine.events().clone());
        container.provide_value(engine.pool().clone());
        container.provide_value(engine.enforcer().clone());
        container.provide_value(engine.auth().clone());
        container.provide_value(engine.validator().clone());
        container.provide_value(meta);
        container
    }

    /// Register a pre-built value. Replaces any earlier registration of `T`.
    pub fn provide_value<T: Send + Sync + 'static>(&self, value: T) {
        self.provide_arc(Arc::new(value));
    }

    pub fn provide_arc<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.values.write().insert(TypeId::of::<T>(), value);
    }

    /// Register a factory; the value is built on first resolution and then
    /// reused for the lifetime of this container.
    pub fn provide<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, AbeError> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |c| factory(c).map(|v| Arc::new(v) as AnyArc));
        let id = TypeId::of::<T>();
        self.values.write().remove(&id);
        self.factories.write().insert(id, factory);
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.values.read().contains_key(&id) || self.factories.read().contains_key(&id)
    }

    /// Resolve `T`, building it from its factory if needed.
    ///
    /// Every call on the same container returns the same `Arc`.
    pub fn resolve_arc<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, AbeError> {
        let id = TypeId::of::<T>();
        if let Some(value) = self.values.read().get(&id).cloned() {
            return downcast::<T>(value);
        }

        let factory = self
            .factories
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| AbeError::Dependency(format!("{} is not registered", type_name::<T>())))?;

        let key = (id, std::thread::current().id());
        {
            let mut resolving = self.resolving.lock();
            if resolving.contains(&key) {
                return Err(AbeError::Dependency(format!(
                    "dependency cycle while resolving {}",
                    type_name::<T>()
                )));
            }
            resolving.push(key);
        }
        let built = factory(self);
        self.resolving.lock().retain(|k| *k != key);

        let value = built.map_err(|e| match e {
            AbeError::Dependency(msg) => {
                AbeError::Dependency(format!("{}: {msg}", type_name::<T>()))
            }
            other => other,
        })?;
        // a concurrent resolver may have stored first; keep that one
        let stored = self.values.write().entry(id).or_insert(value).clone();
        downcast::<T>(stored)
    }

    /// Resolve a clone of `T`.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Result<T, AbeError> {
        self.resolve_arc::<T>().map(|v| (*v).clone())
    }

    /// Register a callback run by [`shutdown`](Self::shutdown). Callbacks
    /// run in reverse registration order. After shutdown the callback runs
    /// immediately.
    pub fn on_shutdown<F: FnOnce() + Send + 'static>(&self, cleanup: F) {
        if self.is_shut_down() {
            run_cleanup(Box::new(cleanup));
            return;
        }
        self.cleanups.lock().push(Box::new(cleanup));
    }

    /// Run cleanup callbacks and drop every held value.
    ///
    /// Returns `false` when the container was already shut down.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups.into_iter().rev() {
            run_cleanup(cleanup);
        }
        self.values.write().clear();
        self.factories.write().clear();
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The container attached to a request by the container middleware.
    pub fn from_extensions(extensions: &axum::http::Extensions) -> Result<Arc<Container>, AbeError> {
        extensions.get::<Arc<Container>>().cloned().ok_or_else(|| {
            AbeError::Internal("request container missing: container middleware not installed".into())
        })
    }
}

fn downcast<T: Send + Sync + 'static>(value: AnyArc) -> Result<Arc<T>, AbeError> {
    value.downcast::<T>().map_err(|_| {
        AbeError::Dependency(format!("stored value is not a {}", type_name::<T>()))
    })
}

fn run_cleanup(cleanup: Cleanup) {
    if std::panic::catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
        tracing::error!("request container cleanup panicked");
    }
}

struct ShutdownGuard(Arc<Container>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Allocates the per-request container and tears it down once the rest of
/// the chain has produced a response (or unwound).
pub async fn container_middleware(
    State(engine): State<Engine>,
    mut req: Request,
    next: Next,
) -> Response {
    let meta = req
        .extensions()
        .get::<RequestMeta>()
        .cloned()
        .unwrap_or_else(|| RequestMeta::new(uuid::Uuid::new_v4().to_string()));
    let container = Arc::new(Container::for_request(&engine, meta));
    req.extensions_mut().insert(container.clone());

    let _guard = ShutdownGuard(container);
    next.run(req).await
}

// ═══════════════════════════════════════════════════════════════
// Extractors
// ═══════════════════════════════════════════════════════════════

/// Handle on the current request's container and error sink.
#[derive(Clone, Debug)]
pub struct RequestContext {
    container: Arc<Container>,
    errors: ErrorSink,
}

impl RequestContext {
    pub fn new(container: Arc<Container>, errors: ErrorSink) -> Self {
        RequestContext { container, errors }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Result<T, AbeError> {
        self.container.resolve()
    }

    pub fn resolve_arc<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, AbeError> {
        self.container.resolve_arc()
    }

    pub fn meta(&self) -> Result<RequestMeta, AbeError> {
        self.container.resolve()
    }

    /// Forward an error to the error-handler middleware.
    pub fn report(&self, err: AbeError) {
        self.errors.report(err);
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = AbeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let container = Container::from_extensions(&parts.extensions)?;
        let errors = parts.extensions.get::<ErrorSink>().cloned().unwrap_or_default();
        Ok(RequestContext { container, errors })
    }
}

/// Services constructible from a container.
pub trait Injectable: Sized + Send + Sync + 'static {
    fn inject(container: &Container) -> Result<Self, AbeError>;
}

macro_rules! injectable_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Injectable for $ty {
                fn inject(container: &Container) -> Result<Self, AbeError> {
                    container.resolve()
                }
            }
        )*
    };
}

injectable_value!(
    Engine,
    Config,
    Logger,
    DatabaseConnection,
    Arc<dyn EventBus>,
    WorkerPool,
    Enforcer,
    AuthManager,
    Validator,
    RequestMeta,
);

/// Extractor resolving an [`Injectable`] from the request container.
pub struct Inject<T>(pub T);

impl<S, T> FromRequestParts<S> for Inject<T>
where
    S: Send + Sync,
    T: Injectable,
{
    type Rejection = AbeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let container = Container::from_extensions(&parts.extensions)?;
        T::inject(&container).map(Inject)
    }
}

/// A single-operation service: resolve, handle, return.
#[async_trait]
pub trait UseCase: Injectable {
    type Input: Send + 'static;
    type Output: Send + 'static;

    async fn handle(&self, ctx: &RequestContext, input: Self::Input) -> Result<Self::Output, AbeError>;
}

/// Resolve `U` from the request container and run it.
///
/// Failures, including resolution failures, are reported to the request's
/// error sink before being returned.
pub async fn invoke<U: UseCase>(ctx: &RequestContext, input: U::Input) -> Result<U::Output, AbeError> {
    let result = match U::inject(ctx.container()) {
        Ok(use_case) => use_case.handle(ctx, input).await,
        Err(err) => {
            tracing::error!(use_case = type_name::<U>(), error = %err, "use case resolution failed");
            Err(err)
        }
    };
    if let Err(err) = &result {
        ctx.report(err.clone());
    }
    result
}
