//! The [`Engine`] facade.
//!
//! An engine owns every shared service of the application and is cloned
//! cheaply into handlers, plugins and controllers.
//!
//! ```rust,ignore
//! let engine = Engine::bootstrap().await?;
//! engine.register_plugin(Arc::new(Audit)).await?;
//! engine.add_controller([controller::provider(UserController)]);
//! engine.run(RunOptions::new().base_path("/api")).await?;
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::routing::get;
use parking_lot::RwLock;
use sea_orm::DatabaseConnection;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use utoipa::openapi::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::auth::enforcer::Enforcer;
use crate::auth::{self, AuthManager, UserClaims};
use crate::config::{Config, PoolConfig};
use crate::container::container_middleware;
use crate::controller::ControllerProvider;
use crate::db;
use crate::dynamic_config::DynamicConfig;
use crate::error::AbeError;
use crate::events::{EventBus, InMemoryEventBus};
use crate::i18n::{Bundle, i18n_middleware};
use crate::logging::{self, Logger};
use crate::middleware::access_log::{access_log, panic_response};
use crate::middleware::cors::cors_layer;
use crate::middleware::error_handler::error_handler;
use crate::middleware::{Handler, MiddlewareRegistry, apply};
use crate::permissions::PermissionMappings;
use crate::plugin::{Plugin, PluginManager};
use crate::pool::{FnPool, WorkerPool};
use crate::request::{REQUEST_ID_HEADER, request_meta};
use crate::scheduler::{Job, JobId, Scheduler};
use crate::validation::Validator;

/// Process-wide application handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    logger: Logger,
    db: DatabaseConnection,
    scheduler: Scheduler,
    events: Arc<dyn EventBus>,
    pool: WorkerPool,
    enforcer: Enforcer,
    auth: AuthManager,
    validator: Validator,
    middlewares: MiddlewareRegistry,
    i18n: Option<Arc<Bundle>>,
    plugins: PluginManager,
    dynamic_config: DynamicConfig,
    permissions: PermissionMappings,
    controllers: RwLock<Vec<ControllerProvider>>,
    mounted: AtomicBool,
    base_path: RwLock<String>,
    api_docs: RwLock<Option<OpenApi>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("app", &self.inner.config.settings().app.name)
            .field("plugins", &self.inner.plugins.len())
            .field("controllers", &self.inner.controllers.read().len())
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// Configures optional parts of engine construction.
pub struct EngineBuilder {
    config: Config,
    database: Option<DatabaseConnection>,
    events: Option<Arc<dyn EventBus>>,
    init_logging: bool,
}

impl EngineBuilder {
    /// Use an existing connection instead of connecting from `database.*`.
    pub fn database(mut self, db: DatabaseConnection) -> Self {
        self.database = Some(db);
        self
    }

    /// Replace the in-memory event bus.
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Leave the global tracing subscriber alone.
    pub fn skip_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    pub async fn build(self) -> Result<Engine, AbeError> {
        let config = self.config;
        let settings = config.settings().clone();

        if self.init_logging && !logging::init(&settings)? {
            tracing::debug!("tracing subscriber already installed, keeping it");
        }
        let logger = Logger::new(&settings.app.name);

        let db = match self.database {
            Some(db) => {
                if settings.database.auto_migrate {
                    db::migrate(&db).await?;
                }
                db
            }
            None => db::connect(&settings)
                .await?
                .unwrap_or(DatabaseConnection::Disconnected),
        };
        let connected = !matches!(db, DatabaseConnection::Disconnected);

        let enforcer = Enforcer::new(connected.then(|| db.clone()));
        enforcer.load_policy().await?;
        let auth = AuthManager::new(settings.auth.clone(), enforcer.clone());

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InMemoryEventBus::new(settings.events.buffer)));
        let pool = WorkerPool::new(&settings.worker_pool);
        let validator = Validator::new(&settings.validator);
        let i18n = settings
            .i18n
            .enabled
            .then(|| Arc::new(Bundle::load(&settings.i18n)));

        let dynamic_config = DynamicConfig::new(db.clone(), config.clone());
        let permissions = PermissionMappings::new();
        if connected {
            if let Err(err) = dynamic_config.load_all().await {
                tracing::warn!(error = %err, "failed to load dynamic config");
            }
            if let Err(err) = permissions.load(&db).await {
                tracing::warn!(error = %err, "failed to load api permission mappings");
            }
        }

        tracing::info!(
            app = %settings.app.name,
            version = crate::VERSION,
            database = connected,
            i18n = i18n.is_some(),
            pool_size = pool.cap(),
            "engine initialized"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                logger,
                db,
                scheduler: Scheduler::new(),
                events,
                pool,
                enforcer,
                auth,
                validator,
                middlewares: MiddlewareRegistry::new(),
                i18n,
                plugins: PluginManager::new(),
                dynamic_config,
                permissions,
                controllers: RwLock::new(Vec::new()),
                mounted: AtomicBool::new(false),
                base_path: RwLock::new(String::new()),
                api_docs: RwLock::new(None),
            }),
        })
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            database: None,
            events: None,
            init_logging: true,
        }
    }

    pub async fn new(config: Config) -> Result<Self, AbeError> {
        Self::builder(config).build().await
    }

    /// Load configuration from the process and build an engine.
    pub async fn bootstrap() -> Result<Self, AbeError> {
        let config = Config::load()?;
        Self::new(config).await
    }

    // ═══ Accessors ═══

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// `DatabaseConnection::Disconnected` when no database is configured.
    pub fn db(&self) -> &DatabaseConnection {
        &self.inner.db
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.inner.events
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn enforcer(&self) -> &Enforcer {
        &self.inner.enforcer
    }

    pub fn auth(&self) -> &AuthManager {
        &self.inner.auth
    }

    pub fn validator(&self) -> &Validator {
        &self.inner.validator
    }

    pub fn middlewares(&self) -> &MiddlewareRegistry {
        &self.inner.middlewares
    }

    /// Message catalogs; `None` unless `i18n.enabled`.
    pub fn i18n(&self) -> Option<&Arc<Bundle>> {
        self.inner.i18n.as_ref()
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.inner.plugins
    }

    pub fn dynamic_config(&self) -> &DynamicConfig {
        &self.inner.dynamic_config
    }

    pub fn permissions(&self) -> &PermissionMappings {
        &self.inner.permissions
    }

    // ═══ Plugins & controllers ═══

    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), AbeError> {
        self.inner.plugins.register(self, plugin).await
    }

    /// Queue controllers for mounting, in call order.
    pub fn add_controller(&self, providers: impl IntoIterator<Item = ControllerProvider>) {
        let providers: Vec<ControllerProvider> = providers.into_iter().collect();
        if providers.is_empty() {
            return;
        }
        if self.is_mounted() {
            tracing::warn!(count = providers.len(), "controllers added after mount are ignored");
        }
        self.inner.controllers.write().extend(providers);
    }

    pub fn base_path(&self) -> String {
        self.inner.base_path.read().clone()
    }

    /// Prefix for every mounted route. Normalized to `/segment` form; empty
    /// or `/` mounts at the root.
    pub fn set_base_path(&self, base_path: &str) {
        let trimmed = base_path.trim().trim_end_matches('/');
        let normalized = if trimmed.is_empty() {
            String::new()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        *self.inner.base_path.write() = normalized;
    }

    /// OpenAPI document served when `swagger.enabled`.
    pub fn set_api_docs(&self, openapi: OpenApi) {
        *self.inner.api_docs.write() = Some(openapi);
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::SeqCst)
    }

    /// Build the application router from the registered controllers.
    ///
    /// Only the first call builds anything; later calls return `None`.
    /// A controller that panics while registering is logged and skipped.
    pub fn mount(&self) -> Option<Router> {
        if self.inner.mounted.swap(true, Ordering::SeqCst) {
            return None;
        }
        let providers = self.inner.controllers.read().clone();
        let base_path = self.base_path();
        tracing::info!(base_path = %base_path, count = providers.len(), "mounting controllers");

        let mut group: Router<Engine> = Router::new();
        for (index, provider) in providers.iter().enumerate() {
            let attempt = group.clone();
            let registered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let controller = provider(self);
                controller.register_routes(attempt, &self.inner.middlewares, self)
            }));
            match registered {
                Ok(router) => group = router,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<String>()
                        .cloned()
                        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(index, %base_path, panic = %detail, "controller route registration panicked");
                }
            }
        }

        if self.inner.config.settings().swagger.enabled {
            group = self.mount_docs(group);
        }
        group = apply(group, &self.inner.middlewares.globals());

        let router = if base_path.is_empty() {
            group
        } else {
            Router::new().nest(&base_path, group)
        };

        let settings = self.inner.config.settings();
        let request_id = axum::http::HeaderName::from_static(REQUEST_ID_HEADER);
        let mut router = router
            .layer(axum::middleware::from_fn_with_state(self.clone(), container_middleware))
            .layer(axum::middleware::from_fn_with_state(self.clone(), error_handler))
            .layer(axum::middleware::from_fn_with_state(self.clone(), i18n_middleware))
            .layer(axum::middleware::from_fn(access_log))
            .layer(axum::middleware::from_fn(request_meta))
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(PropagateRequestIdLayer::new(request_id.clone()))
            .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid));
        if settings.server.cors.enabled {
            router = router.layer(cors_layer(&settings.server.cors));
        }

        tracing::info!(base_path = %base_path, "controllers mounted");
        Some(router.with_state(self.clone()))
    }

    fn mount_docs(&self, group: Router<Engine>) -> Router<Engine> {
        let swagger = &self.inner.config.settings().swagger;
        let mut openapi = self.inner.api_docs.read().clone().unwrap_or_else(|| {
            let app = &self.inner.config.settings().app.name;
            OpenApi::new(
                utoipa::openapi::Info::new(app.clone(), crate::VERSION.to_string()),
                utoipa::openapi::Paths::new(),
            )
        });
        add_bearer_scheme(&mut openapi);

        let spec = openapi.clone();
        tracing::info!(path = %swagger.path, url = %swagger.url, "api docs enabled");
        group.merge(Scalar::with_url(swagger.path.clone(), openapi)).route(
            &swagger.url,
            get(move || {
                let spec = spec.clone();
                async move { axum::Json(spec) }
            }),
        )
    }

    // ═══ Jobs & tasks ═══

    pub fn add_job<J: Job>(&self, spec: &str, job: J) -> Result<JobId, AbeError> {
        Ok(self.inner.scheduler.add_job(spec, job)?)
    }

    pub fn add_fn<F, Fut>(&self, spec: &str, f: F) -> Result<JobId, AbeError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AbeError>> + Send + 'static,
    {
        Ok(self.inner.scheduler.add_fn(spec, f)?)
    }

    /// Run `task` on the worker pool.
    pub async fn submit_task<F>(&self, task: F) -> Result<(), AbeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Ok(self.inner.pool.submit(task).await?)
    }

    /// A pool bound to one function, sized `size` and otherwise configured
    /// like the engine pool.
    pub fn new_fn_pool<T, F, Fut>(&self, size: usize, func: F) -> FnPool<T>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = PoolConfig {
            size,
            ..self.inner.config.settings().worker_pool.clone()
        };
        FnPool::new(&config, func)
    }

    // ═══ Authorization ═══

    pub fn enforce(&self, sub: &str, obj: &str, act: &str) -> Result<bool, AbeError> {
        self.inner.enforcer.enforce(sub, obj, act)
    }

    pub fn generate_token(&self, claims: &UserClaims) -> Result<String, AbeError> {
        self.inner.auth.generate_token(claims)
    }

    pub fn parse_token(&self, token: &str) -> Result<UserClaims, AbeError> {
        self.inner.auth.parse_token(token)
    }

    /// Handler allowing callers whose user subject may `act` on `obj`.
    pub fn authorize_endpoint(&self, obj: &str, act: &str) -> Handler {
        auth::authorize_endpoint(self.inner.enforcer.clone(), obj, act)
    }

    /// Handler allowing callers whose primary role may `act` on `obj`.
    pub fn role_authorize_endpoint(&self, obj: &str, act: &str) -> Handler {
        auth::role_authorize_endpoint(self.inner.enforcer.clone(), obj, act)
    }
}

fn add_bearer_scheme(openapi: &mut OpenApi) {
    use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};

    openapi
        .components
        .get_or_insert_with(utoipa::openapi::Components::new)
        .add_security_scheme("bearer_auth", SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)));
}
