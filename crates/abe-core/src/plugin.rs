//! Plugin system.
//!
//! A plugin has an explicit stable key, a display name, a version, an async
//! initializer and up to four lifecycle hooks. Hooks are discovered through
//! capability queries: a plugin that wants to run before routes are mounted
//! implements [`BeforeMountHook`] and returns `Some(self)` from
//! [`Plugin::before_mount_hook`].
//!
//! ```rust,ignore
//! struct Audit;
//!
//! #[async_trait]
//! impl Plugin for Audit {
//!     fn key(&self) -> &str { "acme.audit.Audit" }
//!     fn name(&self) -> &str { "audit" }
//!     fn version(&self) -> &str { "0.3.0" }
//!     async fn init(&self, _engine: &Engine) -> Result<(), AbeError> { Ok(()) }
//!     fn shutdown_hook(&self) -> Option<&dyn ShutdownHook> { Some(self) }
//! }
//!
//! #[async_trait]
//! impl ShutdownHook for Audit {
//!     async fn on_shutdown(&self, _engine: &Engine) -> Result<(), AbeError> { Ok(()) }
//! }
//!
//! engine.register_plugin(Arc::new(Audit)).await?;
//! ```
//!
//! Registration is only accepted before the before-mount phase starts.
//! `init` runs while the registration lock is held, so a plugin must not
//! register other plugins from its initializer.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use thiserror::Error;

use crate::config::{ConflictMode, HookFailureMode};
use crate::engine::Engine;
use crate::error::AbeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("duplicate plugin: {0}")]
    Duplicate(String),

    #[error("plugin {key} requires engine >= {required}, running {engine}")]
    Incompatible {
        key: String,
        required: String,
        engine: String,
    },

    #[error("plugin name '{name}' of {key} conflicts with {existing}")]
    NameConflict {
        name: String,
        key: String,
        existing: String,
    },

    #[error("plugin {0} registered after startup began")]
    Late(String),

    #[error("plugin {key} failed to initialize: {reason}")]
    Init { key: String, reason: String },

    #[error("plugin {plugin} failed in {phase}: {reason}")]
    Hook {
        phase: Phase,
        plugin: String,
        reason: String,
    },

    #[error("plugin {key} cannot enter {phase} from {state:?}")]
    PhaseOrder {
        key: String,
        phase: Phase,
        state: PluginState,
    },
}

/// Lifecycle phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeMount,
    AfterMount,
    BeforeServerStart,
    Shutdown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::BeforeMount => "before_mount",
            Phase::AfterMount => "after_mount",
            Phase::BeforeServerStart => "before_server_start",
            Phase::Shutdown => "shutdown",
        }
    }

    /// Startup phases run strictly in order. Shutdown may follow an aborted
    /// startup, so it only refuses plugins that are already shut down.
    fn allowed_from(self, state: PluginState) -> bool {
        match self {
            Phase::BeforeMount => state == PluginState::Registered,
            Phase::AfterMount => state == PluginState::BeforeMountDone,
            Phase::BeforeServerStart => state == PluginState::AfterMountDone,
            Phase::Shutdown => state != PluginState::ShutDown,
        }
    }

    fn completes(self) -> PluginState {
        match self {
            Phase::BeforeMount => PluginState::BeforeMountDone,
            Phase::AfterMount => PluginState::AfterMountDone,
            Phase::BeforeServerStart => PluginState::BeforeServerStartDone,
            Phase::Shutdown => PluginState::ShutDown,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Registered,
    BeforeMountDone,
    AfterMountDone,
    BeforeServerStartDone,
    ShutDown,
}

#[async_trait]
pub trait BeforeMountHook: Send + Sync {
    async fn on_before_mount(&self, engine: &Engine) -> Result<(), AbeError>;
}

#[async_trait]
pub trait AfterMountHook: Send + Sync {
    async fn on_after_mount(&self, engine: &Engine) -> Result<(), AbeError>;
}

#[async_trait]
pub trait BeforeServerStartHook: Send + Sync {
    async fn on_before_server_start(&self, engine: &Engine) -> Result<(), AbeError>;
}

#[async_trait]
pub trait ShutdownHook: Send + Sync {
    async fn on_shutdown(&self, engine: &Engine) -> Result<(), AbeError>;
}

/// An engine extension.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Stable identity, unique per plugin implementation
    /// (conventionally `<crate>.<module>.<Type>`).
    fn key(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Lowest engine version this plugin supports, as a semver version.
    fn min_engine_version(&self) -> Option<&str> {
        None
    }

    async fn init(&self, engine: &Engine) -> Result<(), AbeError>;

    fn before_mount_hook(&self) -> Option<&dyn BeforeMountHook> {
        None
    }

    fn after_mount_hook(&self) -> Option<&dyn AfterMountHook> {
        None
    }

    fn before_server_start_hook(&self) -> Option<&dyn BeforeServerStartHook> {
        None
    }

    fn shutdown_hook(&self) -> Option<&dyn ShutdownHook> {
        None
    }
}

/// Which hooks a plugin implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet {
    pub before_mount: bool,
    pub after_mount: bool,
    pub before_server_start: bool,
    pub shutdown: bool,
}

impl HookSet {
    fn of(plugin: &dyn Plugin) -> Self {
        HookSet {
            before_mount: plugin.before_mount_hook().is_some(),
            after_mount: plugin.after_mount_hook().is_some(),
            before_server_start: plugin.before_server_start_hook().is_some(),
            shutdown: plugin.shutdown_hook().is_some(),
        }
    }

    pub fn has(&self, phase: Phase) -> bool {
        match phase {
            Phase::BeforeMount => self.before_mount,
            Phase::AfterMount => self.after_mount,
            Phase::BeforeServerStart => self.before_server_start,
            Phase::Shutdown => self.shutdown,
        }
    }
}

/// Snapshot of a registration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub key: String,
    pub name: String,
    pub version: String,
    pub alias: Option<String>,
    pub hooks: HookSet,
    pub state: PluginState,
}

impl PluginInfo {
    /// Alias when one was assigned, otherwise the plugin's own name.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    info: PluginInfo,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    by_key: HashMap<String, usize>,
    by_alias: HashMap<String, usize>,
    by_name: HashMap<String, Vec<usize>>,
}

impl Registry {
    fn unique_alias(&self, base: &str) -> String {
        if !self.by_alias.contains_key(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.by_alias.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

/// Registers plugins and drives them through the lifecycle phases.
#[derive(Clone, Default)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    registration: tokio::sync::Mutex<()>,
    registry: RwLock<Registry>,
    started: AtomicBool,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and initialize a plugin.
    ///
    /// Disabled plugins are skipped and `Ok` is returned. Every rejection
    /// happens before `init` is called.
    pub async fn register(&self, engine: &Engine, plugin: Arc<dyn Plugin>) -> Result<(), AbeError> {
        let _serial = self.inner.registration.lock().await;

        let key = plugin.key().to_string();
        let name = plugin.name().to_string();
        let config = engine.config();

        let mut enabled = config.get_bool("plugins.enabled").unwrap_or(true);
        if let Some(per_key) = config.get_bool(&format!("plugins.enable.{key}")) {
            enabled = per_key;
        }
        if !enabled {
            tracing::info!(%name, %key, "plugin disabled, skipping registration");
            return Ok(());
        }

        if self.inner.started.load(Ordering::SeqCst) {
            return Err(PluginError::Late(key).into());
        }
        if self.inner.registry.read().by_key.contains_key(&key) {
            return Err(PluginError::Duplicate(key).into());
        }

        if let Some(min) = plugin.min_engine_version().map(str::trim).filter(|m| !m.is_empty()) {
            check_engine_version(config.get_bool("plugins.compat.strict").unwrap_or(false), &key, &name, min)?;
        }

        let mode = match config.get_str("plugins.conflict_mode").map(|m| m.to_ascii_lowercase()) {
            Some(m) if m == "error" => ConflictMode::Error,
            _ => ConflictMode::Alias,
        };
        let alias = {
            let registry = self.inner.registry.read();
            let configured = config
                .get_str(&format!("plugins.aliases.{key}"))
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
            let conflicts: Vec<String> = registry
                .by_name
                .get(&name)
                .map(|idx| idx.iter().map(|i| registry.entries[*i].info.key.clone()).collect())
                .unwrap_or_default();

            let alias = match configured {
                Some(alias) => Some(alias),
                None if conflicts.is_empty() => None,
                None if mode == ConflictMode::Error => {
                    tracing::error!(
                        %name,
                        %key,
                        conflict_with = ?conflicts,
                        "plugin name conflict, registration rejected; set plugins.conflict_mode=alias or plugins.aliases.<key>"
                    );
                    return Err(PluginError::NameConflict {
                        name,
                        key,
                        existing: conflicts.join(", "),
                    }
                    .into());
                }
                None => {
                    let generated = format!("{name}@{}", short_source(&key));
                    tracing::warn!(
                        %name,
                        %key,
                        alias = %generated,
                        conflict_with = ?conflicts,
                        "plugin name conflict, assigning alias"
                    );
                    Some(generated)
                }
            };
            alias.map(|a| {
                let unique = registry.unique_alias(&a);
                if unique != a {
                    tracing::warn!(original = %a, alias = %unique, %key, "plugin alias taken, adjusted");
                }
                unique
            })
        };

        if let Err(err) = plugin.init(engine).await {
            tracing::error!(%name, %key, error = %err, "plugin initialization failed");
            return Err(PluginError::Init {
                key,
                reason: err.to_string(),
            }
            .into());
        }

        let info = PluginInfo {
            key: key.clone(),
            name: name.clone(),
            version: plugin.version().to_string(),
            alias: alias.clone(),
            hooks: HookSet::of(plugin.as_ref()),
            state: PluginState::Registered,
        };
        tracing::info!(
            display = info.display_name(),
            %name,
            %key,
            version = %info.version,
            "plugin registered"
        );

        let mut registry = self.inner.registry.write();
        let index = registry.entries.len();
        registry.entries.push(Entry { plugin, info });
        registry.by_key.insert(key, index);
        registry.by_name.entry(name).or_default().push(index);
        if let Some(alias) = alias {
            registry.by_alias.insert(alias, index);
        }
        Ok(())
    }

    /// Snapshot of all registrations, in registration order.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.inner
            .registry
            .read()
            .entries
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner
            .registry
            .read()
            .entries
            .iter()
            .map(|e| e.plugin.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup_by_key(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        let registry = self.inner.registry.read();
        registry
            .by_key
            .get(key)
            .map(|i| registry.entries[*i].plugin.clone())
    }

    /// Alias first, then name. A name shared by several plugins is
    /// ambiguous and resolves to nothing.
    pub fn lookup_by_alias_or_name(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let registry = self.inner.registry.read();
        if let Some(i) = registry.by_alias.get(name) {
            return Some(registry.entries[*i].plugin.clone());
        }
        match registry.by_name.get(name).map(Vec::as_slice) {
            Some([i]) => Some(registry.entries[*i].plugin.clone()),
            _ => None,
        }
    }

    pub fn display_name(&self, key: &str) -> Option<String> {
        let registry = self.inner.registry.read();
        registry
            .by_key
            .get(key)
            .map(|i| registry.entries[*i].info.display_name().to_string())
    }

    pub fn info(&self, key: &str) -> Option<PluginInfo> {
        let registry = self.inner.registry.read();
        registry.by_key.get(key).map(|i| registry.entries[*i].info.clone())
    }

    pub async fn before_mount(&self, engine: &Engine) -> Result<(), AbeError> {
        self.dispatch(engine, Phase::BeforeMount).await
    }

    pub async fn after_mount(&self, engine: &Engine) -> Result<(), AbeError> {
        self.dispatch(engine, Phase::AfterMount).await
    }

    pub async fn before_server_start(&self, engine: &Engine) -> Result<(), AbeError> {
        self.dispatch(engine, Phase::BeforeServerStart).await
    }

    /// Never fails because of a hook; failures and panics are logged.
    pub async fn shutdown(&self, engine: &Engine) -> Result<(), AbeError> {
        self.dispatch(engine, Phase::Shutdown).await
    }

    /// Run `phase` for every plugin in registration order.
    pub async fn dispatch(&self, engine: &Engine, phase: Phase) -> Result<(), AbeError> {
        self.inner.started.store(true, Ordering::SeqCst);

        let snapshot: Vec<(Arc<dyn Plugin>, PluginInfo)> = {
            let registry = self.inner.registry.read();
            for entry in &registry.entries {
                if !phase.allowed_from(entry.info.state) {
                    return Err(PluginError::PhaseOrder {
                        key: entry.info.key.clone(),
                        phase,
                        state: entry.info.state,
                    }
                    .into());
                }
            }
            registry
                .entries
                .iter()
                .map(|e| (e.plugin.clone(), e.info.clone()))
                .collect()
        };

        let mode = match engine
            .config()
            .get_str("plugins.hook_failure_mode")
            .map(|m| m.to_ascii_lowercase())
        {
            Some(m) if m == "error" => HookFailureMode::Error,
            _ => HookFailureMode::Warn,
        };
        let abort_on_failure = mode == HookFailureMode::Error && phase != Phase::Shutdown;

        for (plugin, info) in snapshot {
            let shown = info.display_name().to_string();
            if info.hooks.has(phase) {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(run_hook(plugin.as_ref(), engine, phase))
                    .catch_unwind()
                    .await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
                };
                if let Some(reason) = failure {
                    if abort_on_failure {
                        tracing::error!(phase = %phase, display = %shown, key = %info.key, %reason, "plugin hook failed, aborting");
                        self.set_state(&info.key, phase.completes());
                        return Err(PluginError::Hook {
                            phase,
                            plugin: shown,
                            reason,
                        }
                        .into());
                    }
                    if phase == Phase::Shutdown {
                        tracing::error!(phase = %phase, display = %shown, key = %info.key, %reason, "plugin hook failed");
                    } else {
                        tracing::warn!(phase = %phase, display = %shown, key = %info.key, %reason, "plugin hook failed");
                    }
                }
                tracing::info!(
                    phase = %phase,
                    display = %shown,
                    key = %info.key,
                    elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "plugin hook finished"
                );
            }
            self.set_state(&info.key, phase.completes());
        }
        Ok(())
    }

    fn set_state(&self, key: &str, state: PluginState) {
        let mut registry = self.inner.registry.write();
        if let Some(i) = registry.by_key.get(key).copied() {
            registry.entries[i].info.state = state;
        }
    }
}

async fn run_hook(plugin: &dyn Plugin, engine: &Engine, phase: Phase) -> Result<(), AbeError> {
    match phase {
        Phase::BeforeMount => match plugin.before_mount_hook() {
            Some(hook) => hook.on_before_mount(engine).await,
            None => Ok(()),
        },
        Phase::AfterMount => match plugin.after_mount_hook() {
            Some(hook) => hook.on_after_mount(engine).await,
            None => Ok(()),
        },
        Phase::BeforeServerStart => match plugin.before_server_start_hook() {
            Some(hook) => hook.on_before_server_start(engine).await,
            None => Ok(()),
        },
        Phase::Shutdown => match plugin.shutdown_hook() {
            Some(hook) => hook.on_shutdown(engine).await,
            None => Ok(()),
        },
    }
}

fn check_engine_version(strict: bool, key: &str, name: &str, min: &str) -> Result<(), AbeError> {
    let current = semver::Version::parse(crate::VERSION);
    let requirement = semver::VersionReq::parse(&format!(">={min}"));
    match (current, requirement) {
        (Ok(current), Ok(requirement)) => {
            if requirement.matches(&current) {
                return Ok(());
            }
            if strict {
                tracing::error!(%name, %key, engine = crate::VERSION, required = %min, "plugin incompatible with engine, rejected");
                return Err(PluginError::Incompatible {
                    key: key.to_string(),
                    required: min.to_string(),
                    engine: crate::VERSION.to_string(),
                }
                .into());
            }
            tracing::warn!(%name, %key, engine = crate::VERSION, required = %min, "plugin incompatible with engine, registering anyway");
            Ok(())
        }
        (current, requirement) => {
            tracing::warn!(
                %name,
                %key,
                engine = crate::VERSION,
                required = %min,
                engine_error = ?current.err(),
                requirement_error = ?requirement.err(),
                "could not parse plugin version constraint, registering anyway"
            );
            Ok(())
        }
    }
}

/// `pkgB.X` → `pkgB`, `github.com/acme/audit.Plugin` → `audit`.
pub fn short_source(key: &str) -> &str {
    match key.rfind('.') {
        Some(idx) if idx > 0 => {
            let package = &key[..idx];
            if let Some(i) = package.rfind('/') {
                &package[i + 1..]
            } else if let Some(i) = package.rfind('.') {
                &package[i + 1..]
            } else {
                package
            }
        }
        _ => key,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}
