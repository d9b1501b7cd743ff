//! Layered configuration.
//!
//! Sources are merged in this order, later ones winning:
//!
//! 1. built-in defaults ([`Settings::default`])
//! 2. `config.yaml` from the first search path that has one
//! 3. environment variables `ABE_<PATH>` (`server.shutdown_timeout` is read
//!    from `ABE_SERVER_SHUTDOWN_TIMEOUT`)
//! 4. command-line flags (`--server-address`, `--logger-level`, ...)
//!
//! Search paths are `/etc/<dir>/`, `~/.<dir>/`, `./configs/` and `./`, where
//! `<dir>` is `--config-dir` (default `abe`). A `.env` file found in the same
//! paths is loaded into the process environment before step 3.
//!
//! ```rust,no_run
//! use abe_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("listening on {}", config.settings().server.address);
//! # Ok::<(), abe_core::config::ConfigError>(())
//! ```

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix of every environment variable the loader reads.
pub const ENV_PREFIX: &str = "ABE";

/// Default directory name used in the config search paths.
pub const DEFAULT_CONFIG_DIR: &str = "abe";

const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════════
// Typed sections
// ═══════════════════════════════════════════════════════════════

/// Typed view of the whole configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub logger: LoggerConfig,
    pub database: DatabaseConfig,
    pub worker_pool: PoolConfig,
    pub events: EventsConfig,
    pub validator: ValidatorConfig,
    pub i18n: I18nConfig,
    pub plugins: PluginsConfig,
    pub auth: AuthConfig,
    pub swagger: SwaggerConfig,
    pub operation_log: OperationLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            name: "abe".to_string(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `host:port`.
    pub address: String,
    /// `debug`, `release` or `test`.
    pub mode: String,
    /// Upper bound for draining in-flight requests on shutdown.
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "127.0.0.1:8080".to_string(),
            mode: "release".to_string(),
            shutdown_timeout: Duration::from_secs(5),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Exact origins, `*`, or `*.example.com` wildcards.
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds.
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            enabled: false,
            allow_origins: vec!["*".to_string()],
            allow_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allow_headers: ["Origin", "Content-Type", "Accept", "Authorization", "X-Request-ID"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            expose_headers: vec!["X-Request-ID".to_string()],
            allow_credentials: false,
            max_age: 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Console,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub format: LogFormat,
    #[serde(rename = "type")]
    pub output: LogOutput,
    pub file: LogFileConfig,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
            output: LogOutput::Console,
            file: LogFileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileConfig {
    /// Defaults to `~/<app.name>/logs/app.log`.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the discrete fields.
    pub url: Option<String>,
    /// `sqlite`, `postgres` or `mysql`. Empty disables the datastore.
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub max_connections: u32,
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: None,
            kind: String::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            max_connections: 10,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Connection URL derived from the config, or `None` when no datastore
    /// is configured.
    pub fn connection_url(&self) -> Result<Option<String>, ConfigError> {
        if let Some(url) = self.url.as_ref().filter(|u| !u.trim().is_empty()) {
            return Ok(Some(url.clone()));
        }
        let url = match self.kind.to_ascii_lowercase().as_str() {
            "" => return Ok(None),
            "sqlite" => {
                if self.dbname.is_empty() || self.dbname == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite://{}?mode=rwc", self.dbname)
                }
            }
            "postgres" | "postgresql" => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user,
                self.password,
                self.host,
                if self.port == 0 { 5432 } else { self.port },
                self.dbname
            ),
            "mysql" => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user,
                self.password,
                self.host,
                if self.port == 0 { 3306 } else { self.port },
                self.dbname
            ),
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported database.type '{other}'"
                )));
            }
        };
        Ok(Some(url))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of concurrently running tasks.
    pub size: usize,
    /// Maximum number of callers allowed to wait for a slot.
    pub max_blocking_tasks: usize,
    /// Fail immediately instead of waiting when the pool is full.
    pub nonblocking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size: 50_000,
            max_blocking_tasks: 10_000,
            nonblocking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-topic channel capacity.
    pub buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig { buffer: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// `zh` or `en`.
    pub locale: String,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            locale: "zh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct I18nConfig {
    pub enabled: bool,
    pub default_language: String,
    /// Directories or files holding `active.<lang>.yaml` message files.
    pub paths: Vec<String>,
    pub lang_query_key: String,
    pub lang_header: String,
}

impl Default for I18nConfig {
    fn default() -> Self {
        I18nConfig {
            enabled: false,
            default_language: "zh".to_string(),
            paths: Vec::new(),
            lang_query_key: "lang".to_string(),
            lang_header: "Accept-Language".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    #[default]
    Alias,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookFailureMode {
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Global switch; per-key overrides in `enable` win over it.
    pub enabled: bool,
    pub enable: HashMap<String, bool>,
    /// Display alias forced for a plugin key.
    pub aliases: HashMap<String, String>,
    pub conflict_mode: ConflictMode,
    pub hook_failure_mode: HookFailureMode,
    pub compat: PluginCompatConfig,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        PluginsConfig {
            enabled: true,
            enable: HashMap::new(),
            aliases: HashMap::new(),
            conflict_mode: ConflictMode::Alias,
            hook_failure_mode: HookFailureMode::Warn,
            compat: PluginCompatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginCompatConfig {
    /// Reject plugins whose minimum engine version is not met.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(with = "duration_str")]
    pub token_expiry: Duration,
    pub issuer: String,
    pub audience: Vec<String>,
    pub clock_skew_seconds: u64,
    /// Let requests through when no API permission mapping matches.
    pub allow_unmapped: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            jwt_secret: String::new(),
            token_expiry: Duration::from_secs(24 * 3600),
            issuer: String::new(),
            audience: Vec::new(),
            clock_skew_seconds: 0,
            allow_unmapped: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwaggerConfig {
    pub enabled: bool,
    /// Path of the interactive UI.
    pub path: String,
    /// Path the OpenAPI document is served from.
    pub url: String,
}

impl Default for SwaggerConfig {
    fn default() -> Self {
        SwaggerConfig {
            enabled: false,
            path: "/swagger".to_string(),
            url: "/swagger/openapi.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationLogConfig {
    pub max_body_size: usize,
    pub sensitive_fields: Vec<String>,
    pub log_high_risk: bool,
}

impl Default for OperationLogConfig {
    fn default() -> Self {
        OperationLogConfig {
            max_body_size: 10 * 1024,
            sensitive_fields: ["password", "old_password", "new_password", "token", "secret"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
            log_high_risk: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Config handle
// ═══════════════════════════════════════════════════════════════

/// Shared configuration handle.
///
/// [`settings`](Self::settings) is the typed snapshot taken at load time.
/// The raw accessors (`get_*`, [`set`](Self::set)) read and write the live
/// tree, which is where runtime overrides such as dynamic config land.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    settings: Settings,
    tree: RwLock<Value>,
    source: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("app", &self.inner.settings.app.name)
            .field("source", &self.inner.source)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_settings(Settings::default())
    }
}

impl Config {
    /// Load configuration from the process: flags, environment, `.env` and
    /// `config.yaml`.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Build a config directly from typed settings, bypassing every source.
    pub fn from_settings(settings: Settings) -> Self {
        let tree = serde_json::to_value(&settings).unwrap_or(Value::Object(Map::new()));
        Config {
            inner: Arc::new(ConfigInner {
                settings,
                tree: RwLock::new(tree),
                source: None,
            }),
        }
    }

    /// Defaults overlaid with the given YAML document. No environment,
    /// flags or files are consulted.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        ConfigLoader::new()
            .args(["abe"])
            .env_vars(Vec::<(String, String)>::new())
            .yaml_str(yaml)
            .load()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// The `config.yaml` the settings were read from, if any.
    pub fn source_file(&self) -> Option<&Path> {
        self.inner.source.as_deref()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        let tree = self.inner.tree.read();
        lookup(&tree, &split_path(path)).cloned()
    }

    pub fn is_set(&self, path: &str) -> bool {
        self.get(path).is_some_and(|v| !v.is_null())
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.get(path)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => parse_bool(&s),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        match self.get(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        match self.get(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_duration(&self, path: &str) -> Option<Duration> {
        match self.get(path)? {
            Value::String(s) => parse_duration(&s).ok(),
            Value::Number(n) => n.as_u64().map(Duration::from_secs),
            _ => None,
        }
    }

    /// Override a value in the live tree.
    pub fn set(&self, path: &str, value: Value) {
        let mut tree = self.inner.tree.write();
        assign(&mut tree, &split_path(path), value);
    }

    /// Deserialize a sub-tree of the live configuration.
    pub fn section<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigError> {
        let value = self.get(path).unwrap_or(Value::Object(Map::new()));
        serde_json::from_value(value)
            .map_err(|e| ConfigError::Invalid(format!("section '{path}': {e}")))
    }
}

// ═══════════════════════════════════════════════════════════════
// Loader
// ═══════════════════════════════════════════════════════════════

/// Command-line flags understood by the loader. Unknown arguments are
/// ignored so the host binary can define its own.
#[derive(Debug, Default, Parser)]
#[command(name = "abe", ignore_errors = true, disable_help_flag = true, disable_version_flag = true)]
pub struct CliArgs {
    /// Directory name used in the config search paths.
    #[arg(long)]
    pub config_dir: Option<String>,
    #[arg(long)]
    pub server_address: Option<String>,
    #[arg(long)]
    pub server_mode: Option<String>,
    #[arg(long)]
    pub server_shutdown_timeout: Option<String>,
    #[arg(long)]
    pub app_name: Option<String>,
    #[arg(long)]
    pub app_debug: Option<bool>,
    #[arg(long)]
    pub logger_level: Option<String>,
    #[arg(long)]
    pub logger_format: Option<String>,
    #[arg(long)]
    pub logger_type: Option<String>,
    #[arg(long)]
    pub database_type: Option<String>,
    #[arg(long)]
    pub database_host: Option<String>,
    #[arg(long)]
    pub database_port: Option<u16>,
    #[arg(long)]
    pub database_user: Option<String>,
    #[arg(long)]
    pub database_password: Option<String>,
    #[arg(long)]
    pub database_dbname: Option<String>,
}

impl CliArgs {
    fn overrides(&self) -> Vec<(&'static str, Value)> {
        let mut out = Vec::new();
        let mut push_str = |path: &'static str, v: &Option<String>| {
            if let Some(v) = v {
                out.push((path, Value::String(v.clone())));
            }
        };
        push_str("server.address", &self.server_address);
        push_str("server.mode", &self.server_mode);
        push_str("server.shutdown_timeout", &self.server_shutdown_timeout);
        push_str("app.name", &self.app_name);
        push_str("logger.level", &self.logger_level);
        push_str("logger.format", &self.logger_format);
        push_str("logger.type", &self.logger_type);
        push_str("database.type", &self.database_type);
        push_str("database.host", &self.database_host);
        push_str("database.user", &self.database_user);
        push_str("database.password", &self.database_password);
        push_str("database.dbname", &self.database_dbname);
        if let Some(debug) = self.app_debug {
            out.push(("app.debug", Value::Bool(debug)));
        }
        if let Some(port) = self.database_port {
            out.push(("database.port", Value::from(port)));
        }
        out
    }
}

/// Builder assembling a [`Config`] from its layered sources.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    args: Option<Vec<OsString>>,
    env: Option<HashMap<String, String>>,
    yaml: Option<String>,
    search_paths: Option<Vec<PathBuf>>,
    skip_dotenv: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use these arguments instead of `std::env::args_os()`. The first item
    /// is the program name.
    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Use this environment instead of the process environment. Also
    /// disables `.env` loading.
    pub fn env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self.skip_dotenv = true;
        self
    }

    /// Use this YAML document instead of searching for `config.yaml`.
    pub fn yaml_str(mut self, yaml: impl Into<String>) -> Self {
        self.yaml = Some(yaml.into());
        self
    }

    pub fn search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = Some(paths);
        self
    }

    pub fn load(self) -> Result<Config, ConfigError> {
        let args = self
            .args
            .clone()
            .unwrap_or_else(|| std::env::args_os().collect());
        let cli = match CliArgs::try_parse_from(args) {
            Ok(cli) => cli,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable command-line flags");
                CliArgs::default()
            }
        };

        let config_dir = cli
            .config_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string());
        let search_paths = self
            .search_paths
            .clone()
            .unwrap_or_else(|| default_search_paths(&config_dir));

        if !self.skip_dotenv {
            load_dotenv(&search_paths);
        }

        let mut tree = serde_json::to_value(Settings::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut source = None;
        let yaml = match self.yaml {
            Some(text) => Some(("<inline>".to_string(), text)),
            None => match find_file(&search_paths, CONFIG_FILE) {
                Some(path) => {
                    let text =
                        std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        })?;
                    source = Some(path.clone());
                    Some((path.display().to_string(), text))
                }
                None => {
                    tracing::warn!(
                        paths = ?search_paths,
                        "no {CONFIG_FILE} found, using defaults"
                    );
                    None
                }
            },
        };
        if let Some((path, text)) = yaml {
            let overlay: Value = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path,
                reason: e.to_string(),
            })?;
            if !overlay.is_null() {
                merge(&mut tree, overlay);
            }
        }

        let env = self.env.unwrap_or_else(|| std::env::vars().collect());
        apply_env(&mut tree, &env);

        for (path, value) in cli.overrides() {
            assign(&mut tree, &split_path(path), value);
        }

        let settings: Settings = serde_json::from_value(tree.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Config {
            inner: Arc::new(ConfigInner {
                settings,
                tree: RwLock::new(tree),
                source,
            }),
        })
    }
}

pub fn default_search_paths(config_dir: &str) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("/etc/{config_dir}"))];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(format!(".{config_dir}")));
    }
    paths.push(PathBuf::from("./configs"));
    paths.push(PathBuf::from("."));
    paths
}

fn find_file(paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    paths.iter().map(|p| p.join(name)).find(|p| p.is_file())
}

fn load_dotenv(paths: &[PathBuf]) {
    let Some(path) = find_file(paths, ".env") else {
        return;
    };
    match dotenvy::from_path(&path) {
        Ok(()) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load .env"),
    }
}

/// Environment variable name for a config path.
pub fn env_key(path: &str) -> String {
    let key: String = path
        .chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{ENV_PREFIX}_{key}")
}

fn apply_env(tree: &mut Value, env: &HashMap<String, String>) {
    let mut leaves = Vec::new();
    collect_leaves(tree, String::new(), &mut leaves);
    for path in leaves {
        let Some(raw) = env.get(&env_key(&path)) else {
            continue;
        };
        let segments = split_path(&path);
        let current = lookup(tree, &segments).cloned().unwrap_or(Value::Null);
        assign(tree, &segments, coerce(&current, raw));
    }
}

fn collect_leaves(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                collect_leaves(v, path, out);
            }
        }
        // empty maps are open-ended (plugin toggles); env cannot address them
        Value::Object(_) => {}
        _ => out.push(prefix),
    }
}

fn coerce(current: &Value, raw: &str) -> Value {
    match current {
        Value::Bool(_) => parse_bool(raw).map(Value::Bool).unwrap_or_else(|| raw.into()),
        Value::Number(n) if n.is_f64() => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| raw.into()),
        Value::Number(_) => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| raw.into()),
        Value::Array(_) => Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        ),
        _ => Value::String(raw.to_string()),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Walks `segments`, also matching object keys that themselves contain
/// dots (plugin keys such as `acme.audit`).
fn lookup<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    if segments.is_empty() {
        return Some(value);
    }
    let map = value.as_object()?;
    for n in (1..=segments.len()).rev() {
        let key = segments[..n].join(".");
        if let Some(found) = map.get(&key).and_then(|child| lookup(child, &segments[n..])) {
            return Some(found);
        }
    }
    None
}

fn assign(tree: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *tree = value;
        return;
    };
    let mut node = tree;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(map) = node.as_object_mut() else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Some(map) = node.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (k, v) in overlay {
                match base.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ═══════════════════════════════════════════════════════════════
// Durations
// ═══════════════════════════════════════════════════════════════

/// Parse durations such as `5s`, `100ms`, `1h30m` or `1.5h`. A bare number
/// is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| e.to_string());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{input}'"))?;
        if num_len == 0 {
            return Err(format!("invalid duration '{input}'"));
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration '{input}'"))?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit '{unit}' in duration '{input}'")),
        };
        total += number * factor;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|e| e.to_string())
}

/// Inverse of [`parse_duration`] for whole milliseconds.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => super::parse_duration(&s).map_err(de::Error::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}
