//! Message catalogs and per-request language negotiation.
//!
//! Catalogs are YAML maps from message id to text. A value may also be a
//! map with an `other` entry, or a nested map whose keys are joined with `.`:
//!
//! ```yaml
//! error.forbidden: "forbidden"
//! greeting:
//!   other: "Hello, {{name}}!"
//! order:
//!   shipped: "Order {{id}} shipped"
//! ```
//!
//! The builtin `en` and `zh` catalogs are compiled in; files named
//! `active.<lang>.yaml` (or `<lang>.yaml`) found under `i18n.paths` are
//! layered on top.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use serde_yaml::Value;

use crate::config::{ConfigError, I18nConfig};
use crate::engine::Engine;
use crate::error::AbeError;

const EMBEDDED: &[(&str, &str)] = &[
    ("en", include_str!("../locales/active.en.yaml")),
    ("zh", include_str!("../locales/active.zh.yaml")),
];

/// Language chosen for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: impl Into<String>) -> Self {
        Locale(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Locale {
    type Rejection = AbeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Locale>()
            .cloned()
            .unwrap_or_else(|| Locale::new("en")))
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().replace('_', "-").to_ascii_lowercase()
}

fn primary(tag: &str) -> &str {
    tag.split('-').next().unwrap_or(tag)
}

/// All loaded catalogs, keyed by normalized language tag.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    default_language: String,
    catalogs: HashMap<String, HashMap<String, String>>,
}

impl Bundle {
    /// An empty bundle.
    pub fn new(default_language: &str) -> Self {
        let default_language = if default_language.trim().is_empty() {
            "en".to_string()
        } else {
            normalize(default_language)
        };
        Bundle {
            default_language,
            catalogs: HashMap::new(),
        }
    }

    /// Builtin catalogs plus every readable file under `config.paths`.
    /// Unreadable files are logged and skipped.
    pub fn load(config: &I18nConfig) -> Self {
        let mut bundle = Bundle::new(&config.default_language);
        for (lang, source) in EMBEDDED {
            match bundle.add_messages(lang, source) {
                Ok(count) => tracing::debug!(%lang, count, "builtin messages loaded"),
                Err(err) => tracing::warn!(%lang, error = %err, "builtin messages failed to load"),
            }
        }
        for dir in config.paths.iter().filter(|p| !p.is_empty()) {
            bundle.load_path(Path::new(dir));
        }
        bundle
    }

    fn load_path(&mut self, path: &Path) {
        if path.is_file() {
            if let Err(err) = self.load_file(path) {
                tracing::warn!(file = %path.display(), error = %err, "failed to load message file");
            }
            return;
        }
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %path.display(), error = %err, "failed to read message directory");
                return;
            }
        };
        let mut files: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && language_of(p).is_some())
            .collect();
        files.sort();
        for file in files {
            match self.load_file(&file) {
                Ok(count) => tracing::info!(file = %file.display(), count, "message file loaded"),
                Err(err) => tracing::warn!(file = %file.display(), error = %err, "failed to load message file"),
            }
        }
    }

    /// Load one `active.<lang>.yaml` / `<lang>.yaml` file.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let lang = language_of(path).ok_or_else(|| {
            ConfigError::Invalid(format!("cannot infer language from {}", path.display()))
        })?;
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.add_messages(&lang, &source).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Merge a YAML catalog into `lang`, overriding existing ids.
    pub fn add_messages(&mut self, lang: &str, yaml: &str) -> Result<usize, ConfigError> {
        let parsed: Value = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: format!("<{lang} messages>"),
            reason: e.to_string(),
        })?;
        let mut flat = Vec::new();
        flatten("", &parsed, &mut flat);
        let count = flat.len();
        self.catalogs.entry(normalize(lang)).or_default().extend(flat);
        Ok(count)
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn languages(&self) -> Vec<String> {
        let mut langs: Vec<String> = self.catalogs.keys().cloned().collect();
        langs.sort();
        langs
    }

    /// Catalog tag best matching `candidate`: exact, then primary subtag.
    pub fn match_language(&self, candidate: &str) -> Option<String> {
        let tag = normalize(candidate);
        if tag.is_empty() {
            return None;
        }
        if self.catalogs.contains_key(&tag) {
            return Some(tag);
        }
        let base = primary(&tag);
        if self.catalogs.contains_key(base) {
            return Some(base.to_string());
        }
        self.catalogs
            .keys()
            .filter(|k| primary(k) == base)
            .min()
            .cloned()
    }

    pub fn message(&self, lang: &str, id: &str) -> Option<&str> {
        self.catalogs.get(lang)?.get(id).map(String::as_str)
    }
}

fn language_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".yaml")
        .or_else(|| name.strip_suffix(".yml"))?;
    let lang = stem.strip_prefix("active.").unwrap_or(stem);
    (!lang.is_empty() && !lang.contains('.')).then(|| lang.to_string())
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Mapping(map) => {
            if let Some(Value::String(other)) = map.get("other") {
                out.push((prefix.to_string(), other.clone()));
                return;
            }
            for (key, nested) in map {
                let Some(key) = key.as_str() else { continue };
                let id = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&id, nested, out);
            }
        }
        Value::String(s) if !prefix.is_empty() => out.push((prefix.to_string(), s.clone())),
        Value::Number(n) if !prefix.is_empty() => out.push((prefix.to_string(), n.to_string())),
        Value::Bool(b) if !prefix.is_empty() => out.push((prefix.to_string(), b.to_string())),
        _ => {}
    }
}

/// Split an `Accept-Language` value into tags, highest preference first.
pub fn parse_accept_language(header: &str) -> Vec<String> {
    let mut tags: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let tag = pieces.next()?.trim();
            if tag.is_empty() || tag == "*" {
                return None;
            }
            let quality = pieces
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((tag.to_string(), quality))
        })
        .collect();
    tags.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    tags.into_iter().map(|(tag, _)| tag).collect()
}

/// Translates message ids for one request.
#[derive(Debug, Clone)]
pub struct Localizer {
    bundle: Option<Arc<Bundle>>,
    languages: Vec<String>,
}

impl Localizer {
    /// Candidates are tried in order; the bundle default is always last.
    pub fn new(bundle: Arc<Bundle>, candidates: &[String]) -> Self {
        let mut languages: Vec<String> = Vec::new();
        let default = bundle.default_language().to_string();
        for candidate in candidates.iter().chain(std::iter::once(&default)) {
            if let Some(lang) = bundle.match_language(candidate) {
                if !languages.contains(&lang) {
                    languages.push(lang);
                }
            }
        }
        Localizer {
            bundle: Some(bundle),
            languages,
        }
    }

    /// A localizer with no catalogs; every lookup returns the message id.
    pub fn passthrough() -> Self {
        Localizer {
            bundle: None,
            languages: Vec::new(),
        }
    }

    /// The language lookups start with.
    pub fn language(&self) -> Option<&str> {
        self.languages.first().map(String::as_str)
    }

    /// Message for `id` with `{{name}}` placeholders filled from `args`.
    /// Falls back to `id` itself when no catalog has it.
    pub fn localize(&self, id: &str, args: &[(&str, &str)]) -> String {
        let Some(bundle) = &self.bundle else {
            return id.to_string();
        };
        let template = self
            .languages
            .iter()
            .find_map(|lang| bundle.message(lang, id));
        match template {
            Some(template) => args.iter().fold(template.to_string(), |text, (name, value)| {
                text.replace(&format!("{{{{{name}}}}}"), value)
            }),
            None => id.to_string(),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Localizer {
    type Rejection = AbeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Localizer>()
            .cloned()
            .unwrap_or_else(Localizer::passthrough))
    }
}

/// Catalog id for errors whose client message is generic.
pub fn error_message_id(err: &AbeError) -> Option<&'static str> {
    let id = match err {
        AbeError::Validation(_) => "error.validation_failed",
        AbeError::InvalidJson(_) => "error.invalid_json",
        AbeError::Unauthorized(_) => "error.unauthorized",
        AbeError::TokenExpired => "error.token_expired",
        AbeError::TokenInvalid(_) => "error.token_invalid",
        AbeError::Forbidden(_) => "error.forbidden",
        AbeError::Timeout(_) => "error.timeout",
        AbeError::RateLimited { .. } => "error.rate_limited",
        AbeError::ServiceUnavailable(_) | AbeError::Pool(_) => "error.service_unavailable",
        AbeError::InvalidInput { .. }
        | AbeError::NotFound { .. }
        | AbeError::Conflict { .. }
        | AbeError::Http { .. }
        | AbeError::Canceled => return None,
        AbeError::Database(_) => match err.status_code().as_u16() {
            404 => "error.not_found",
            409 => "error.conflict",
            _ => "error.internal",
        },
        _ => "error.internal",
    };
    Some(id)
}

/// Negotiates the request language: query parameter, then the language
/// header, then `i18n.default_language`.
///
/// Always stores a [`Locale`]; stores a [`Localizer`] when catalogs are
/// loaded.
pub async fn i18n_middleware(State(engine): State<Engine>, mut req: Request, next: Next) -> Response {
    let config = &engine.config().settings().i18n;
    let mut candidates = Vec::new();
    if let Some(query) = req.uri().query() {
        let key = if config.lang_query_key.is_empty() {
            "lang"
        } else {
            config.lang_query_key.as_str()
        };
        if let Some(value) = query_value(query, key) {
            candidates.push(value);
        }
    }
    let header = if config.lang_header.is_empty() {
        "accept-language"
    } else {
        config.lang_header.as_str()
    };
    if let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) {
        candidates.extend(parse_accept_language(value));
    }
    if !config.default_language.is_empty() {
        candidates.push(config.default_language.clone());
    }

    let locale = match engine.i18n() {
        Some(bundle) => {
            let localizer = Localizer::new(bundle.clone(), &candidates);
            let locale = localizer.language().map(str::to_string);
            req.extensions_mut().insert(localizer);
            locale
        }
        None => None,
    }
    .or_else(|| candidates.first().map(|c| normalize(c)))
    .unwrap_or_else(|| "en".to_string());
    req.extensions_mut().insert(Locale::new(locale));

    next.run(req).await
}

fn query_value(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.trim().is_empty()).then(|| v.trim().to_string())
    })
}
