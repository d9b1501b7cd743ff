//! Middleware registry.
//!
//! Three namespaces share one lock:
//!
//! - **global** handlers, applied to every mounted route in registration order;
//! - **shared** handlers, addressable by name;
//! - **groups**, named ordered lists built from handlers, shared names or
//!   other groups.
//!
//! Every read hands back a copy, so callers never observe later mutations.
//!
//! ```rust,ignore
//! let mw = engine.middlewares();
//! mw.register_shared("auth", engine.auth().authentication())?;
//! mw.register_shared("audit", audit_handler)?;
//! mw.create_group_from_shared("admin", &["auth", "audit"])?;
//!
//! // inside Controller::register_routes
//! let admin = apply_route(Router::new().route("/users", get(list)), &mw.must_group("admin"));
//! ```

pub mod access_log;
pub mod cors;
pub mod error_handler;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MiddlewareError {
    #[error("middleware '{0}' is already registered")]
    Duplicate(String),

    #[error("middleware '{0}' not found")]
    NotFound(String),

    #[error("invalid merge: {0}")]
    InvalidMerge(String),

    #[error("group '{group}' would contain itself via {path}")]
    Cycle { group: String, path: String },
}

type HandlerFn = dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync;

/// A named, cloneable middleware function.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    func: Arc<HandlerFn>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handler").field(&self.name).finish()
    }
}

impl Handler {
    pub fn new<F, Fut, Out>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Out> + Send + 'static,
        Out: IntoResponse,
    {
        Handler {
            name: name.into(),
            func: Arc::new(move |req: Request, next: Next| -> BoxFuture<'static, Response> {
                let fut = func(req, next);
                Box::pin(async move { fut.await.into_response() })
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, req: Request, next: Next) -> Response {
        (self.func)(req, next).await
    }
}

/// Layer `handlers` onto every route of `router`, outermost first, so they
/// run in slice order.
pub fn apply<S>(router: Router<S>, handlers: &[Handler]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    handlers.iter().rev().fold(router, |router, handler| {
        let handler = handler.clone();
        router.layer(axum::middleware::from_fn(move |req: Request, next: Next| {
            let handler = handler.clone();
            async move { handler.call(req, next).await }
        }))
    })
}

/// Like [`apply`], but only for matched routes (404s bypass the chain).
pub fn apply_route<S>(router: Router<S>, handlers: &[Handler]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    handlers.iter().rev().fold(router, |router, handler| {
        let handler = handler.clone();
        router.route_layer(axum::middleware::from_fn(move |req: Request, next: Next| {
            let handler = handler.clone();
            async move { handler.call(req, next).await }
        }))
    })
}

#[derive(Clone, Default)]
struct Group {
    handlers: Vec<Handler>,
    /// Groups this one was flattened from.
    sources: Vec<String>,
}

#[derive(Default)]
struct Namespaces {
    globals: Vec<Handler>,
    shared: HashMap<String, Handler>,
    groups: HashMap<String, Group>,
}

/// Registry of global, shared and grouped middleware.
#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    inner: Arc<RwLock<Namespaces>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Global ─────────────────────────────────────────────────

    pub fn register_global(&self, handlers: impl IntoIterator<Item = Handler>) {
        self.inner.write().globals.extend(handlers);
    }

    pub fn globals(&self) -> Vec<Handler> {
        self.inner.read().globals.clone()
    }

    // ── Shared ─────────────────────────────────────────────────

    pub fn register_shared(&self, name: &str, handler: Handler) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        if ns.shared.contains_key(name) {
            return Err(MiddlewareError::Duplicate(name.to_string()));
        }
        ns.shared.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn update_shared(&self, name: &str, handler: Handler) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        match ns.shared.get_mut(name) {
            Some(slot) => {
                *slot = handler;
                Ok(())
            }
            None => Err(MiddlewareError::NotFound(name.to_string())),
        }
    }

    pub fn get_shared(&self, name: &str) -> Option<Handler> {
        self.inner.read().shared.get(name).cloned()
    }

    /// # Panics
    ///
    /// Panics if no shared middleware is registered under `name`. Meant for
    /// route setup, where a missing name is a programming error.
    pub fn must_shared(&self, name: &str) -> Handler {
        match self.get_shared(name) {
            Some(handler) => handler,
            None => panic!("shared middleware '{name}' not found"),
        }
    }

    pub fn remove_shared(&self, name: &str) -> bool {
        self.inner.write().shared.remove(name).is_some()
    }

    pub fn list_shared(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().shared.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Groups ─────────────────────────────────────────────────

    pub fn create_group(
        &self,
        name: &str,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        if ns.groups.contains_key(name) {
            return Err(MiddlewareError::Duplicate(name.to_string()));
        }
        ns.groups.insert(
            name.to_string(),
            Group {
                handlers: handlers.into_iter().collect(),
                sources: Vec::new(),
            },
        );
        Ok(())
    }

    /// Create a group from shared middleware names, in the given order.
    pub fn create_group_from_shared(&self, name: &str, shared: &[&str]) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        if ns.groups.contains_key(name) {
            return Err(MiddlewareError::Duplicate(name.to_string()));
        }
        let handlers = resolve_shared(&ns, shared)?;
        ns.groups.insert(
            name.to_string(),
            Group {
                handlers,
                sources: Vec::new(),
            },
        );
        Ok(())
    }

    /// Create a group whose handlers are the concatenation of `groups`.
    pub fn create_group_from_groups(&self, name: &str, groups: &[&str]) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        if ns.groups.contains_key(name) {
            return Err(MiddlewareError::Duplicate(name.to_string()));
        }
        let group = flatten(&ns, name, groups)?;
        ns.groups.insert(name.to_string(), group);
        Ok(())
    }

    /// Copy of a group's handlers.
    pub fn get_group(&self, name: &str) -> Option<Vec<Handler>> {
        self.inner.read().groups.get(name).map(|g| g.handlers.clone())
    }

    /// # Panics
    ///
    /// Panics if the group does not exist.
    pub fn must_group(&self, name: &str) -> Vec<Handler> {
        match self.get_group(name) {
            Some(handlers) => handlers,
            None => panic!("middleware group '{name}' not found"),
        }
    }

    /// Replace a group's handlers.
    pub fn update_group(
        &self,
        name: &str,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        let group = ns
            .groups
            .get_mut(name)
            .ok_or_else(|| MiddlewareError::NotFound(name.to_string()))?;
        group.handlers = handlers.into_iter().collect();
        group.sources.clear();
        Ok(())
    }

    /// Rebuild a group from other groups.
    pub fn update_group_from_groups(&self, name: &str, groups: &[&str]) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        if !ns.groups.contains_key(name) {
            return Err(MiddlewareError::NotFound(name.to_string()));
        }
        let group = flatten(&ns, name, groups)?;
        ns.groups.insert(name.to_string(), group);
        Ok(())
    }

    pub fn append_to_group(
        &self,
        name: &str,
        handlers: impl IntoIterator<Item = Handler>,
    ) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        let group = ns
            .groups
            .get_mut(name)
            .ok_or_else(|| MiddlewareError::NotFound(name.to_string()))?;
        group.handlers.extend(handlers);
        Ok(())
    }

    pub fn append_shared_to_group(&self, name: &str, shared: &[&str]) -> Result<(), MiddlewareError> {
        let mut ns = self.inner.write();
        let handlers = resolve_shared(&ns, shared)?;
        let group = ns
            .groups
            .get_mut(name)
            .ok_or_else(|| MiddlewareError::NotFound(name.to_string()))?;
        group.handlers.extend(handlers);
        Ok(())
    }

    pub fn remove_group(&self, name: &str) -> bool {
        self.inner.write().groups.remove(name).is_some()
    }

    pub fn list_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().groups.keys().cloned().collect();
        names.sort();
        names
    }
}

fn resolve_shared(ns: &Namespaces, names: &[&str]) -> Result<Vec<Handler>, MiddlewareError> {
    names
        .iter()
        .map(|n| {
            ns.shared
                .get(*n)
                .cloned()
                .ok_or_else(|| MiddlewareError::NotFound(n.to_string()))
        })
        .collect()
}

fn flatten(ns: &Namespaces, target: &str, sources: &[&str]) -> Result<Group, MiddlewareError> {
    if sources.is_empty() {
        return Err(MiddlewareError::InvalidMerge(format!(
            "group '{target}' needs at least one source group"
        )));
    }
    let mut handlers = Vec::new();
    let mut seen = HashSet::new();
    for source in sources {
        if !seen.insert(*source) {
            return Err(MiddlewareError::InvalidMerge(format!(
                "group '{source}' listed more than once for '{target}'"
            )));
        }
        let mut visited = HashSet::new();
        let mut path = vec![target.to_string()];
        check_cycle(ns, target, source, &mut visited, &mut path)?;
        let group = ns
            .groups
            .get(*source)
            .ok_or_else(|| MiddlewareError::NotFound(source.to_string()))?;
        handlers.extend(group.handlers.iter().cloned());
    }
    Ok(Group {
        handlers,
        sources: sources.iter().map(|s| s.to_string()).collect(),
    })
}

/// Depth-first walk over the `sources` edges starting at `current`.
fn check_cycle(
    ns: &Namespaces,
    target: &str,
    current: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Result<(), MiddlewareError> {
    path.push(current.to_string());
    if current == target {
        return Err(MiddlewareError::Cycle {
            group: target.to_string(),
            path: path.join(" -> "),
        });
    }
    if !visited.insert(current.to_string()) {
        path.pop();
        return Ok(());
    }
    if let Some(group) = ns.groups.get(current) {
        for next in &group.sources {
            check_cycle(ns, target, next, visited, path)?;
        }
    }
    path.pop();
    Ok(())
}
