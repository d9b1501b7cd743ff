//! Route → permission mappings loaded from `api_permission_mappings`.

use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::RwLock;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::auth::enforcer::key_match2;
use crate::auth::{AuthManager, forbidden, require_claims};
use crate::error::AbeError;
use crate::middleware::Handler;
use crate::models::api_permission_mapping::{self, Entity as ApiPermissionMapping};
use crate::request::full_path;

/// A resolved permission, `resource:action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

#[derive(Debug, Clone)]
struct Mapping {
    method: String,
    path: String,
    permission: Permission,
}

/// In-memory cache of active mappings.
#[derive(Debug, Clone, Default)]
pub struct PermissionMappings {
    entries: Arc<RwLock<Vec<Mapping>>>,
}

impl PermissionMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with the active rows of `api_permission_mappings`.
    pub async fn load(&self, db: &DatabaseConnection) -> Result<usize, AbeError> {
        let rows = ApiPermissionMapping::find()
            .filter(api_permission_mapping::Column::IsActive.eq(true))
            .all(db)
            .await?;
        let entries: Vec<Mapping> = rows
            .into_iter()
            .map(|row| Mapping {
                method: row.method.to_ascii_uppercase(),
                path: row.path,
                permission: Permission {
                    resource: row.resource,
                    action: row.action,
                },
            })
            .collect();
        let count = entries.len();
        *self.entries.write() = entries;
        tracing::info!(count, "api permission mappings loaded");
        Ok(count)
    }

    /// Add a mapping without touching the database.
    pub fn insert(&self, method: &str, path: &str, resource: &str, action: &str) {
        self.entries.write().push(Mapping {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            permission: Permission {
                resource: resource.to_string(),
                action: action.to_string(),
            },
        });
    }

    /// First mapping whose method matches and whose path pattern matches.
    pub fn resolve(&self, method: &str, path: &str) -> Option<Permission> {
        self.entries
            .read()
            .iter()
            .find(|m| m.method.eq_ignore_ascii_case(method) && key_match2(path, &m.path))
            .map(|m| m.permission.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Authorizes the request by the permission its route is mapped to.
///
/// Requests to unmapped routes are forbidden unless `auth.allow_unmapped`
/// is set.
pub fn mapped_authorization(auth: AuthManager, mappings: PermissionMappings) -> Handler {
    Handler::new("mapped_authorization", move |req: Request, next: Next| {
        let auth = auth.clone();
        let path = full_path(&req);
        let permission = mappings.resolve(req.method().as_str(), &path);
        async move {
            let claims = require_claims(&req)?;
            match permission {
                Some(p) => {
                    if !auth.check_permission(&claims, &p.resource, &p.action) {
                        return Err(forbidden("insufficient permission"));
                    }
                }
                None if auth.config().allow_unmapped => {}
                None => {
                    tracing::debug!(method = %req.method(), %path, "no permission mapping for route");
                    return Err(forbidden("no permission mapping for this endpoint"));
                }
            }
            Ok::<Response, AbeError>(next.run(req).await)
        }
    })
}
