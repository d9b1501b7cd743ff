//! RBAC policy enforcer.
//!
//! A request `(sub, obj, act)` is allowed when some policy `(p.sub, p.obj,
//! p.act)` satisfies all of:
//!
//! - `sub` is `p.sub` or inherits it through role links,
//! - `obj` matches the route pattern `p.obj` (see [`key_match2`]),
//! - `act` equals `p.act`, or `p.act` is `*`.
//!
//! Policies live in memory and are persisted to the `casbin_rule` table when
//! a database is attached.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::error::AbeError;
use crate::models::casbin_rule::{self, Entity as CasbinRule};

const MAX_ROLE_DEPTH: usize = 10;

static PATTERNS: LazyLock<Mutex<HashMap<String, Option<Regex>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Route-pattern match: `/*` matches any suffix and `:name` matches one
/// path segment.
///
/// ```rust,ignore
/// assert!(key_match2("/api/users/42", "/api/users/:id"));
/// assert!(key_match2("/api/users/42/posts", "/api/users/*"));
/// assert!(!key_match2("/api/users/42/posts", "/api/users/:id"));
/// ```
pub fn key_match2(key: &str, pattern: &str) -> bool {
    let compiled = PATTERNS
        .lock()
        .entry(pattern.to_string())
        .or_insert_with(|| {
            let expanded = expand_params(&pattern.replace("/*", "/.*"));
            match Regex::new(&format!("^{expanded}$")) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(%pattern, error = %err, "policy object is not a valid pattern, matching literally");
                    None
                }
            }
        })
        .clone();
    match compiled {
        Some(re) => re.is_match(key),
        None => key == pattern,
    }
}

// `:name` → `[^/]+`
fn expand_params(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' && chars.peek().is_some_and(|n| *n != '/') {
            while chars.peek().is_some_and(|n| *n != '/') {
                chars.next();
            }
            out.push_str("[^/]+");
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Policy {
    pub sub: String,
    pub obj: String,
    pub act: String,
}

impl Policy {
    pub fn new(sub: impl Into<String>, obj: impl Into<String>, act: impl Into<String>) -> Self {
        Policy {
            sub: sub.into(),
            obj: obj.into(),
            act: act.into(),
        }
    }
}

#[derive(Debug, Default)]
struct PolicySet {
    policies: Vec<Policy>,
    // member -> roles
    links: HashMap<String, Vec<String>>,
}

impl PolicySet {
    fn inherits(&self, member: &str, role: &str) -> bool {
        if member == role {
            return true;
        }
        let mut seen = HashSet::new();
        let mut frontier = vec![member.to_string()];
        for _ in 0..MAX_ROLE_DEPTH {
            let mut next = Vec::new();
            for m in &frontier {
                for r in self.links.get(m).into_iter().flatten() {
                    if r == role {
                        return true;
                    }
                    if seen.insert(r.clone()) {
                        next.push(r.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        false
    }
}

#[derive(Clone)]
pub struct Enforcer {
    policies: Arc<RwLock<PolicySet>>,
    // held across check, persist and apply of every mutation
    writes: Arc<tokio::sync::Mutex<()>>,
    db: Option<DatabaseConnection>,
}

impl std::fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.policies.read();
        f.debug_struct("Enforcer")
            .field("policies", &set.policies.len())
            .field("links", &set.links.len())
            .field("persistent", &self.db.is_some())
            .finish()
    }
}

impl Enforcer {
    /// Pass `None` for a memory-only enforcer.
    pub fn new(db: Option<DatabaseConnection>) -> Self {
        Enforcer {
            policies: Arc::new(RwLock::new(PolicySet::default())),
            writes: Arc::new(tokio::sync::Mutex::new(())),
            db,
        }
    }

    /// Replace the in-memory policy with the contents of `casbin_rule`.
    pub async fn load_policy(&self) -> Result<(), AbeError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let _writes = self.writes.lock().await;
        let rows = CasbinRule::find().all(db).await?;
        let mut set = PolicySet::default();
        for row in rows {
            match row.ptype.as_str() {
                "p" => set.policies.push(Policy::new(row.v0, row.v1, row.v2)),
                "g" => set.links.entry(row.v0).or_default().push(row.v1),
                other => tracing::debug!(ptype = %other, "ignoring unsupported policy line"),
            }
        }
        tracing::info!(
            policies = set.policies.len(),
            links = set.links.len(),
            "authorization policy loaded"
        );
        *self.policies.write() = set;
        Ok(())
    }

    pub fn enforce(&self, sub: &str, obj: &str, act: &str) -> Result<bool, AbeError> {
        let set = self.policies.read();
        let allowed = set.policies.iter().any(|p| {
            (p.act == act || p.act == "*") && set.inherits(sub, &p.sub) && key_match2(obj, &p.obj)
        });
        Ok(allowed)
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.policies.read().policies.clone()
    }

    /// Returns `false` when the policy already exists.
    pub async fn add_policy(&self, sub: &str, obj: &str, act: &str) -> Result<bool, AbeError> {
        let _writes = self.writes.lock().await;
        let policy = Policy::new(sub, obj, act);
        if self.policies.read().policies.contains(&policy) {
            return Ok(false);
        }
        self.persist("p", sub, obj, act).await?;
        self.policies.write().policies.push(policy);
        Ok(true)
    }

    /// Returns `false` when no such policy existed.
    pub async fn remove_policy(&self, sub: &str, obj: &str, act: &str) -> Result<bool, AbeError> {
        let _writes = self.writes.lock().await;
        let policy = Policy::new(sub, obj, act);
        if !self.policies.read().policies.contains(&policy) {
            return Ok(false);
        }
        self.unpersist("p", sub, obj, act).await?;
        self.policies.write().policies.retain(|p| *p != policy);
        Ok(true)
    }

    pub async fn add_role_for_user(&self, user: &str, role: &str) -> Result<bool, AbeError> {
        let _writes = self.writes.lock().await;
        if self.roles_for_user(user).iter().any(|r| r == role) {
            return Ok(false);
        }
        self.persist("g", user, role, "").await?;
        self.policies
            .write()
            .links
            .entry(user.to_string())
            .or_default()
            .push(role.to_string());
        Ok(true)
    }

    pub async fn delete_role_for_user(&self, user: &str, role: &str) -> Result<bool, AbeError> {
        let _writes = self.writes.lock().await;
        if !self.roles_for_user(user).iter().any(|r| r == role) {
            return Ok(false);
        }
        self.unpersist("g", user, role, "").await?;
        if let Some(roles) = self.policies.write().links.get_mut(user) {
            roles.retain(|r| r != role);
        }
        Ok(true)
    }

    /// Directly assigned roles.
    pub fn roles_for_user(&self, user: &str) -> Vec<String> {
        self.policies
            .read()
            .links
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Direct or inherited membership, following at most ten links.
    pub fn has_role_for_user(&self, user: &str, role: &str) -> bool {
        user != role && self.policies.read().inherits(user, role)
    }

    async fn persist(&self, ptype: &str, v0: &str, v1: &str, v2: &str) -> Result<(), AbeError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        casbin_rule::ActiveModel {
            ptype: Set(ptype.to_string()),
            v0: Set(v0.to_string()),
            v1: Set(v1.to_string()),
            v2: Set(v2.to_string()),
            v3: Set(String::new()),
            v4: Set(String::new()),
            v5: Set(String::new()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Ok(())
    }

    async fn unpersist(&self, ptype: &str, v0: &str, v1: &str, v2: &str) -> Result<(), AbeError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        CasbinRule::delete_many()
            .filter(casbin_rule::Column::Ptype.eq(ptype))
            .filter(casbin_rule::Column::V0.eq(v0))
            .filter(casbin_rule::Column::V1.eq(v1))
            .filter(casbin_rule::Column::V2.eq(v2))
            .exec(db)
            .await?;
        Ok(())
    }
}
