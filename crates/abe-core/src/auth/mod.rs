//! JWT authentication and policy-based authorization.
//!
//! ```rust,ignore
//! let auth = engine.auth();
//! engine.middlewares().register_shared("auth", auth.authentication())?;
//! engine.middlewares().register_shared("members.read", auth.authorization("member", "read"))?;
//! engine
//!     .middlewares()
//!     .create_group_from_shared("members", &["auth", "members.read"])?;
//!
//! async fn me(Claims(claims): Claims) -> Json<UserClaims> {
//!     Json(claims)
//! }
//! ```

pub mod enforcer;

use std::collections::HashSet;

use axum::extract::{FromRequestParts, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::AuthConfig;
use crate::error::{AbeError, ErrorCode, ErrorDetail};
use crate::middleware::Handler;
use crate::request::full_path;

use self::enforcer::Enforcer;

/// Username that bypasses permission checks in [`AuthManager::check_permission`].
pub const SUPER_ADMIN: &str = "admin";

/// Claims carried by access tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(rename = "uname", default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary_role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(rename = "sid", default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "one_or_many"
    )]
    pub aud: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl UserClaims {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        UserClaims {
            user_id: user_id.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Roles to check: `roles`, or the primary role when `roles` is empty.
    pub fn effective_roles(&self) -> Vec<String> {
        if self.roles.is_empty() && !self.primary_role.is_empty() {
            vec![self.primary_role.clone()]
        } else {
            self.roles.clone()
        }
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Policy subject for a user.
pub fn encode_user_sub(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Policy subject for a role.
pub fn encode_role_sub(role_id: &str) -> String {
    format!("role:{role_id}")
}

/// Issues and verifies tokens and checks abstract permissions.
#[derive(Clone, Debug)]
pub struct AuthManager {
    config: AuthConfig,
    enforcer: Enforcer,
}

impl AuthManager {
    pub fn new(config: AuthConfig, enforcer: Enforcer) -> Self {
        AuthManager { config, enforcer }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    fn secret(&self) -> Result<&[u8], AbeError> {
        if self.config.jwt_secret.is_empty() {
            return Err(AbeError::Internal("auth.jwt_secret is not configured".into()));
        }
        Ok(self.config.jwt_secret.as_bytes())
    }

    /// Sign `claims` with HS256.
    ///
    /// Missing `iat`, `nbf`, `exp`, `iss` and `aud` are filled from the clock and
    /// the `auth` config section.
    pub fn generate_token(&self, claims: &UserClaims) -> Result<String, AbeError> {
        let secret = self.secret()?;
        let now = Utc::now().timestamp();
        let mut claims = claims.clone();
        claims.iat.get_or_insert(now);
        claims.nbf.get_or_insert(now);
        claims
            .exp
            .get_or_insert(now + self.config.token_expiry.as_secs() as i64);
        if claims.iss.is_none() && !self.config.issuer.is_empty() {
            claims.iss = Some(self.config.issuer.clone());
        }
        if claims.aud.is_empty() {
            claims.aud = self.config.audience.clone();
        }

        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret))
            .map_err(|e| AbeError::Internal(format!("failed to sign token: {e}")))
    }

    /// Verify signature, expiry and (when configured) issuer and audience.
    pub fn parse_token(&self, token: &str) -> Result<UserClaims, AbeError> {
        let secret = self.secret()?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.clock_skew_seconds;
        validation.required_spec_claims = HashSet::from(["exp".to_string()]);
        if !self.config.issuer.is_empty() {
            validation.set_issuer(&[self.config.issuer.as_str()]);
        }
        if self.config.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audience);
        }

        let data = decode::<UserClaims>(token, &DecodingKey::from_secret(secret), &validation)?;
        Ok(data.claims)
    }

    /// `admin` passes; then the user's own subject; then each role.
    pub fn check_permission(&self, claims: &UserClaims, resource: &str, action: &str) -> bool {
        if claims.username == SUPER_ADMIN {
            return true;
        }
        if self
            .enforcer
            .enforce(&encode_user_sub(&claims.user_id), resource, action)
            .unwrap_or(false)
        {
            return true;
        }
        claims.effective_roles().iter().any(|role| {
            self.enforcer
                .enforce(&encode_role_sub(role), resource, action)
                .unwrap_or(false)
        })
    }

    /// Verifies `Authorization: Bearer <token>` and stores the claims on the
    /// request. The claims are also copied onto the response so outer
    /// middleware can see who made the call.
    pub fn authentication(&self) -> Handler {
        let auth = self.clone();
        Handler::new("authentication", move |mut req: Request, next: Next| {
            let auth = auth.clone();
            async move {
                let token = bearer_token(req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()))?;
                let claims = auth.parse_token(token).map_err(|err| match err {
                    AbeError::TokenExpired | AbeError::Internal(_) => err,
                    other => unauthorized("invalid token", other.to_string()),
                })?;
                req.extensions_mut().insert(claims.clone());
                let mut response = next.run(req).await;
                response.extensions_mut().insert(claims);
                Ok::<Response, AbeError>(response)
            }
        })
    }

    /// Requires `resource:action` via [`check_permission`](Self::check_permission).
    pub fn authorization(&self, resource: &str, action: &str) -> Handler {
        let auth = self.clone();
        let resource = resource.to_string();
        let action = action.to_string();
        Handler::new(
            format!("authorization:{resource}:{action}"),
            move |req: Request, next: Next| {
                let auth = auth.clone();
                let resource = resource.clone();
                let action = action.clone();
                async move {
                    let claims = require_claims(&req)?;
                    if !auth.check_permission(&claims, &resource, &action) {
                        return Err(forbidden("insufficient permission"));
                    }
                    Ok::<Response, AbeError>(next.run(req).await)
                }
            },
        )
    }
}

fn bearer_token(header: Option<&str>) -> Result<&str, AbeError> {
    let header = header.ok_or_else(|| unauthorized("missing credentials", "missing Authorization header"))?;
    match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(unauthorized(
            "malformed Authorization header, expected 'Bearer {token}'",
            "invalid auth header format",
        )),
    }
}

pub(crate) fn unauthorized(message: &str, reason: impl Into<String>) -> AbeError {
    AbeError::Http {
        status: StatusCode::UNAUTHORIZED,
        code: ErrorCode::Unauthorized,
        message: message.to_string(),
        details: vec![ErrorDetail::field("auth", reason)],
    }
}

pub(crate) fn forbidden(message: &str) -> AbeError {
    AbeError::Http {
        status: StatusCode::FORBIDDEN,
        code: ErrorCode::Forbidden,
        message: message.to_string(),
        details: Vec::new(),
    }
}

pub(crate) fn require_claims(req: &Request) -> Result<UserClaims, AbeError> {
    req.extensions()
        .get::<UserClaims>()
        .cloned()
        .ok_or_else(|| unauthorized("unauthenticated", "no user claims"))
}

// ═══════════════════════════════════════════════════════════════
// Route-level authorization
// ═══════════════════════════════════════════════════════════════

/// `*` authorizes against the literal object `*`; any other prefix is
/// prepended to the request path.
fn build_object(prefix: &str, path: &str) -> String {
    if prefix == "*" {
        prefix.to_string()
    } else {
        format!("{prefix}{path}")
    }
}

fn check(enforcer: &Enforcer, sub: &str, obj: &str, act: &str) -> Result<(), AbeError> {
    match enforcer.enforce(sub, obj, act) {
        Ok(true) => Ok(()),
        Ok(false) => Err(forbidden("insufficient permission")),
        Err(err) => Err(AbeError::Http {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorCode::InternalError,
            message: "permission check failed".to_string(),
            details: vec![ErrorDetail::new(err.to_string())],
        }),
    }
}

/// Authorizes `user:<uid>` against `<prefix><path>` and the lower-cased
/// method.
pub fn user_authorization(enforcer: Enforcer, prefix: &str) -> Handler {
    let prefix = prefix.to_string();
    Handler::new("user_authorization", move |req: Request, next: Next| {
        let enforcer = enforcer.clone();
        let obj = build_object(&prefix, &full_path(&req));
        async move {
            let claims = require_claims(&req)?;
            let act = req.method().as_str().to_ascii_lowercase();
            check(&enforcer, &encode_user_sub(&claims.user_id), &obj, &act)?;
            Ok::<Response, AbeError>(next.run(req).await)
        }
    })
}

/// Authorizes the primary role. A token without one is forbidden.
pub fn role_authorization(enforcer: Enforcer, prefix: &str) -> Handler {
    let prefix = prefix.to_string();
    Handler::new("role_authorization", move |req: Request, next: Next| {
        let enforcer = enforcer.clone();
        let obj = build_object(&prefix, &full_path(&req));
        async move {
            let claims = require_claims(&req)?;
            if claims.primary_role.is_empty() {
                return Err(forbidden("missing primary role"));
            }
            let act = req.method().as_str().to_ascii_lowercase();
            check(&enforcer, &encode_role_sub(&claims.primary_role), &obj, &act)?;
            Ok::<Response, AbeError>(next.run(req).await)
        }
    })
}

/// Passes when any role (or the primary role, if no roles are listed) is
/// allowed.
pub fn multi_role_authorization(enforcer: Enforcer, prefix: &str) -> Handler {
    let prefix = prefix.to_string();
    Handler::new("multi_role_authorization", move |req: Request, next: Next| {
        let enforcer = enforcer.clone();
        let obj = build_object(&prefix, &full_path(&req));
        async move {
            let claims = require_claims(&req)?;
            let roles = claims.effective_roles();
            if roles.is_empty() {
                return Err(forbidden("missing role information"));
            }
            let act = req.method().as_str().to_ascii_lowercase();
            let allowed = roles
                .iter()
                .any(|role| check(&enforcer, &encode_role_sub(role), &obj, &act).is_ok());
            if !allowed {
                return Err(forbidden("insufficient permission"));
            }
            Ok::<Response, AbeError>(next.run(req).await)
        }
    })
}

/// Fixed `(obj, act)` check for the caller's user subject.
pub fn authorize_endpoint(enforcer: Enforcer, obj: &str, act: &str) -> Handler {
    let obj = obj.to_string();
    let act = act.to_string();
    Handler::new(format!("authorize:{obj}:{act}"), move |req: Request, next: Next| {
        let enforcer = enforcer.clone();
        let obj = obj.clone();
        let act = act.clone();
        async move {
            let claims = require_claims(&req)?;
            check(&enforcer, &encode_user_sub(&claims.user_id), &obj, &act)?;
            Ok::<Response, AbeError>(next.run(req).await)
        }
    })
}

/// Fixed `(obj, act)` check for the caller's primary role.
pub fn role_authorize_endpoint(enforcer: Enforcer, obj: &str, act: &str) -> Handler {
    let obj = obj.to_string();
    let act = act.to_string();
    Handler::new(format!("role_authorize:{obj}:{act}"), move |req: Request, next: Next| {
        let enforcer = enforcer.clone();
        let obj = obj.clone();
        let act = act.clone();
        async move {
            let claims = require_claims(&req)?;
            if claims.primary_role.is_empty() {
                return Err(forbidden("missing primary role"));
            }
            check(&enforcer, &encode_role_sub(&claims.primary_role), &obj, &act)?;
            Ok::<Response, AbeError>(next.run(req).await)
        }
    })
}

/// Extractor for the authenticated caller's claims.
#[derive(Debug, Clone)]
pub struct Claims(pub UserClaims);

impl<S: Send + Sync> FromRequestParts<S> for Claims {
    type Rejection = AbeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserClaims>()
            .cloned()
            .map(Claims)
            .ok_or_else(|| unauthorized("unauthenticated", "no user claims"))
    }
}
