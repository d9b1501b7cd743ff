//! abe prelude: the types most applications touch, in one import.
//!
//! ```rust,ignore
//! use abe_core::prelude::*;
//! ```

// ── Core types ─────────────────────────────────────────────────
pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::error::{AbeError, ErrorCode, ErrorDetail};
pub use crate::response::ApiResponse;
pub use crate::server::RunOptions;

// ── Request scope ──────────────────────────────────────────────
pub use crate::container::{Container, Inject, Injectable, RequestContext, UseCase, invoke};
pub use crate::request::RequestMeta;

// ── Extension points ───────────────────────────────────────────
pub use crate::controller::{self, Controller};
pub use crate::middleware::{Handler, MiddlewareRegistry, apply, apply_route};
pub use crate::plugin::{
    AfterMountHook, BeforeMountHook, BeforeServerStartHook, Plugin, ShutdownHook,
};

// ── Auth, validation, i18n ─────────────────────────────────────
pub use crate::auth::{Claims, UserClaims};
pub use crate::i18n::{Locale, Localizer};
pub use crate::validation::ValidatedJson;

// ── Router & extractors ────────────────────────────────────────
pub use axum::Router;
pub use axum::extract::{Path, Query, State};
pub use axum::response::IntoResponse;
pub use axum::routing::{delete, get, patch, post, put};
pub use axum::Json;

pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
