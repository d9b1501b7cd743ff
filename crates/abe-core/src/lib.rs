pub mod auth;
pub mod config;
pub mod container;
pub mod controller;
pub mod db;
pub mod dynamic_config;
pub mod engine;
pub mod error;
pub mod events;
pub mod i18n;
pub mod logging;
pub mod middleware;
pub mod migrations;
pub mod models;
pub mod operation_log;
pub mod permissions;
pub mod plugin;
pub mod pool;
pub mod prelude;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod server;
pub mod testing;
pub mod validation;

/// Framework version, compared against plugin `min_engine_version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use container::{Container, Inject, Injectable, RequestContext, UseCase, invoke};
pub use controller::Controller;
pub use engine::{Engine, EngineBuilder};
pub use error::{AbeError, ErrorCode, ErrorResponse};
pub use plugin::Plugin;
pub use response::ApiResponse;
pub use server::RunOptions;
pub use testing::{TestApp, TestClient, TestResponse};

// Re-exports so applications need not depend on these crates directly.
pub use async_trait::async_trait;
pub use axum;
pub use sea_orm;
