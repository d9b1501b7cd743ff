//! # abe hello
//!
//! The smallest complete abe application.
//!
//! ## Run
//!
//! ```bash
//! cargo run -p abe-hello -- --server-address 127.0.0.1:8080
//! ```
//!
//! ## Endpoints
//!
//! - `GET /api/hello?name=abe&lang=en`: localized greeting
//! - `GET /api/plugins`: registered plugins

use std::process::ExitCode;
use std::sync::Arc;

use abe_core::prelude::*;
use abe_core::middleware::MiddlewareRegistry;

struct Uptime;

#[async_trait]
impl Plugin for Uptime {
    fn key(&self) -> &str {
        "abe_hello.plugins.Uptime"
    }

    fn name(&self) -> &str {
        "uptime"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    async fn init(&self, _engine: &Engine) -> Result<(), AbeError> {
        Ok(())
    }

    fn before_server_start_hook(&self) -> Option<&dyn BeforeServerStartHook> {
        Some(self)
    }

    fn shutdown_hook(&self) -> Option<&dyn ShutdownHook> {
        Some(self)
    }
}

#[async_trait]
impl BeforeServerStartHook for Uptime {
    async fn on_before_server_start(&self, engine: &Engine) -> Result<(), AbeError> {
        engine.add_fn("@every 1m", || async {
            tracing::info!("still serving");
            Ok(())
        })?;
        Ok(())
    }
}

#[async_trait]
impl ShutdownHook for Uptime {
    async fn on_shutdown(&self, _engine: &Engine) -> Result<(), AbeError> {
        tracing::info!("goodbye");
        Ok(())
    }
}

#[derive(Deserialize)]
struct HelloQuery {
    name: Option<String>,
}

#[derive(Serialize)]
struct PluginView {
    name: String,
    key: String,
    version: String,
}

#[derive(Clone)]
struct HelloController;

impl Controller for HelloController {
    fn register_routes(
        &self,
        router: Router<Engine>,
        _middlewares: &MiddlewareRegistry,
        _engine: &Engine,
    ) -> Router<Engine> {
        router
            .route("/hello", get(hello))
            .route("/plugins", get(plugins))
    }
}

async fn hello(localizer: Localizer, Query(query): Query<HelloQuery>) -> ApiResponse<String> {
    let name = query.name.unwrap_or_else(|| "abe".to_string());
    let greeting = localizer.localize("greeting", &[("name", &name)]);
    ApiResponse::success(greeting)
}

async fn plugins(State(engine): State<Engine>) -> ApiResponse<Vec<PluginView>> {
    let list = engine
        .plugins()
        .list()
        .into_iter()
        .map(|info| PluginView {
            name: info.display_name().to_string(),
            key: info.key,
            version: info.version,
        })
        .collect();
    ApiResponse::success(list)
}

async fn serve() -> Result<(), AbeError> {
    let engine = Engine::bootstrap().await?;
    engine.register_plugin(Arc::new(Uptime)).await?;
    engine.add_controller([controller::provider(HelloController)]);
    engine.run(RunOptions::new().base_path("/api")).await
}

#[tokio::main]
async fn main() -> ExitCode {
    match serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "abe-hello stopped");
            eprintln!("abe-hello: {err}");
            ExitCode::FAILURE
        }
    }
}
