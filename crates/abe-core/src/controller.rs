//! Controllers contribute routes to the engine's mounted group.
//!
//! ```rust,ignore
//! #[derive(Clone)]
//! struct UserController;
//!
//! impl Controller for UserController {
//!     fn register_routes(
//!         &self,
//!         router: Router<Engine>,
//!         middlewares: &MiddlewareRegistry,
//!         _engine: &Engine,
//!     ) -> Router<Engine> {
//!         let users = Router::new().route("/users", get(list_users));
//!         router.merge(apply_route(users, &middlewares.must_group("auth")))
//!     }
//! }
//!
//! engine.add_controller([controller::provider(UserController)]);
//! ```

use std::sync::Arc;

use axum::Router;

use crate::engine::Engine;
use crate::middleware::MiddlewareRegistry;

/// Registers routes against the engine's router group.
pub trait Controller: Send + Sync {
    fn register_routes(
        &self,
        router: Router<Engine>,
        middlewares: &MiddlewareRegistry,
        engine: &Engine,
    ) -> Router<Engine>;
}

/// Builds a controller at mount time.
pub type ControllerProvider = Arc<dyn Fn(&Engine) -> Box<dyn Controller> + Send + Sync>;

/// Provider returning clones of `controller`.
pub fn provider<C>(controller: C) -> ControllerProvider
where
    C: Controller + Clone + 'static,
{
    Arc::new(move |_: &Engine| -> Box<dyn Controller> { Box::new(controller.clone()) })
}

/// Provider building the controller from the engine (for controllers that
/// hold services).
pub fn provider_fn<C, F>(build: F) -> ControllerProvider
where
    C: Controller + 'static,
    F: Fn(&Engine) -> C + Send + Sync + 'static,
{
    Arc::new(move |engine: &Engine| -> Box<dyn Controller> { Box::new(build(engine)) })
}
