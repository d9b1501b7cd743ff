//! Startup and graceful shutdown.
//!
//! [`Engine::run`] drives the whole lifecycle:
//!
//! 1. before-mount hooks, mount, after-mount hooks
//! 2. bind `server.address` (or use the listener from [`RunOptions`])
//! 3. before-server-start hooks, then serve in the background
//! 4. wait for SIGINT/SIGTERM, the custom shutdown future, or the server
//!    task ending on its own
//! 5. shut down: plugin hooks, scheduler, HTTP server (bounded by
//!    `server.shutdown_timeout`), event bus, worker pool

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::AbeError;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`Engine::run`].
#[derive(Default)]
pub struct RunOptions {
    base_path: Option<String>,
    listener: Option<TcpListener>,
    shutdown: Option<BoxFuture<'static, ()>>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("base_path", &self.base_path)
            .field("listener", &self.listener.as_ref().and_then(|l| l.local_addr().ok()))
            .field("custom_shutdown", &self.shutdown.is_some())
            .finish()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount every controller under `base_path`.
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Serve on an already bound listener instead of `server.address`.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Shut down when `signal` completes instead of on SIGINT/SIGTERM.
    pub fn shutdown_signal<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(signal));
        self
    }
}

struct ServerTask {
    stop: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

impl Engine {
    /// Run the application until shutdown.
    ///
    /// Startup failures stop whatever was already started and are returned.
    /// Once serving, the shutdown sequence always runs to completion;
    /// exceeding `server.shutdown_timeout` yields
    /// [`AbeError::ShutdownTimeout`].
    pub async fn run(&self, options: RunOptions) -> Result<(), AbeError> {
        let RunOptions {
            base_path,
            listener,
            shutdown,
        } = options;
        if let Some(base_path) = base_path {
            self.set_base_path(&base_path);
        }

        let mut server = match self.start(listener).await {
            Ok(server) => server,
            Err(err) => {
                tracing::error!(error = %err, "startup failed");
                let _ = self.shutdown(None).await;
                return Err(err);
            }
        };

        let served = {
            let external = async {
                match shutdown {
                    Some(signal) => signal.await,
                    None => shutdown_signal().await,
                }
            };
            tokio::select! {
                _ = external => None,
                finished = &mut server.handle => Some(finished),
            }
        };

        let early = match served {
            None => None,
            Some(Ok(Ok(()))) => Some(AbeError::Server("server stopped unexpectedly".into())),
            Some(Ok(Err(err))) => Some(AbeError::Server(err.to_string())),
            Some(Err(join)) => Some(AbeError::Server(format!("server task failed: {join}"))),
        };
        match early {
            Some(err) => {
                tracing::error!(error = %err, "server exited before shutdown was requested");
                // already finished; nothing to drain
                let _ = self.shutdown(None).await;
                Err(err)
            }
            None => {
                tracing::info!("shutdown requested");
                self.shutdown(Some(server)).await
            }
        }
    }

    async fn start(&self, listener: Option<TcpListener>) -> Result<ServerTask, AbeError> {
        self.plugins().before_mount(self).await?;
        let router = self
            .mount()
            .ok_or_else(|| AbeError::Server("routes are already mounted".into()))?;
        self.plugins().after_mount(self).await?;

        let listener = match listener {
            Some(listener) => listener,
            None => {
                let address = &self.config().settings().server.address;
                TcpListener::bind(address).await.map_err(|e| {
                    AbeError::Server(format!("failed to bind {address}: {e}"))
                })?
            }
        };
        self.plugins().before_server_start(self).await?;

        let local = listener.local_addr()?;
        tracing::info!(address = %local, base_path = %self.base_path(), "server listening");

        let stop = CancellationToken::new();
        let graceful = stop.clone();
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { graceful.cancelled().await });
        let handle = tokio::spawn(async move { serve.await });
        Ok(ServerTask { stop, handle })
    }

    async fn shutdown(&self, server: Option<ServerTask>) -> Result<(), AbeError> {
        let mut result = Ok(());

        if let Err(err) = self.plugins().shutdown(self).await {
            tracing::error!(error = %err, "plugin shutdown failed");
        }

        self.scheduler().stop().await;
        tracing::info!("scheduler stopped");

        if let Some(ServerTask { stop, mut handle }) = server {
            let timeout = self.config().settings().server.shutdown_timeout;
            let timeout = if timeout.is_zero() {
                DEFAULT_SHUTDOWN_TIMEOUT
            } else {
                timeout
            };
            stop.cancel();
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => tracing::info!("http server stopped"),
                Ok(Ok(Err(err))) => tracing::error!(error = %err, "http server failed while stopping"),
                Ok(Err(err)) => tracing::error!(error = %err, "http server task failed"),
                Err(_) => {
                    handle.abort();
                    tracing::error!(?timeout, "graceful shutdown timed out, connections dropped");
                    result = Err(AbeError::ShutdownTimeout(timeout));
                }
            }
        }

        if let Err(err) = self.events().close().await {
            tracing::error!(error = %err, "event bus close failed");
        }

        self.pool().release();
        tracing::info!("worker pool released");

        result
    }
}

/// Completes on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
