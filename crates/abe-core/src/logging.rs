//! Logging and tracing initialization.
//!
//! The subscriber is configured from the `logger.*` section:
//!
//! ```yaml
//! logger:
//!   level: info        # trace | debug | info | warn | error
//!   format: json       # text | json | pretty
//!   type: file         # console | file
//!   file:
//!     path: /var/log/abe/app.log
//! ```
//!
//! `RUST_LOG`, when set, overrides `logger.level`. `app.debug: true` forces
//! `debug`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::Span;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LogOutput, Settings};
use crate::error::AbeError;

/// Install the global subscriber described by `settings`.
///
/// Returns `Ok(false)` when a subscriber is already installed (tests, or a
/// host application that configured tracing itself).
pub fn init(settings: &Settings) -> Result<bool, AbeError> {
    let level = if settings.app.debug {
        "debug"
    } else {
        settings.logger.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match settings.logger.output {
        LogOutput::Console => install(filter, settings.logger.format, std::io::stdout),
        LogOutput::File => {
            let path = log_file_path(settings);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            install(filter, settings.logger.format, Mutex::new(file))
        }
    }
}

fn install<W>(filter: EnvFilter, format: LogFormat, writer: W) -> Result<bool, AbeError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init(),
    };
    Ok(result.is_ok())
}

/// `logger.file.path`, or `~/<app.name>/logs/app.log`.
pub fn log_file_path(settings: &Settings) -> PathBuf {
    if let Some(path) = settings.logger.file.path.as_ref().filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(&settings.app.name)
        .join("logs")
        .join("app.log")
}

/// Cloneable logger handle shared through the request container.
///
/// Events recorded inside [`Logger::in_scope`] carry the `app` field of the
/// root span.
#[derive(Clone, Debug)]
pub struct Logger {
    span: Span,
}

impl Logger {
    pub fn new(app_name: &str) -> Self {
        Logger {
            span: tracing::info_span!("abe", app = %app_name),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child logger tagged with a request id.
    pub fn for_request(&self, request_id: &str) -> Logger {
        Logger {
            span: tracing::info_span!(parent: &self.span, "request", request_id = %request_id),
        }
    }

    pub fn in_scope<F: FnOnce() -> T, T>(&self, f: F) -> T {
        self.span.in_scope(f)
    }
}
