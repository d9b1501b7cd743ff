use std::time::Duration;

use sea_orm::{ConnectOptions, Database as SeaDatabase, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

use crate::config::Settings;
use crate::error::AbeError;
use crate::migrations::Migrator;

/// Connect using the `database` section. Returns `None` when no database is
/// configured.
pub async fn connect(settings: &Settings) -> Result<Option<DatabaseConnection>, AbeError> {
    let Some(url) = settings.database.connection_url()? else {
        tracing::info!("no database configured");
        return Ok(None);
    };

    // every sqlite in-memory connection is its own database
    let max_connections = if url.starts_with("sqlite::memory:") {
        1
    } else {
        settings.database.max_connections.max(1)
    };
    let mut opts = ConnectOptions::new(url);
    opts.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(settings.app.debug);

    let db = SeaDatabase::connect(opts).await?;
    tracing::info!(kind = %settings.database.kind, "database connected");

    if settings.database.auto_migrate {
        migrate(&db).await?;
    }
    Ok(Some(db))
}

/// Apply pending framework migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), AbeError> {
    Migrator::up(db, None).await?;
    tracing::debug!("framework migrations applied");
    Ok(())
}
