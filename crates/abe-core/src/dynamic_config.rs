//! Runtime configuration overrides stored in `system_configs`.
//!
//! Enabled rows are written into the live [`Config`] tree under their key, so
//! `config.get_i64("business.recharge.reversal_window")` sees the database
//! value without a restart. Durations land in the tree as strings such as
//! `"90s"` and are read back with [`Config::get_duration`].

use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use serde_json::Value;

use crate::config::{Config, format_duration, parse_duration};
use crate::error::AbeError;
use crate::models::system_config::{self, Entity as SystemConfig};

/// Convert a stored value to its typed form. Unknown types are kept as
/// strings.
pub fn parse_value(value: &str, value_type: &str) -> Result<Value, String> {
    match value_type {
        "bool" => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Ok(Value::Bool(true)),
            "0" | "f" | "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{value}' is not a bool")),
        },
        "int" => value
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("'{value}' is not an int: {e}")),
        "float" => value
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("'{value}' is not a float: {e}"))
            .and_then(|f| {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{value}' is not a finite float"))
            }),
        "duration" => parse_duration(value)
            .map(|d| Value::String(format_duration(d)))
            .map_err(|e| format!("invalid duration: {e}")),
        _ => Ok(Value::String(value.to_string())),
    }
}

/// Loads and updates `system_configs` rows.
#[derive(Clone)]
pub struct DynamicConfig {
    db: DatabaseConnection,
    config: Config,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for DynamicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicConfig").finish_non_exhaustive()
    }
}

impl DynamicConfig {
    pub fn new(db: DatabaseConnection, config: Config) -> Self {
        DynamicConfig {
            db,
            config,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn connected(&self) -> bool {
        !matches!(self.db, DatabaseConnection::Disconnected)
    }

    /// Apply every enabled row to the live config. Rows whose value does not
    /// parse as their declared type are skipped with a warning.
    ///
    /// Returns the number of keys applied.
    pub async fn load_all(&self) -> Result<usize, AbeError> {
        if !self.connected() {
            tracing::debug!("no database connected, dynamic config skipped");
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        let rows = SystemConfig::find()
            .filter(system_config::Column::Enabled.eq(true))
            .all(&self.db)
            .await?;

        let mut applied = 0;
        for row in rows {
            match parse_value(&row.value, &row.value_type) {
                Ok(value) => {
                    tracing::info!(key = %row.key, %value, value_type = %row.value_type, "dynamic config loaded");
                    self.config.set(&row.key, value);
                    applied += 1;
                }
                Err(reason) => tracing::warn!(
                    key = %row.key,
                    value = %row.value,
                    value_type = %row.value_type,
                    %reason,
                    "dynamic config value invalid, skipped"
                ),
            }
        }
        Ok(applied)
    }

    pub async fn reload(&self) -> Result<usize, AbeError> {
        self.load_all().await
    }

    /// Persist a new value for an existing key and apply it immediately.
    pub async fn update(&self, key: &str, value: &str) -> Result<(), AbeError> {
        let _guard = self.lock.lock().await;
        let row = SystemConfig::find()
            .filter(system_config::Column::Key.eq(key))
            .one(&self.db)
            .await?
            .ok_or_else(|| AbeError::not_found_id("system config", key))?;

        let parsed = parse_value(value, &row.value_type).map_err(AbeError::invalid_input)?;

        let mut active = row.into_active_model();
        active.value = Set(value.to_string());
        active.updated_at = Set(chrono::Utc::now().naive_utc());
        active.update(&self.db).await?;

        tracing::info!(%key, value = %parsed, "dynamic config updated");
        self.config.set(key, parsed);
        Ok(())
    }

    /// Current value in the live config.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.config.get(key)
    }
}
