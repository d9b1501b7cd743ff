use chrono::NaiveDateTime;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A configuration override stored in the database.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "system_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Dotted configuration path, e.g. `business.recharge.reversal_window`.
    #[sea_orm(unique)]
    pub key: String,

    pub value: String,

    /// One of `string`, `bool`, `int`, `float`, `duration`.
    pub value_type: String,

    pub name: String,
    pub description: Option<String>,
    pub group: Option<String>,
    pub enabled: bool,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
