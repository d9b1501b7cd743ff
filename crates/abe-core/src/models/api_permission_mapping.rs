use chrono::NaiveDateTime;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Maps a route (`GET /api/members/:id`) to an abstract permission
/// (`member:read`).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "api_permission_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Upper-case HTTP method.
    pub method: String,

    /// Route pattern; `:param` and trailing `*` are accepted.
    pub path: String,

    pub resource: String,
    pub action: String,
    pub description: Option<String>,
    pub is_active: bool,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Permission code, `resource:action`.
    pub fn code(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }
}
