use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One policy (`ptype = "p"`) or role-link (`ptype = "g"`) line.
///
/// `p` rows carry `v0 = sub, v1 = obj, v2 = act`; `g` rows carry
/// `v0 = member, v1 = role`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "casbin_rule")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub ptype: String,
    pub v0: String,
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub v4: String,
    pub v5: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
