//! User entity for SeaORM.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// JSON array of role strings, see models::Role
    #[sea_orm(column_type = "JsonBinary")]
    pub roles: JsonValue,
    /// JSON array of project names (manager scope)
    #[sea_orm(column_type = "JsonBinary")]
    pub projects: JsonValue,
    /// sha256 hex of the API token; NULL if no token was issued
    pub token_hash: Option<String>,
    /// Per-user UI configuration (updateConfiguration mutation)
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub ui_config: Option<JsonValue>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
