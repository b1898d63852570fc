use sea_orm::entity::prelude::*;

/// Append-only; one row per dispatched request. Never updated.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Epoch seconds.
    pub created_at: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub provider_id: Option<i64>,
    pub account_id: Option<i64>,
    pub model: String,
    pub status: i32,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub error_kind: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
