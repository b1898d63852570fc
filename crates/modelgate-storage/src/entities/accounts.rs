use sea_orm::entity::prelude::*;

/// One upstream credential pooled under a provider. `secret` holds either a
/// bare API key or, for device-flow providers, an encrypted JSON bundle.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub name: String,
    pub secret: String,
    pub enabled: bool,
    /// Epoch seconds of the last selection; None if never used.
    pub last_used_at: Option<i64>,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub rate_limit_errors: i64,
    pub auth_errors: i64,
    /// Provider-reported consumable quota, refreshed in the background.
    /// Zero/zero when the provider has no such notion.
    pub usage: i64,
    pub usage_limit: i64,
    /// Epoch seconds.
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::providers::Entity",
        from = "Column::ProviderId",
        to = "super::providers::Column::Id",
        on_delete = "Cascade"
    )]
    Provider,
}

impl Related<super::providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Provider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
