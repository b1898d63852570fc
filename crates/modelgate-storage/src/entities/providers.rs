use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// "openai" | "anthropic" | "google" | "glm" | "kiro"
    pub provider_type: String,
    pub enabled: bool,
    /// Higher wins.
    pub priority: i32,
    /// Positive; used for weighted shuffles inside a priority tier.
    pub weight: i32,
    /// JSON array of canonical model names.
    pub models: String,
    /// JSON object: canonical model -> upstream model.
    pub model_mapping: String,
    pub base_url: Option<String>,
    pub group_name: String,
    /// Epoch seconds.
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::accounts::Entity")]
    Accounts,
}

impl Related<super::accounts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Accounts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
