use sea_orm::entity::prelude::*;

/// Caller-facing API keys. Only the SHA-256 hex of the key is stored; the
/// plaintext is returned once at creation time.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "access_tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    #[sea_orm(unique)]
    pub key_hash: String,
    pub name: String,
    /// 1 active, 2 disabled, 3 exhausted, 4 expired.
    pub status: i16,
    /// Quota units; -1 = unlimited.
    pub remain_quota: i64,
    pub used_quota: i64,
    /// Epoch seconds; -1 = never.
    pub expires_at: i64,
    /// Comma-separated canonical model names; empty = all models.
    pub model_limits: String,
    /// Newline-separated CIDRs or literal addresses; empty = any.
    pub ip_allowlist: String,
    pub group_name: String,
    pub cross_group_retry: bool,
    /// 0 = inherit the user default.
    pub rpm_limit: i32,
    pub tpm_limit: i32,
    /// Epoch seconds.
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
