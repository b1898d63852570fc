use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Schema,
};

use crate::crypto::SecretCipher;
use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Full configuration state as stored; loaded once at bootstrap and on
/// hot-reload, then published to the in-memory registries.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub users: Vec<entities::users::Model>,
    pub tokens: Vec<entities::access_tokens::Model>,
    pub providers: Vec<entities::providers::Model>,
    pub accounts: Vec<entities::accounts::Model>,
}

#[derive(Clone)]
pub struct Storage {
    db: DatabaseConnection,
    cipher: SecretCipher,
}

impl Storage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        Self::connect_with(dsn, SecretCipher::from_env()).await
    }

    pub async fn connect_with(dsn: &str, cipher: SecretCipher) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        Ok(Self { db, cipher })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self {
            db,
            cipher: SecretCipher::from_env(),
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync; tables are created when missing.
    pub async fn sync_schema(&self) -> StorageResult<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);
        macro_rules! ensure_table {
            ($entity:expr) => {{
                let mut stmt = schema.create_table_from_entity($entity);
                stmt.if_not_exists();
                self.db.execute(backend.build(&stmt)).await?;
            }};
        }
        ensure_table!(entities::users::Entity);
        ensure_table!(entities::access_tokens::Entity);
        ensure_table!(entities::providers::Entity);
        ensure_table!(entities::accounts::Entity);
        ensure_table!(entities::request_logs::Entity);
        Ok(())
    }

    pub async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let mut accounts = entities::accounts::Entity::find().all(&self.db).await?;
        // Credential bundles live encrypted at rest; registries get plaintext.
        for account in &mut accounts {
            account.secret = self.cipher.decrypt(&account.secret);
        }
        Ok(StorageSnapshot {
            users: entities::users::Entity::find().all(&self.db).await?,
            tokens: entities::access_tokens::Entity::find().all(&self.db).await?,
            providers: entities::providers::Entity::find().all(&self.db).await?,
            accounts,
        })
    }

    /// Write-through for a metered request: debit the token, mirror into the
    /// owning user's used_quota, and flip to exhausted when the quota hit
    /// zero. The in-memory token store serializes callers per token.
    pub async fn commit_token_usage(
        &self,
        token_id: i64,
        user_id: i64,
        delta: i64,
        unlimited: bool,
        exhausted: bool,
    ) -> StorageResult<()> {
        use entities::access_tokens::{Column, Entity};
        let mut update = Entity::update_many()
            .col_expr(Column::UsedQuota, Expr::col(Column::UsedQuota).add(delta))
            .filter(Column::Id.eq(token_id));
        if !unlimited {
            update = update.col_expr(
                Column::RemainQuota,
                Expr::col(Column::RemainQuota).sub(delta),
            );
        }
        if exhausted {
            update = update.col_expr(Column::Status, Expr::value(3i16));
        }
        update.exec(&self.db).await?;

        use entities::users::{Column as UserColumn, Entity as UserEntity};
        UserEntity::update_many()
            .col_expr(
                UserColumn::UsedQuota,
                Expr::col(UserColumn::UsedQuota).add(delta),
            )
            .filter(UserColumn::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_token_status(&self, token_id: i64, status: i16) -> StorageResult<()> {
        use entities::access_tokens::{Column, Entity};
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .filter(Column::Id.eq(token_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Periodic sweep: expire overdue tokens and mark drained ones exhausted.
    /// Returns the ids that changed so in-memory state can follow.
    pub async fn sweep_token_statuses(&self, now: i64) -> StorageResult<Vec<i64>> {
        use entities::access_tokens::{Column, Entity};
        use sea_orm::QuerySelect;

        let expired: Vec<i64> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(1i16))
            .filter(Column::ExpiresAt.ne(-1i64))
            .filter(Column::ExpiresAt.lte(now))
            .into_tuple()
            .all(&self.db)
            .await?;
        if !expired.is_empty() {
            Entity::update_many()
                .col_expr(Column::Status, Expr::value(4i16))
                .filter(Column::Id.is_in(expired.clone()))
                .exec(&self.db)
                .await?;
        }

        let drained: Vec<i64> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(1i16))
            .filter(Column::RemainQuota.ne(-1i64))
            .filter(Column::RemainQuota.lte(0i64))
            .into_tuple()
            .all(&self.db)
            .await?;
        if !drained.is_empty() {
            Entity::update_many()
                .col_expr(Column::Status, Expr::value(3i16))
                .filter(Column::Id.is_in(drained.clone()))
                .exec(&self.db)
                .await?;
        }

        let mut changed = expired;
        changed.extend(drained);
        Ok(changed)
    }

    /// Per-outcome counter bump after a dispatch attempt completed on an
    /// account.
    pub async fn record_account_result(
        &self,
        account_id: i64,
        failed: bool,
        rate_limited: bool,
        auth_failed: bool,
        now: i64,
    ) -> StorageResult<()> {
        use entities::accounts::{Column, Entity};
        let mut update = Entity::update_many()
            .col_expr(
                Column::TotalRequests,
                Expr::col(Column::TotalRequests).add(1i64),
            )
            .col_expr(Column::LastUsedAt, Expr::value(Some(now)))
            .filter(Column::Id.eq(account_id));
        if failed {
            update = update.col_expr(
                Column::FailedRequests,
                Expr::col(Column::FailedRequests).add(1i64),
            );
        }
        if rate_limited {
            update = update.col_expr(
                Column::RateLimitErrors,
                Expr::col(Column::RateLimitErrors).add(1i64),
            );
        }
        if auth_failed {
            update = update.col_expr(
                Column::AuthErrors,
                Expr::col(Column::AuthErrors).add(1i64),
            );
        }
        update.exec(&self.db).await?;
        Ok(())
    }

    /// Background usage/limit refresh result for quota-reporting providers.
    pub async fn set_account_usage(
        &self,
        account_id: i64,
        usage: i64,
        usage_limit: i64,
    ) -> StorageResult<()> {
        use entities::accounts::{Column, Entity};
        Entity::update_many()
            .col_expr(Column::Usage, Expr::value(usage))
            .col_expr(Column::UsageLimit, Expr::value(usage_limit))
            .filter(Column::Id.eq(account_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Device-flow refresh can rotate an account's credential bundle; it is
    /// written encrypted.
    pub async fn set_account_secret(&self, account_id: i64, secret: &str) -> StorageResult<()> {
        use entities::accounts::{Column, Entity};
        let stored = self.cipher.encrypt(secret);
        Entity::update_many()
            .col_expr(Column::Secret, Expr::value(stored))
            .filter(Column::Id.eq(account_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn insert_logs(
        &self,
        rows: Vec<entities::request_logs::ActiveModel>,
    ) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        entities::request_logs::Entity::insert_many(rows)
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
