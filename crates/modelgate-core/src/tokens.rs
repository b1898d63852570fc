use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use modelgate_storage::entities::{access_tokens, users};
use modelgate_storage::Storage;

use crate::error::{ErrorKind, GatewayError};
use crate::ratelimit::TokenLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Active,
    Disabled,
    Exhausted,
    Expired,
}

impl TokenStatus {
    pub fn from_i16(value: i16) -> Self {
        match value {
            2 => TokenStatus::Disabled,
            3 => TokenStatus::Exhausted,
            4 => TokenStatus::Expired,
            _ => TokenStatus::Active,
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            TokenStatus::Active => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Exhausted => 3,
            TokenStatus::Expired => 4,
        }
    }
}

/// Access-token snapshot handed to the dispatcher. Quota fields may lag the
/// slot by in-flight commits; the commit path is the source of truth.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: TokenStatus,
    /// -1 = unlimited.
    pub remain_quota: i64,
    pub used_quota: i64,
    /// Epoch seconds; -1 = never.
    pub expires_at: i64,
    /// Empty = all models.
    pub model_limits: Vec<String>,
    /// Empty = any address.
    pub ip_allowlist: Vec<String>,
    pub group: String,
    pub cross_group_retry: bool,
    pub rpm_limit: u32,
    pub tpm_limit: u32,
}

impl AccessToken {
    fn from_model(model: &access_tokens::Model) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            name: model.name.clone(),
            status: TokenStatus::from_i16(model.status),
            remain_quota: model.remain_quota,
            used_quota: model.used_quota,
            expires_at: model.expires_at,
            model_limits: split_list(&model.model_limits, ','),
            ip_allowlist: split_list(&model.ip_allowlist, '\n'),
            group: model.group_name.clone(),
            cross_group_retry: model.cross_group_retry,
            rpm_limit: model.rpm_limit.max(0) as u32,
            tpm_limit: model.tpm_limit.max(0) as u32,
        }
    }

    pub fn unlimited(&self) -> bool {
        self.remain_quota == -1
    }

    pub fn limits(&self) -> TokenLimits {
        TokenLimits {
            rpm: self.rpm_limit,
            tpm: self.tpm_limit,
        }
    }

    pub fn allows_model(&self, canonical_model: &str) -> bool {
        self.model_limits.is_empty()
            || self.model_limits.iter().any(|model| model == canonical_model)
    }

    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.ip_allowlist.is_empty()
            || self
                .ip_allowlist
                .iter()
                .any(|entry| ip_matches_entry(entry, ip))
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: String,
    pub total_quota: i64,
    pub used_quota: i64,
    pub enabled: bool,
}

impl User {
    fn from_model(model: &users::Model) -> Self {
        Self {
            id: model.id,
            email: model.email.clone(),
            role: model.role.clone(),
            total_quota: model.total_quota,
            used_quota: model.used_quota,
            enabled: model.enabled,
        }
    }
}

struct TokenSlot {
    token: RwLock<AccessToken>,
    /// Serializes commit_usage per token; quota never over-debits under
    /// concurrency.
    commit: Mutex<()>,
}

pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub struct AccessTokenStore {
    storage: Storage,
    by_hash: RwLock<HashMap<String, Arc<TokenSlot>>>,
    by_id: RwLock<HashMap<i64, Arc<TokenSlot>>>,
    users: RwLock<HashMap<i64, User>>,
}

impl AccessTokenStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            by_hash: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub async fn replace_all(
        &self,
        tokens: &[access_tokens::Model],
        user_rows: &[users::Model],
    ) {
        let mut by_hash = HashMap::new();
        let mut by_id = HashMap::new();
        for model in tokens {
            let slot = Arc::new(TokenSlot {
                token: RwLock::new(AccessToken::from_model(model)),
                commit: Mutex::new(()),
            });
            by_hash.insert(model.key_hash.clone(), slot.clone());
            by_id.insert(model.id, slot);
        }
        let mut users = HashMap::new();
        for model in user_rows {
            users.insert(model.id, User::from_model(model));
        }
        *self.by_hash.write().await = by_hash;
        *self.by_id.write().await = by_id;
        *self.users.write().await = users;
    }

    async fn slot_by_key(&self, key: &str) -> Option<Arc<TokenSlot>> {
        let hash = hash_key(key);
        self.by_hash.read().await.get(&hash).cloned()
    }

    async fn slot_by_id(&self, token_id: i64) -> Option<Arc<TokenSlot>> {
        self.by_id.read().await.get(&token_id).cloned()
    }

    pub async fn user(&self, user_id: i64) -> Option<User> {
        self.users.read().await.get(&user_id).cloned()
    }

    /// The full authorization pipeline, in the fixed order: lookup, stored
    /// status, expiry, client address, model whitelist, quota headroom.
    pub async fn authorize(
        &self,
        key: &str,
        client_ip: IpAddr,
        canonical_model: &str,
        estimated_prompt_tokens: u32,
        now: i64,
    ) -> Result<(AccessToken, User), GatewayError> {
        let (token, user) = self.authorize_key(key, client_ip, now).await?;
        self.authorize_request(&token, canonical_model, estimated_prompt_tokens)?;
        Ok((token, user))
    }

    /// Checks that need no parsed body: lookup, status, expiry, client IP.
    pub async fn authorize_key(
        &self,
        key: &str,
        client_ip: IpAddr,
        now: i64,
    ) -> Result<(AccessToken, User), GatewayError> {
        let slot = self
            .slot_by_key(key)
            .await
            .ok_or_else(|| GatewayError::kind(ErrorKind::InvalidKey))?;
        let token = slot.token.read().await.clone();

        match token.status {
            TokenStatus::Active => {}
            TokenStatus::Disabled => return Err(GatewayError::kind(ErrorKind::TokenDisabled)),
            TokenStatus::Exhausted => return Err(GatewayError::kind(ErrorKind::TokenExhausted)),
            TokenStatus::Expired => return Err(GatewayError::kind(ErrorKind::TokenExpired)),
        }

        if token.expires_at != -1 && token.expires_at <= now {
            slot.token.write().await.status = TokenStatus::Expired;
            if let Err(err) = self
                .storage
                .set_token_status(token.id, TokenStatus::Expired.as_i16())
                .await
            {
                warn!(event = "token_status_write_failed", token_id = token.id, error = %err);
            }
            return Err(GatewayError::kind(ErrorKind::TokenExpired));
        }

        if !token.allows_ip(client_ip) {
            return Err(GatewayError::new(
                ErrorKind::IpNotAllowed,
                format!("address {client_ip} is not in the token allowlist"),
            ));
        }

        let user = self
            .user(token.user_id)
            .await
            .filter(|user| user.enabled)
            .ok_or_else(|| GatewayError::kind(ErrorKind::TokenDisabled))?;
        Ok((token, user))
    }

    /// Checks that need the parsed request: model whitelist, then quota.
    pub fn authorize_request(
        &self,
        token: &AccessToken,
        canonical_model: &str,
        estimated_prompt_tokens: u32,
    ) -> Result<(), GatewayError> {
        if !token.allows_model(canonical_model) {
            return Err(GatewayError::new(
                ErrorKind::ModelNotPermitted,
                format!("token has no access to model {canonical_model}"),
            ));
        }
        if !token.unlimited() && token.remain_quota < estimated_prompt_tokens as i64 {
            return Err(GatewayError::kind(ErrorKind::QuotaInsufficient));
        }
        Ok(())
    }

    /// Debits `prompt + completion`, mirrors into the user, and flips the
    /// token to exhausted when the quota runs out. Serialized per token.
    pub async fn commit_usage(
        &self,
        token_id: i64,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<TokenStatus, GatewayError> {
        let slot = self
            .slot_by_id(token_id)
            .await
            .ok_or_else(|| GatewayError::kind(ErrorKind::InvalidKey))?;
        let _serialized = slot.commit.lock().await;

        let delta = prompt_tokens as i64 + completion_tokens as i64;
        let (user_id, unlimited, status) = {
            let mut token = slot.token.write().await;
            token.used_quota += delta;
            let unlimited = token.unlimited();
            if !unlimited {
                token.remain_quota -= delta;
                if token.remain_quota <= 0 && token.status == TokenStatus::Active {
                    token.status = TokenStatus::Exhausted;
                }
            }
            (token.user_id, unlimited, token.status)
        };

        if let Err(err) = self
            .storage
            .commit_token_usage(
                token_id,
                user_id,
                delta,
                unlimited,
                status == TokenStatus::Exhausted,
            )
            .await
        {
            warn!(event = "quota_write_failed", token_id, error = %err);
        }

        if let Some(user) = self.users.write().await.get_mut(&user_id) {
            user.used_quota += delta;
        }
        Ok(status)
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Literal address or CIDR prefix match, both families.
fn ip_matches_entry(entry: &str, ip: IpAddr) -> bool {
    if let Some((network, prefix)) = entry.split_once('/') {
        let (Ok(network), Ok(prefix)) = (network.parse::<IpAddr>(), prefix.parse::<u8>()) else {
            return false;
        };
        return match (network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let bits = 32u32.min(prefix as u32);
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                u32::from(network) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let bits = 128u32.min(prefix as u32);
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                u128::from(network) & mask == u128::from(ip) & mask
            }
            _ => false,
        };
    }
    entry.parse::<IpAddr>().map(|allowed| allowed == ip).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(
        tokens: Vec<access_tokens::Model>,
        user_rows: Vec<users::Model>,
    ) -> AccessTokenStore {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        storage.sync_schema().await.unwrap();
        let store = AccessTokenStore::new(storage);
        store.replace_all(&tokens, &user_rows).await;
        store
    }

    fn user_model(id: i64) -> users::Model {
        users::Model {
            id,
            email: format!("u{id}@example.com"),
            role: "user".to_string(),
            total_quota: -1,
            used_quota: 0,
            enabled: true,
            created_at: 0,
        }
    }

    fn token_model(id: i64, key: &str) -> access_tokens::Model {
        access_tokens::Model {
            id,
            user_id: 1,
            key_hash: hash_key(key),
            name: "t".to_string(),
            status: 1,
            remain_quota: -1,
            used_quota: 0,
            expires_at: -1,
            model_limits: String::new(),
            ip_allowlist: String::new(),
            group_name: "default".to_string(),
            cross_group_retry: false,
            rpm_limit: 0,
            tpm_limit: 0,
            created_at: 0,
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let store = store_with(vec![token_model(1, "sk-known")], vec![user_model(1)]).await;
        let err = store
            .authorize("sk-unknown", localhost(), "m", 1, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidKey);
    }

    #[tokio::test]
    async fn expiry_at_exactly_now_expires() {
        let mut token = token_model(1, "sk-a");
        token.expires_at = 1000;
        let store = store_with(vec![token], vec![user_model(1)]).await;
        let err = store
            .authorize("sk-a", localhost(), "m", 1, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenExpired);
        // The transition is sticky.
        let err = store
            .authorize("sk-a", localhost(), "m", 1, 999)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenExpired);
    }

    #[tokio::test]
    async fn quota_exactly_equal_to_estimate_passes() {
        let mut token = token_model(1, "sk-a");
        token.remain_quota = 50;
        let store = store_with(vec![token], vec![user_model(1)]).await;
        assert!(store
            .authorize("sk-a", localhost(), "m", 50, 1000)
            .await
            .is_ok());
        let err = store
            .authorize("sk-a", localhost(), "m", 51, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::QuotaInsufficient);
    }

    #[tokio::test]
    async fn model_whitelist_is_enforced() {
        let mut token = token_model(1, "sk-a");
        token.model_limits = "gpt-4o-mini, gpt-4o".to_string();
        let store = store_with(vec![token], vec![user_model(1)]).await;
        assert!(store
            .authorize("sk-a", localhost(), "gpt-4o-mini", 1, 1000)
            .await
            .is_ok());
        let err = store
            .authorize("sk-a", localhost(), "claude-3-opus", 1, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelNotPermitted);
    }

    #[tokio::test]
    async fn ip_allowlist_supports_cidr() {
        let mut token = token_model(1, "sk-a");
        token.ip_allowlist = "10.0.0.0/8\n192.168.1.5".to_string();
        let store = store_with(vec![token], vec![user_model(1)]).await;
        assert!(store
            .authorize("sk-a", "10.20.30.40".parse().unwrap(), "m", 1, 1000)
            .await
            .is_ok());
        assert!(store
            .authorize("sk-a", "192.168.1.5".parse().unwrap(), "m", 1, 1000)
            .await
            .is_ok());
        let err = store
            .authorize("sk-a", "192.168.1.6".parse().unwrap(), "m", 1, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IpNotAllowed);
    }

    #[tokio::test]
    async fn commit_exhausts_at_zero() {
        let mut token = token_model(1, "sk-a");
        token.remain_quota = 10;
        let store = store_with(vec![token], vec![user_model(1)]).await;
        let status = store.commit_usage(1, 6, 4).await.unwrap();
        assert_eq!(status, TokenStatus::Exhausted);
        let err = store
            .authorize("sk-a", localhost(), "m", 1, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenExhausted);
    }

    #[tokio::test]
    async fn concurrent_commits_serialize() {
        let mut token = token_model(1, "sk-a");
        token.remain_quota = 1_000_000;
        let store = Arc::new(store_with(vec![token], vec![user_model(1)]).await);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.commit_usage(1, 3, 2).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let slot = store.slot_by_id(1).await.unwrap();
        let token = slot.token.read().await;
        assert_eq!(token.used_quota, 100);
        assert_eq!(token.remain_quota, 1_000_000 - 100);
        let user = store.user(1).await.unwrap();
        assert_eq!(user.used_quota, 100);
    }
}
