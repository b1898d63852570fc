use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;

use modelgate_storage::entities::accounts;

use crate::health::{HealthMonitor, HealthStatus};

/// In-memory account state. Counters are advisory mirrors of the database
/// row; the write-through in the dispatcher keeps the row authoritative.
pub struct Account {
    pub id: i64,
    pub provider_id: i64,
    pub name: String,
    secret: std::sync::RwLock<String>,
    enabled: AtomicBool,
    /// Epoch seconds of the last selection; 0 = never used.
    last_used_at: AtomicI64,
    pub total_requests: AtomicI64,
    pub failed_requests: AtomicI64,
    pub rate_limit_errors: AtomicI64,
    pub auth_errors: AtomicI64,
    pub usage: AtomicI64,
    pub usage_limit: AtomicI64,
}

impl Account {
    pub fn from_model(model: &accounts::Model) -> Self {
        Self {
            id: model.id,
            provider_id: model.provider_id,
            name: model.name.clone(),
            secret: std::sync::RwLock::new(model.secret.clone()),
            enabled: AtomicBool::new(model.enabled),
            last_used_at: AtomicI64::new(model.last_used_at.unwrap_or(0)),
            total_requests: AtomicI64::new(model.total_requests),
            failed_requests: AtomicI64::new(model.failed_requests),
            rate_limit_errors: AtomicI64::new(model.rate_limit_errors),
            auth_errors: AtomicI64::new(model.auth_errors),
            usage: AtomicI64::new(model.usage),
            usage_limit: AtomicI64::new(model.usage_limit),
        }
    }

    pub fn secret(&self) -> String {
        self.secret.read().expect("account secret lock").clone()
    }

    pub fn set_secret(&self, secret: String) {
        *self.secret.write().expect("account secret lock") = secret;
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn last_used_at(&self) -> i64 {
        self.last_used_at.load(Ordering::Acquire)
    }

    pub fn touch(&self, now: i64) {
        self.last_used_at.store(now, Ordering::Release);
    }

    /// Claim the account for selection iff nobody moved last_used_at since
    /// `observed`. Concurrent dispatches therefore spread across accounts.
    fn try_claim(&self, observed: i64, now: i64) -> bool {
        self.last_used_at
            .compare_exchange(observed, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStrategy {
    WeightedRandom,
    LeastRecentlyUsed,
    LeastUsed,
}

pub struct AccountRegistry {
    by_id: RwLock<HashMap<i64, Arc<Account>>>,
    by_provider: RwLock<HashMap<i64, Vec<Arc<Account>>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
            by_provider: RwLock::new(HashMap::new()),
        }
    }

    pub async fn replace_all(&self, models: &[accounts::Model]) {
        let mut by_id = HashMap::new();
        let mut by_provider: HashMap<i64, Vec<Arc<Account>>> = HashMap::new();
        for model in models {
            let account = Arc::new(Account::from_model(model));
            by_provider
                .entry(account.provider_id)
                .or_default()
                .push(account.clone());
            by_id.insert(account.id, account);
        }
        *self.by_id.write().await = by_id;
        *self.by_provider.write().await = by_provider;
    }

    pub async fn get(&self, account_id: i64) -> Option<Arc<Account>> {
        self.by_id.read().await.get(&account_id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Account>> {
        self.by_id.read().await.values().cloned().collect()
    }

    pub async fn list_for_provider(&self, provider_id: i64) -> Vec<Arc<Account>> {
        let guard = self.by_provider.read().await;
        guard
            .get(&provider_id)
            .map(|accounts| {
                accounts
                    .iter()
                    .filter(|account| account.enabled())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Health ranking first, then the strategy. Banned accounts never come
    /// back; unhealthy ones only as a last resort when the fallback flag is
    /// set.
    pub async fn pick(
        &self,
        candidates: &[Arc<Account>],
        strategy: PickStrategy,
        health: &HealthMonitor,
        allow_unhealthy_fallback: bool,
        now: i64,
    ) -> Option<Arc<Account>> {
        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        let mut unhealthy = Vec::new();
        for account in candidates {
            match health.status(account.id).await {
                HealthStatus::Healthy => healthy.push(account.clone()),
                HealthStatus::Degraded => degraded.push(account.clone()),
                HealthStatus::Unhealthy => unhealthy.push(account.clone()),
                HealthStatus::Banned => {}
            }
        }
        let tier = if !healthy.is_empty() {
            healthy
        } else if !degraded.is_empty() {
            degraded
        } else if allow_unhealthy_fallback {
            unhealthy
        } else {
            return None;
        };
        if tier.is_empty() {
            return None;
        }
        Some(match strategy {
            PickStrategy::WeightedRandom => {
                let index = rand::thread_rng().gen_range(0..tier.len());
                let account = tier[index].clone();
                account.touch(now);
                account
            }
            PickStrategy::LeastRecentlyUsed => pick_lru(tier, now),
            PickStrategy::LeastUsed => {
                let account = tier
                    .into_iter()
                    .min_by_key(|account| account.total_requests.load(Ordering::Relaxed))
                    .expect("non-empty tier");
                account.touch(now);
                account
            }
        })
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn pick_lru(mut tier: Vec<Arc<Account>>, now: i64) -> Arc<Account> {
    tier.sort_by_key(|account| account.last_used_at());
    // Claim via compare-and-swap so a concurrent dispatch that already took
    // the stalest account pushes this one to the next candidate.
    for account in &tier {
        let observed = account.last_used_at();
        if account.try_claim(observed, now) {
            return account.clone();
        }
    }
    let fallback = tier.remove(0);
    fallback.touch(now);
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, GatewayConfig};
    use crate::error::Outcome;

    fn account_model(id: i64, provider_id: i64) -> accounts::Model {
        accounts::Model {
            id,
            provider_id,
            name: format!("acct-{id}"),
            secret: "sk-test".to_string(),
            enabled: true,
            last_used_at: None,
            total_requests: 0,
            failed_requests: 0,
            rate_limit_errors: 0,
            auth_errors: 0,
            usage: 0,
            usage_limit: 0,
            created_at: 0,
        }
    }

    fn health() -> HealthMonitor {
        HealthMonitor::new(ConfigHandle::new(GatewayConfig::default()))
    }

    #[tokio::test]
    async fn banned_accounts_are_never_picked() {
        let registry = AccountRegistry::new();
        registry
            .replace_all(&[account_model(1, 10), account_model(2, 10)])
            .await;
        let monitor = health();
        monitor.record(1, Outcome::AuthFailed).await;

        let candidates = registry.list_for_provider(10).await;
        for _ in 0..20 {
            let picked = registry
                .pick(&candidates, PickStrategy::WeightedRandom, &monitor, false, 100)
                .await
                .unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[tokio::test]
    async fn unhealthy_only_with_fallback_flag() {
        let registry = AccountRegistry::new();
        registry.replace_all(&[account_model(1, 10)]).await;
        let monitor = HealthMonitor::new(ConfigHandle::new(GatewayConfig {
            degrade_after: 1,
            unhealthy_after: 2,
            ban_after: 99,
            ..GatewayConfig::default()
        }));
        monitor.record(1, Outcome::Upstream5xx).await;
        monitor.record(1, Outcome::Upstream5xx).await;

        let candidates = registry.list_for_provider(10).await;
        let denied = registry
            .pick(&candidates, PickStrategy::LeastUsed, &monitor, false, 100)
            .await;
        assert!(denied.is_none());
        let allowed = registry
            .pick(&candidates, PickStrategy::LeastUsed, &monitor, true, 100)
            .await;
        assert_eq!(allowed.unwrap().id, 1);
    }

    #[tokio::test]
    async fn lru_prefers_stalest_and_claims_atomically() {
        let registry = AccountRegistry::new();
        registry
            .replace_all(&[account_model(1, 10), account_model(2, 10)])
            .await;
        let monitor = health();
        let candidates = registry.list_for_provider(10).await;
        registry.get(1).await.unwrap().touch(50);

        // Account 2 (never used) is stalest.
        let first = registry
            .pick(&candidates, PickStrategy::LeastRecentlyUsed, &monitor, false, 100)
            .await
            .unwrap();
        assert_eq!(first.id, 2);
        // Immediately after, account 1 is stalest.
        let second = registry
            .pick(&candidates, PickStrategy::LeastRecentlyUsed, &monitor, false, 101)
            .await
            .unwrap();
        assert_eq!(second.id, 1);
    }

    #[tokio::test]
    async fn concurrent_lru_picks_take_distinct_accounts() {
        let registry = Arc::new(AccountRegistry::new());
        registry
            .replace_all(&[account_model(1, 10), account_model(2, 10)])
            .await;
        let monitor = Arc::new(health());
        let candidates = registry.list_for_provider(10).await;

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            let monitor = monitor.clone();
            let candidates = candidates.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .pick(
                        &candidates,
                        PickStrategy::LeastRecentlyUsed,
                        &monitor,
                        false,
                        777,
                    )
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut picked = Vec::new();
        for task in tasks {
            picked.push(task.await.unwrap());
        }
        picked.sort_unstable();
        assert_eq!(picked, vec![1, 2]);
    }
}
