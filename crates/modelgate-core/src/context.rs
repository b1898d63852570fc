use std::sync::Arc;

use modelgate_storage::{LogBus, Storage, StorageSnapshot};

use crate::accounts::AccountRegistry;
use crate::config::ConfigHandle;
use crate::dispatch::AdapterRegistry;
use crate::health::HealthMonitor;
use crate::providers::ProviderRegistry;
use crate::ratelimit::RateLimitManager;
use crate::tokens::AccessTokenStore;

/// Root service container created once at process start and passed by
/// reference into request tasks. Teardown aborts background tasks before the
/// storage handle goes away.
pub struct GatewayServices {
    pub config: ConfigHandle,
    pub tokens: AccessTokenStore,
    pub providers: ProviderRegistry,
    pub accounts: AccountRegistry,
    pub health: Arc<HealthMonitor>,
    pub ratelimit: RateLimitManager,
    pub storage: Storage,
    pub log_bus: LogBus,
    pub adapters: AdapterRegistry,
}

impl GatewayServices {
    pub fn new(
        config: ConfigHandle,
        storage: Storage,
        log_bus: LogBus,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            tokens: AccessTokenStore::new(storage.clone()),
            providers: ProviderRegistry::new(),
            accounts: AccountRegistry::new(),
            health: Arc::new(HealthMonitor::new(config.clone())),
            ratelimit: RateLimitManager::new(config.clone()),
            config,
            storage,
            log_bus,
            adapters,
        }
    }

    /// Publish a freshly loaded storage snapshot into every registry.
    pub async fn publish_snapshot(&self, snapshot: &StorageSnapshot) {
        self.tokens
            .replace_all(&snapshot.tokens, &snapshot.users)
            .await;
        self.providers.replace_all(&snapshot.providers);
        self.accounts.replace_all(&snapshot.accounts).await;
    }
}
