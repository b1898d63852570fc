use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::accounts::PickStrategy;
use crate::compress::CompressionStrategy;
use crate::estimator::EstimatorWeights;

/// Runtime-tunable gateway settings. Request tasks load one snapshot at
/// entry and keep it for the whole request; replacing the snapshot is the
/// hot-reload path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Dispatcher retry cap across accounts.
    pub max_attempts: u32,
    /// Global bucket limits; 0 disables the layer.
    pub global_rpm: u32,
    pub global_tpm: u32,
    /// Fallbacks for access tokens whose own limits are 0.
    pub default_user_rpm: u32,
    pub default_user_tpm: u32,
    /// Per-account bucket limits; 0 disables the layer.
    pub account_rpm: u32,
    pub account_tpm: u32,
    /// Consecutive-failure thresholds.
    pub degrade_after: u32,
    pub unhealthy_after: u32,
    pub ban_after: u32,
    /// Rate-limit hits per minute that degrade an account.
    pub rate_limit_degrade_threshold: u32,
    pub rate_limit_cooldown_secs: u64,
    pub auth_ban_duration_secs: u64,
    pub failure_ban_duration_secs: u64,
    /// Recent-failure-rate ceiling for degraded -> healthy recovery.
    pub recover_threshold: f64,
    pub allow_unhealthy_fallback: bool,
    pub account_strategy: PickStrategy,
    pub connect_timeout_secs: u64,
    pub first_byte_timeout_secs: u64,
    pub between_chunks_timeout_secs: u64,
    /// Conversation compression ahead of dispatch; disabled by default.
    pub context_compression_enabled: bool,
    pub context_compression_threshold: u32,
    pub context_compression_target: u32,
    pub context_compression_strategy: CompressionStrategy,
    pub token_estimator_weights: EstimatorWeights,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            global_rpm: 0,
            global_tpm: 0,
            default_user_rpm: 60,
            default_user_tpm: 90_000,
            account_rpm: 0,
            account_tpm: 0,
            degrade_after: 3,
            unhealthy_after: 6,
            ban_after: 10,
            rate_limit_degrade_threshold: 5,
            rate_limit_cooldown_secs: 3600,
            auth_ban_duration_secs: 86_400,
            failure_ban_duration_secs: 1800,
            recover_threshold: 0.1,
            allow_unhealthy_fallback: false,
            account_strategy: PickStrategy::WeightedRandom,
            connect_timeout_secs: 5,
            first_byte_timeout_secs: 30,
            between_chunks_timeout_secs: 30,
            context_compression_enabled: false,
            context_compression_threshold: 8000,
            context_compression_target: 4000,
            context_compression_strategy: CompressionStrategy::SlidingWindow,
            token_estimator_weights: EstimatorWeights::default(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_secs)
    }

    pub fn between_chunks_timeout(&self) -> Duration {
        Duration::from_secs(self.between_chunks_timeout_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn auth_ban_duration(&self) -> Duration {
        Duration::from_secs(self.auth_ban_duration_secs)
    }

    pub fn failure_ban_duration(&self) -> Duration {
        Duration::from_secs(self.failure_ban_duration_secs)
    }
}

/// Copy-on-write handle shared by every service.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<GatewayConfig>>,
}

impl ConfigHandle {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn load(&self) -> Arc<GatewayConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, config: GatewayConfig) {
        self.inner.store(Arc::new(config));
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}
