use std::collections::HashMap;
use std::sync::Mutex;

use crate::bucket::TokenBucket;
use crate::config::ConfigHandle;

/// Which layer refused admission. Token and global denials fail the request;
/// account denials make the dispatcher skip to another account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLayer {
    Global,
    Account,
    AccessToken,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDenial {
    pub layer: RateLayer,
    /// Smallest time-to-next-token across the denying buckets, for
    /// `Retry-After`.
    pub retry_after_secs: u64,
}

/// Pre-charge receipt; settled exactly once via `reconcile` or `refund`.
#[derive(Debug, Clone, Copy)]
pub struct RateCharge {
    account_id: i64,
    token_id: i64,
    estimated_tokens: u32,
}

/// Per-token limits resolved by the access-token store; zero means the user
/// default applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenLimits {
    pub rpm: u32,
    pub tpm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BucketKey {
    GlobalRpm,
    GlobalTpm,
    AccountRpm(i64),
    AccountTpm(i64),
    TokenRpm(i64),
    TokenTpm(i64),
}

/// Composes the global, per-account, and per-token bucket layers. All three
/// must admit; pre-charges roll back when a later layer denies.
pub struct RateLimitManager {
    config: ConfigHandle,
    buckets: Mutex<HashMap<BucketKey, TokenBucket>>,
}

impl RateLimitManager {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(
        &self,
        account_id: i64,
        token_id: i64,
        token_limits: TokenLimits,
        estimated_tokens: u32,
    ) -> Result<RateCharge, RateDenial> {
        let config = self.config.load();
        let token_rpm = if token_limits.rpm > 0 {
            token_limits.rpm
        } else {
            config.default_user_rpm
        };
        let token_tpm = if token_limits.tpm > 0 {
            token_limits.tpm
        } else {
            config.default_user_tpm
        };

        // (key, limit, amount, layer) in admission order; zero-limit layers
        // are disabled.
        let plan = [
            (BucketKey::GlobalRpm, config.global_rpm, 1, RateLayer::Global),
            (
                BucketKey::GlobalTpm,
                config.global_tpm,
                estimated_tokens,
                RateLayer::Global,
            ),
            (
                BucketKey::AccountRpm(account_id),
                config.account_rpm,
                1,
                RateLayer::Account,
            ),
            (
                BucketKey::AccountTpm(account_id),
                config.account_tpm,
                estimated_tokens,
                RateLayer::Account,
            ),
            (
                BucketKey::TokenRpm(token_id),
                token_rpm,
                1,
                RateLayer::AccessToken,
            ),
            (
                BucketKey::TokenTpm(token_id),
                token_tpm,
                estimated_tokens,
                RateLayer::AccessToken,
            ),
        ];

        let mut buckets = self.buckets.lock().expect("rate bucket lock poisoned");
        let mut charged: Vec<(BucketKey, u32)> = Vec::new();
        for (key, limit, amount, layer) in plan {
            if limit == 0 || amount == 0 {
                continue;
            }
            let bucket = buckets
                .entry(key)
                .or_insert_with(|| TokenBucket::per_minute(limit));
            if bucket.try_consume(amount) {
                charged.push((key, amount));
                continue;
            }
            let retry_after_secs = bucket.time_to_available(amount).max(1);
            for (key, amount) in charged {
                if let Some(bucket) = buckets.get_mut(&key) {
                    bucket.refund(amount);
                }
            }
            return Err(RateDenial {
                layer,
                retry_after_secs,
            });
        }

        Ok(RateCharge {
            account_id,
            token_id,
            estimated_tokens,
        })
    }

    /// Settle the TPM pre-charge against the actual token count. The RPM
    /// charge stands; only the token delta moves.
    pub fn reconcile(&self, charge: RateCharge, actual_tokens: u32) {
        let mut buckets = self.buckets.lock().expect("rate bucket lock poisoned");
        let keys = [
            BucketKey::GlobalTpm,
            BucketKey::AccountTpm(charge.account_id),
            BucketKey::TokenTpm(charge.token_id),
        ];
        for key in keys {
            if let Some(bucket) = buckets.get_mut(&key) {
                if actual_tokens > charge.estimated_tokens {
                    bucket.force_consume(actual_tokens - charge.estimated_tokens);
                } else {
                    bucket.refund(charge.estimated_tokens - actual_tokens);
                }
            }
        }
    }

    /// Roll back the whole pre-charge after a failure before any chunk was
    /// delivered.
    pub fn refund(&self, charge: RateCharge) {
        let mut buckets = self.buckets.lock().expect("rate bucket lock poisoned");
        let rpm_keys = [
            BucketKey::GlobalRpm,
            BucketKey::AccountRpm(charge.account_id),
            BucketKey::TokenRpm(charge.token_id),
        ];
        for key in rpm_keys {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.refund(1);
            }
        }
        let tpm_keys = [
            BucketKey::GlobalTpm,
            BucketKey::AccountTpm(charge.account_id),
            BucketKey::TokenTpm(charge.token_id),
        ];
        for key in tpm_keys {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.refund(charge.estimated_tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn manager(config: GatewayConfig) -> RateLimitManager {
        RateLimitManager::new(ConfigHandle::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn token_layer_denies_third_request_in_burst() {
        let limiter = manager(GatewayConfig::default());
        let limits = TokenLimits { rpm: 2, tpm: 0 };
        assert!(limiter.check(1, 7, limits, 10).is_ok());
        assert!(limiter.check(1, 7, limits, 10).is_ok());
        let denial = limiter.check(1, 7, limits, 10).unwrap_err();
        assert_eq!(denial.layer, RateLayer::AccessToken);
        assert!(denial.retry_after_secs >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn account_denial_does_not_leak_global_charge() {
        let config = GatewayConfig {
            global_rpm: 10,
            account_rpm: 1,
            ..GatewayConfig::default()
        };
        let limiter = manager(config);
        let limits = TokenLimits::default();
        assert!(limiter.check(5, 7, limits, 1).is_ok());
        let denial = limiter.check(5, 7, limits, 1).unwrap_err();
        assert_eq!(denial.layer, RateLayer::Account);
        // A different account still has the global budget the denial refunded.
        for _ in 0..9 {
            assert!(limiter.check(6, 7, limits, 1).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_refunds_overestimate() {
        let config = GatewayConfig {
            default_user_tpm: 100,
            ..GatewayConfig::default()
        };
        let limiter = manager(config);
        let limits = TokenLimits::default();
        let charge = limiter.check(1, 7, limits, 80).unwrap();
        limiter.reconcile(charge, 30);
        // 50 refunded: another 70-token request must fit.
        assert!(limiter.check(1, 7, limits, 70).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn refund_restores_request_slot() {
        let limiter = manager(GatewayConfig::default());
        let limits = TokenLimits { rpm: 1, tpm: 0 };
        let charge = limiter.check(1, 7, limits, 5).unwrap();
        limiter.refund(charge);
        assert!(limiter.check(1, 7, limits, 5).is_ok());
    }
}
