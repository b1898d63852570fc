use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use time::OffsetDateTime;
use tracing::{info, warn};

use modelgate_core::GatewayServices;
use modelgate_upstream::KiroAdapter;

const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Nominal usage-refresh cadence; each round is jittered to 80-120%.
const USAGE_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub(crate) fn spawn_background(services: Arc<GatewayServices>, kiro: Arc<KiroAdapter>) {
    let _sweeper = services
        .health
        .clone()
        .spawn_sweeper(HEALTH_SWEEP_INTERVAL);
    tokio::spawn(token_status_sweep(services.clone()));
    tokio::spawn(usage_refresh(services, kiro));
}

/// Flip overdue tokens to expired and drained ones to exhausted, then
/// republish the snapshot so the in-memory store follows the database.
async fn token_status_sweep(services: Arc<GatewayServices>) {
    let mut ticker = tokio::time::interval(TOKEN_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        match services.storage.sweep_token_statuses(now).await {
            Ok(changed) if !changed.is_empty() => {
                info!(event = "token_sweep", changed = changed.len());
                match services.storage.load_snapshot().await {
                    Ok(snapshot) => services.publish_snapshot(&snapshot).await,
                    Err(err) => warn!(event = "snapshot_reload_failed", error = %err),
                }
            }
            Ok(_) => {}
            Err(err) => warn!(event = "token_sweep_failed", error = %err),
        }
    }
}

/// Best-effort refresh of the provider-reported usage/limit pair for
/// device-flow accounts. Failures are logged and never touch health.
async fn usage_refresh(services: Arc<GatewayServices>, kiro: Arc<KiroAdapter>) {
    loop {
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let delay = USAGE_REFRESH_INTERVAL.mul_f64(jitter);
        tokio::time::sleep(delay).await;

        let kiro_provider_ids: Vec<i64> = services
            .providers
            .snapshot()
            .iter()
            .filter(|provider| provider.provider_type == "kiro")
            .map(|provider| provider.id)
            .collect();
        for provider_id in kiro_provider_ids {
            for account in services.accounts.list_for_provider(provider_id).await {
                match kiro.fetch_usage(&account).await {
                    Ok((used, limit)) => {
                        account.usage.store(used, Ordering::Relaxed);
                        account.usage_limit.store(limit, Ordering::Relaxed);
                        if let Err(err) = services
                            .storage
                            .set_account_usage(account.id, used, limit)
                            .await
                        {
                            warn!(
                                event = "usage_persist_failed",
                                account_id = account.id,
                                error = %err
                            );
                        }
                    }
                    Err(err) => warn!(
                        event = "usage_refresh_failed",
                        account_id = account.id,
                        error = %err
                    ),
                }
            }
        }
    }
}
