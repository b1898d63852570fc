use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ConfigHandle;
use crate::error::Outcome;

const FAILURE_WINDOW: Duration = Duration::from_secs(3600);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl HealthStatus {
    pub fn risk(&self) -> RiskLevel {
        match self {
            HealthStatus::Healthy => RiskLevel::Low,
            HealthStatus::Degraded => RiskLevel::Medium,
            HealthStatus::Unhealthy => RiskLevel::High,
            HealthStatus::Banned => RiskLevel::Critical,
        }
    }
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    consecutive_failures: u32,
    rate_limit_errors: u64,
    auth_errors: u64,
    client_errors: u64,
    last_outcome: Option<Outcome>,
    last_transition: Instant,
    cooldown_until: Option<Instant>,
    /// (at, failed) pairs inside FAILURE_WINDOW.
    window: VecDeque<(Instant, bool)>,
    rate_limit_hits: VecDeque<Instant>,
}

impl HealthState {
    fn new(now: Instant) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            rate_limit_errors: 0,
            auth_errors: 0,
            client_errors: 0,
            last_outcome: None,
            last_transition: now,
            cooldown_until: None,
            window: VecDeque::new(),
            rate_limit_hits: VecDeque::new(),
        }
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.window.front() {
            if now.saturating_duration_since(at) > FAILURE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while let Some(&at) = self.rate_limit_hits.front() {
            if now.saturating_duration_since(at) > RATE_LIMIT_WINDOW {
                self.rate_limit_hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn recent_failure_rate(&mut self, now: Instant) -> f64 {
        self.trim(now);
        if self.window.is_empty() {
            return 0.0;
        }
        let failed = self.window.iter().filter(|(_, failed)| *failed).count();
        failed as f64 / self.window.len() as f64
    }

    fn transition(&mut self, account_id: i64, status: HealthStatus, now: Instant) {
        if self.status == status {
            return;
        }
        info!(
            event = "account_health_transition",
            account_id,
            from = ?self.status,
            to = ?status
        );
        self.status = status;
        self.last_transition = now;
    }
}

/// Snapshot of one account's health, for admin/status surfaces.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub account_id: i64,
    pub status: HealthStatus,
    pub risk: RiskLevel,
    pub consecutive_failures: u32,
    pub rate_limit_errors: u64,
    pub auth_errors: u64,
    pub cooldown_remaining: Option<Duration>,
}

/// Authoritative map of account id -> health state. Accounts carry only
/// their id; every transition decision lives here.
pub struct HealthMonitor {
    config: ConfigHandle,
    states: RwLock<HashMap<i64, Arc<RwLock<HealthState>>>>,
}

impl HealthMonitor {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    async fn state(&self, account_id: i64) -> Arc<RwLock<HealthState>> {
        {
            let guard = self.states.read().await;
            if let Some(state) = guard.get(&account_id) {
                return state.clone();
            }
        }
        let mut guard = self.states.write().await;
        guard
            .entry(account_id)
            .or_insert_with(|| Arc::new(RwLock::new(HealthState::new(Instant::now()))))
            .clone()
    }

    pub async fn record(&self, account_id: i64, outcome: Outcome) {
        let config = self.config.load();
        let state = self.state(account_id).await;
        let mut state = state.write().await;
        let now = Instant::now();
        state.last_outcome = Some(outcome);

        match outcome {
            Outcome::Success => {
                state.consecutive_failures = 0;
                state.window.push_back((now, false));
                if state.status == HealthStatus::Degraded
                    && state.recent_failure_rate(now) < config.recover_threshold
                {
                    state.cooldown_until = None;
                    state.transition(account_id, HealthStatus::Healthy, now);
                }
            }
            Outcome::RateLimited => {
                state.rate_limit_errors += 1;
                state.rate_limit_hits.push_back(now);
                state.window.push_back((now, true));
                state.trim(now);
                if state.rate_limit_hits.len() as u32 >= config.rate_limit_degrade_threshold {
                    state.cooldown_until = Some(now + config.rate_limit_cooldown());
                    state.transition(account_id, HealthStatus::Degraded, now);
                }
            }
            Outcome::AuthFailed => {
                state.auth_errors += 1;
                state.window.push_back((now, true));
                state.cooldown_until = Some(now + config.auth_ban_duration());
                warn!(event = "account_banned", account_id, reason = "auth_failed");
                state.transition(account_id, HealthStatus::Banned, now);
            }
            Outcome::Upstream5xx | Outcome::Timeout => {
                state.consecutive_failures += 1;
                state.window.push_back((now, true));
                let failures = state.consecutive_failures;
                if failures >= config.ban_after {
                    state.cooldown_until = Some(now + config.failure_ban_duration());
                    warn!(event = "account_banned", account_id, reason = "failures");
                    state.transition(account_id, HealthStatus::Banned, now);
                } else if failures >= config.unhealthy_after {
                    state.transition(account_id, HealthStatus::Unhealthy, now);
                } else if failures >= config.degrade_after {
                    state.transition(account_id, HealthStatus::Degraded, now);
                }
            }
            Outcome::ClientError => {
                state.client_errors += 1;
            }
        }
    }

    pub async fn status(&self, account_id: i64) -> HealthStatus {
        let guard = self.states.read().await;
        match guard.get(&account_id) {
            Some(state) => state.read().await.status,
            None => HealthStatus::Healthy,
        }
    }

    pub async fn report(&self, account_id: i64) -> HealthReport {
        let state = self.state(account_id).await;
        let state = state.read().await;
        let now = Instant::now();
        HealthReport {
            account_id,
            status: state.status,
            risk: state.status.risk(),
            consecutive_failures: state.consecutive_failures,
            rate_limit_errors: state.rate_limit_errors,
            auth_errors: state.auth_errors,
            cooldown_remaining: state
                .cooldown_until
                .map(|until| until.saturating_duration_since(now)),
        }
    }

    /// Administrator override: force a status, optionally with a cooldown.
    pub async fn force(
        &self,
        account_id: i64,
        status: HealthStatus,
        cooldown: Option<Duration>,
    ) {
        let state = self.state(account_id).await;
        let mut state = state.write().await;
        let now = Instant::now();
        state.cooldown_until = cooldown.map(|cooldown| now + cooldown);
        if status == HealthStatus::Healthy {
            state.consecutive_failures = 0;
            state.cooldown_until = None;
        }
        state.transition(account_id, status, now);
    }

    /// Timed recovery pass: once a cooldown elapses and the sliding-window
    /// failure rate has decayed, step the account down one level per sweep.
    pub async fn sweep(&self) {
        let config = self.config.load();
        let states: Vec<(i64, Arc<RwLock<HealthState>>)> = {
            let guard = self.states.read().await;
            guard
                .iter()
                .map(|(id, state)| (*id, state.clone()))
                .collect()
        };
        let now = Instant::now();
        for (account_id, state) in states {
            let mut state = state.write().await;
            let cooled = match state.cooldown_until {
                Some(until) => now >= until,
                None => true,
            };
            if !cooled {
                continue;
            }
            let rate = state.recent_failure_rate(now);
            match state.status {
                HealthStatus::Banned => {
                    state.cooldown_until = None;
                    state.consecutive_failures = 0;
                    state.transition(account_id, HealthStatus::Unhealthy, now);
                }
                HealthStatus::Unhealthy if rate < config.recover_threshold => {
                    state.consecutive_failures = 0;
                    state.transition(account_id, HealthStatus::Degraded, now);
                }
                HealthStatus::Degraded if rate < config.recover_threshold => {
                    state.transition(account_id, HealthStatus::Healthy, now);
                }
                _ => {}
            }
        }
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn monitor(config: GatewayConfig) -> HealthMonitor {
        HealthMonitor::new(ConfigHandle::new(config))
    }

    #[tokio::test]
    async fn consecutive_failures_walk_down_the_ladder() {
        let monitor = monitor(GatewayConfig {
            degrade_after: 2,
            unhealthy_after: 3,
            ban_after: 4,
            ..GatewayConfig::default()
        });
        monitor.record(1, Outcome::Upstream5xx).await;
        assert_eq!(monitor.status(1).await, HealthStatus::Healthy);
        monitor.record(1, Outcome::Upstream5xx).await;
        assert_eq!(monitor.status(1).await, HealthStatus::Degraded);
        monitor.record(1, Outcome::Timeout).await;
        assert_eq!(monitor.status(1).await, HealthStatus::Unhealthy);
        monitor.record(1, Outcome::Upstream5xx).await;
        assert_eq!(monitor.status(1).await, HealthStatus::Banned);
    }

    #[tokio::test]
    async fn auth_failure_bans_immediately() {
        let monitor = monitor(GatewayConfig::default());
        monitor.record(9, Outcome::AuthFailed).await;
        let report = monitor.report(9).await;
        assert_eq!(report.status, HealthStatus::Banned);
        assert_eq!(report.risk, RiskLevel::Critical);
        assert!(report.cooldown_remaining.unwrap() > Duration::from_secs(86_000));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let monitor = monitor(GatewayConfig {
            degrade_after: 2,
            ..GatewayConfig::default()
        });
        monitor.record(3, Outcome::Upstream5xx).await;
        monitor.record(3, Outcome::Success).await;
        monitor.record(3, Outcome::Upstream5xx).await;
        // Reset in between: one failure is below the degrade threshold.
        assert_eq!(monitor.status(3).await, HealthStatus::Healthy);
        assert_eq!(monitor.report(3).await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn client_errors_do_not_affect_health() {
        let monitor = monitor(GatewayConfig {
            degrade_after: 1,
            ..GatewayConfig::default()
        });
        for _ in 0..10 {
            monitor.record(4, Outcome::ClientError).await;
        }
        assert_eq!(monitor.status(4).await, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_steps_banned_account_down_after_cooldown() {
        let monitor = monitor(GatewayConfig {
            auth_ban_duration_secs: 10,
            ..GatewayConfig::default()
        });
        monitor.record(5, Outcome::AuthFailed).await;
        monitor.sweep().await;
        assert_eq!(monitor.status(5).await, HealthStatus::Banned);

        tokio::time::advance(Duration::from_secs(11)).await;
        monitor.sweep().await;
        assert_eq!(monitor.status(5).await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn rate_limit_burst_degrades_with_cooldown() {
        let monitor = monitor(GatewayConfig {
            rate_limit_degrade_threshold: 3,
            rate_limit_cooldown_secs: 60,
            ..GatewayConfig::default()
        });
        monitor.record(6, Outcome::RateLimited).await;
        monitor.record(6, Outcome::RateLimited).await;
        assert_eq!(monitor.status(6).await, HealthStatus::Healthy);
        monitor.record(6, Outcome::RateLimited).await;
        let report = monitor.report(6).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.cooldown_remaining.is_some());
    }
}
