use std::time::Duration;

use sea_orm::ActiveValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use tracing::warn;

use crate::entities::request_logs;
use crate::store::Storage;

/// One append-only log row, produced by the dispatcher.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub created_at: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub provider_id: Option<i64>,
    pub account_id: Option<i64>,
    pub model: String,
    pub status: i32,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub error_kind: Option<String>,
}

impl LogRecord {
    fn is_billing(&self) -> bool {
        self.prompt_tokens > 0 || self.completion_tokens > 0
    }

    fn into_active(self) -> request_logs::ActiveModel {
        request_logs::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::Set(self.created_at),
            user_id: ActiveValue::Set(self.user_id),
            token_id: ActiveValue::Set(self.token_id),
            provider_id: ActiveValue::Set(self.provider_id),
            account_id: ActiveValue::Set(self.account_id),
            model: ActiveValue::Set(self.model),
            status: ActiveValue::Set(self.status),
            duration_ms: ActiveValue::Set(self.duration_ms),
            prompt_tokens: ActiveValue::Set(self.prompt_tokens),
            completion_tokens: ActiveValue::Set(self.completion_tokens),
            error_kind: ActiveValue::Set(self.error_kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogBusConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for LogBusConfig {
    fn default() -> Self {
        Self {
            capacity: 8192,
            batch_size: 200,
            flush_interval: Duration::from_millis(500),
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Bounded, batched writer for request logs. Rows carrying token counts are
/// part of the billing trail and always enqueue (backpressure); rows without
/// tokens may be shed under load.
pub struct LogBus {
    tx: mpsc::Sender<LogRecord>,
    _writer: JoinHandle<()>,
}

impl LogBus {
    pub fn spawn(storage: Storage, config: LogBusConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        let writer = tokio::spawn(write_loop(storage, rx, config));
        Self {
            tx,
            _writer: writer,
        }
    }

    pub async fn append(&self, record: LogRecord) {
        if record.is_billing() {
            // Billing rows wait for queue space rather than being dropped.
            if self.tx.send(record).await.is_err() {
                warn!(event = "log_bus_closed", "billing log row lost");
            }
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(record) {
            warn!(event = "log_bus_shed", "non-billing log row dropped under load");
        }
    }
}

async fn write_loop(storage: Storage, mut rx: mpsc::Receiver<LogRecord>, config: LogBusConfig) {
    let mut pending: Vec<LogRecord> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(record) => {
                        pending.push(record);
                        if pending.len() >= config.batch_size {
                            flush(&storage, &mut pending, config.retry_delay).await;
                        }
                    }
                    None => {
                        flush(&storage, &mut pending, config.retry_delay).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&storage, &mut pending, config.retry_delay).await;
            }
        }
    }
}

async fn flush(storage: &Storage, pending: &mut Vec<LogRecord>, retry_delay: Duration) {
    if pending.is_empty() {
        return;
    }
    let rows: Vec<request_logs::ActiveModel> = pending
        .drain(..)
        .map(LogRecord::into_active)
        .collect();
    if let Err(err) = storage.insert_logs(rows.clone()).await {
        warn!(event = "log_flush_retry", error = %err);
        tokio_time::sleep(retry_delay).await;
        if let Err(err) = storage.insert_logs(rows).await {
            warn!(event = "log_flush_failed", error = %err, "request log batch lost");
        }
    }
}
