use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sea_orm::{ActiveValue, EntityTrait};
use tokio::sync::{mpsc, Mutex};

use modelgate_core::{
    hash_key, AdapterRegistry, ChunkStream, ConfigHandle, Dispatcher, GatewayConfig,
    GatewayResponse, GatewayServices, HealthStatus, InboundRequest, Outcome, PickStrategy,
    ProviderAdapter, UpstreamContext, UpstreamError,
};
use modelgate_storage::entities::{access_tokens, accounts, providers, users};
use modelgate_storage::{LogBus, LogBusConfig, Storage};
use modelgate_translate::{CanonicalChunk, CanonicalRequest, ChunkUsage, FinishReason};

enum Script {
    Fail(Outcome),
    Respond(Vec<CanonicalChunk>),
    Handoff(Mutex<Option<mpsc::Receiver<Result<CanonicalChunk, UpstreamError>>>>),
}

/// Scripted stand-in for an upstream: each account has a queue of outcomes.
struct ScriptedAdapter {
    scripts: Mutex<HashMap<i64, Vec<Script>>>,
    calls: Mutex<Vec<i64>>,
}

impl ScriptedAdapter {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn script(&self, account_id: i64, script: Script) {
        self.scripts
            .lock()
            .await
            .entry(account_id)
            .or_default()
            .push(script);
    }

    async fn calls(&self) -> Vec<i64> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    async fn execute(
        &self,
        ctx: &UpstreamContext,
        _request: &CanonicalRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        self.calls.lock().await.push(ctx.account.id);
        let script = {
            let mut scripts = self.scripts.lock().await;
            let queue = scripts.entry(ctx.account.id).or_default();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };
        match script {
            Some(Script::Fail(outcome)) => Err(UpstreamError::new(
                outcome,
                Some(503),
                "scripted failure",
            )),
            Some(Script::Handoff(slot)) => {
                let rx = slot.lock().await.take().expect("handoff consumed twice");
                Ok(ChunkStream { rx })
            }
            other => {
                let chunks = match other {
                    Some(Script::Respond(chunks)) => chunks,
                    _ => default_chunks(),
                };
                let (tx, rx) = mpsc::channel(16);
                for chunk in chunks {
                    let _ = tx.try_send(Ok(chunk));
                }
                Ok(ChunkStream { rx })
            }
        }
    }
}

fn default_chunks() -> Vec<CanonicalChunk> {
    vec![
        CanonicalChunk::text_delta("Hello from upstream"),
        CanonicalChunk::terminal_with(
            FinishReason::Stop,
            Some(ChunkUsage {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
            }),
        ),
    ]
}

struct Harness {
    services: Arc<GatewayServices>,
    adapter: Arc<ScriptedAdapter>,
    storage: Storage,
}

impl Harness {
    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.services.clone())
    }
}

async fn harness(config: GatewayConfig, account_count: usize) -> Harness {
    let storage = Storage::connect("sqlite::memory:").await.unwrap();
    storage.sync_schema().await.unwrap();

    users::Entity::insert(users::ActiveModel {
        id: ActiveValue::Set(1),
        email: ActiveValue::Set("owner@example.com".to_string()),
        role: ActiveValue::Set("user".to_string()),
        total_quota: ActiveValue::Set(-1),
        used_quota: ActiveValue::Set(0),
        enabled: ActiveValue::Set(true),
        created_at: ActiveValue::Set(0),
    })
    .exec(storage.connection())
    .await
    .unwrap();

    access_tokens::Entity::insert(access_tokens::ActiveModel {
        id: ActiveValue::Set(1),
        user_id: ActiveValue::Set(1),
        key_hash: ActiveValue::Set(hash_key("sk-test")),
        name: ActiveValue::Set("test".to_string()),
        status: ActiveValue::Set(1),
        remain_quota: ActiveValue::Set(100_000),
        used_quota: ActiveValue::Set(0),
        expires_at: ActiveValue::Set(-1),
        model_limits: ActiveValue::Set(String::new()),
        ip_allowlist: ActiveValue::Set(String::new()),
        group_name: ActiveValue::Set("default".to_string()),
        cross_group_retry: ActiveValue::Set(false),
        rpm_limit: ActiveValue::Set(0),
        tpm_limit: ActiveValue::Set(0),
        created_at: ActiveValue::Set(0),
    })
    .exec(storage.connection())
    .await
    .unwrap();

    providers::Entity::insert(providers::ActiveModel {
        id: ActiveValue::Set(1),
        name: ActiveValue::Set("primary".to_string()),
        provider_type: ActiveValue::Set("openai".to_string()),
        enabled: ActiveValue::Set(true),
        priority: ActiveValue::Set(1),
        weight: ActiveValue::Set(1),
        models: ActiveValue::Set(r#"["gpt-4o-mini"]"#.to_string()),
        model_mapping: ActiveValue::Set("{}".to_string()),
        base_url: ActiveValue::Set(None),
        group_name: ActiveValue::Set("default".to_string()),
        created_at: ActiveValue::Set(0),
    })
    .exec(storage.connection())
    .await
    .unwrap();

    for id in 1..=account_count as i64 {
        accounts::Entity::insert(accounts::ActiveModel {
            id: ActiveValue::Set(id),
            provider_id: ActiveValue::Set(1),
            name: ActiveValue::Set(format!("acct-{id}")),
            secret: ActiveValue::Set("sk-upstream".to_string()),
            enabled: ActiveValue::Set(true),
            last_used_at: ActiveValue::Set(None),
            total_requests: ActiveValue::Set(0),
            failed_requests: ActiveValue::Set(0),
            rate_limit_errors: ActiveValue::Set(0),
            auth_errors: ActiveValue::Set(0),
            usage: ActiveValue::Set(0),
            usage_limit: ActiveValue::Set(0),
            created_at: ActiveValue::Set(0),
        })
        .exec(storage.connection())
        .await
        .unwrap();
    }

    let adapter = Arc::new(ScriptedAdapter::new());
    let mut adapters = AdapterRegistry::new();
    adapters.register(adapter.clone());

    let log_bus = LogBus::spawn(storage.clone(), LogBusConfig::default());
    let services = Arc::new(GatewayServices::new(
        ConfigHandle::new(config),
        storage.clone(),
        log_bus,
        adapters,
    ));
    let snapshot = storage.load_snapshot().await.unwrap();
    services.publish_snapshot(&snapshot).await;

    Harness {
        services,
        adapter,
        storage,
    }
}

fn openai_request(model: &str, stream: bool) -> InboundRequest {
    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    });
    InboundRequest::OpenAiChat {
        body: Bytes::from(body.to_string()),
    }
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        account_strategy: PickStrategy::LeastRecentlyUsed,
        ..GatewayConfig::default()
    }
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

async fn token_used_quota(storage: &Storage) -> i64 {
    access_tokens::Entity::find_by_id(1)
        .one(storage.connection())
        .await
        .unwrap()
        .unwrap()
        .used_quota
}

#[tokio::test]
async fn simple_passthrough_meters_and_responds() {
    let harness = harness(test_config(), 1).await;
    let response = harness
        .dispatcher()
        .handle(openai_request("gpt-4o-mini", false), "sk-test", localhost())
        .await;

    let GatewayResponse::Json { status, body, .. } = response else {
        panic!("expected a unary response");
    };
    assert_eq!(status.as_u16(), 200);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["object"], "chat.completion");
    assert_eq!(
        parsed["choices"][0]["message"]["content"],
        "Hello from upstream"
    );
    assert_eq!(parsed["usage"]["total_tokens"], 15);

    // Quota debit equals prompt + completion actually observed.
    assert_eq!(token_used_quota(&harness.storage).await, 15);
    let account = harness.services.accounts.get(1).await.unwrap();
    assert_eq!(account.total_requests.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn upstream_5xx_retries_next_account() {
    let harness = harness(test_config(), 2).await;
    harness.adapter.script(1, Script::Fail(Outcome::Upstream5xx)).await;

    let response = harness
        .dispatcher()
        .handle(openai_request("gpt-4o-mini", false), "sk-test", localhost())
        .await;
    let GatewayResponse::Json { status, .. } = response else {
        panic!("expected a unary response");
    };
    assert_eq!(status.as_u16(), 200);
    assert_eq!(harness.adapter.calls().await, vec![1, 2]);

    let report = harness.services.health.report(1).await;
    assert_eq!(report.consecutive_failures, 1);
    let second = harness.services.accounts.get(2).await.unwrap();
    assert_eq!(second.total_requests.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn auth_failure_bans_account_and_retries() {
    let harness = harness(test_config(), 2).await;
    harness.adapter.script(1, Script::Fail(Outcome::AuthFailed)).await;

    let response = harness
        .dispatcher()
        .handle(openai_request("gpt-4o-mini", false), "sk-test", localhost())
        .await;
    let GatewayResponse::Json { status, .. } = response else {
        panic!("expected a unary response");
    };
    assert_eq!(status.as_u16(), 200);
    assert_eq!(
        harness.services.health.status(1).await,
        HealthStatus::Banned
    );
    assert_eq!(harness.adapter.calls().await, vec![1, 2]);
}

#[tokio::test]
async fn model_whitelist_rejects_before_any_account() {
    let harness = harness(test_config(), 1).await;
    access_tokens::Entity::update(access_tokens::ActiveModel {
        id: ActiveValue::Set(1),
        model_limits: ActiveValue::Set("gpt-4o-mini".to_string()),
        ..Default::default()
    })
    .exec(harness.storage.connection())
    .await
    .unwrap();
    let snapshot = harness.storage.load_snapshot().await.unwrap();
    harness.services.publish_snapshot(&snapshot).await;

    let response = harness
        .dispatcher()
        .handle(openai_request("claude-3-opus", false), "sk-test", localhost())
        .await;
    let GatewayResponse::Json { status, body, .. } = response else {
        panic!("expected an error response");
    };
    assert_eq!(status.as_u16(), 403);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "model_not_permitted");
    assert!(harness.adapter.calls().await.is_empty());
    assert_eq!(token_used_quota(&harness.storage).await, 0);
}

#[tokio::test]
async fn token_rpm_limit_returns_retry_after() {
    let mut config = test_config();
    config.default_user_rpm = 2;
    let harness = harness(config, 1).await;

    let mut statuses = Vec::new();
    let mut retry_after = None;
    for _ in 0..3 {
        let response = harness
            .dispatcher()
            .handle(openai_request("gpt-4o-mini", false), "sk-test", localhost())
            .await;
        let GatewayResponse::Json {
            status,
            retry_after: after,
            ..
        } = response
        else {
            panic!("expected a unary response");
        };
        statuses.push(status.as_u16());
        if status.as_u16() == 429 {
            retry_after = after;
        }
    }
    assert_eq!(statuses, vec![200, 200, 429]);
    assert!(retry_after.unwrap() >= 1);
    // Two requests actually reached the upstream.
    assert_eq!(harness.adapter.calls().await.len(), 2);
}

#[tokio::test]
async fn cancelled_stream_commits_partial_usage() {
    let harness = harness(test_config(), 1).await;
    let (tx, rx) = mpsc::channel(4);
    harness
        .adapter
        .script(1, Script::Handoff(Mutex::new(Some(rx))))
        .await;

    tx.send(Ok(CanonicalChunk::text_delta("partial answer ")))
        .await
        .unwrap();

    let response = harness
        .dispatcher()
        .handle(openai_request("gpt-4o-mini", true), "sk-test", localhost())
        .await;
    let GatewayResponse::Stream { status, rx: mut body, .. } = response else {
        panic!("expected a stream response");
    };
    assert_eq!(status.as_u16(), 200);
    let first = body.recv().await.expect("first frame");
    assert!(std::str::from_utf8(&first).unwrap().starts_with("data: "));

    // Client disconnects mid-stream.
    drop(body);
    tx.send(Ok(CanonicalChunk::text_delta("more text")))
        .await
        .unwrap();
    // The pump notices on its next send and commits what was observed.
    let mut committed = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        committed = token_used_quota(&harness.storage).await;
        if committed > 0 {
            break;
        }
    }
    assert!(committed > 0, "partial usage must be committed");
}

#[tokio::test]
async fn exhausted_accounts_fail_with_bad_gateway() {
    let mut config = test_config();
    config.max_attempts = 2;
    let harness = harness(config, 2).await;
    harness.adapter.script(1, Script::Fail(Outcome::Upstream5xx)).await;
    harness.adapter.script(2, Script::Fail(Outcome::Timeout)).await;

    let response = harness
        .dispatcher()
        .handle(openai_request("gpt-4o-mini", false), "sk-test", localhost())
        .await;
    let GatewayResponse::Json { status, body, .. } = response else {
        panic!("expected an error response");
    };
    assert_eq!(status.as_u16(), 502);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "upstream_timeout");
}

#[tokio::test]
async fn unknown_model_is_service_unavailable() {
    let harness = harness(test_config(), 1).await;
    let response = harness
        .dispatcher()
        .handle(openai_request("no-such-model", false), "sk-test", localhost())
        .await;
    let GatewayResponse::Json { status, body, .. } = response else {
        panic!("expected an error response");
    };
    assert_eq!(status.as_u16(), 503);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "no_provider_available");
}
