use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use modelgate_translate::{
    claude, gemini, openai, CanonicalChunk, CanonicalRequest, ChunkAccumulator, Dialect,
    TranslateError,
};

use crate::accounts::Account;
use crate::context::GatewayServices;
use crate::error::{ErrorKind, GatewayError, Outcome};
use crate::meter::{settle_usage, LogRow, SettledUsage};
use crate::providers::Provider;
use crate::ratelimit::{RateCharge, RateLayer};
use crate::tokens::{AccessToken, User};

/// Upstream failure translated into the canonical outcome taxonomy.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub outcome: Outcome,
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(outcome: Outcome, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            outcome,
            status,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream {status}: {}", self.message),
            None => write!(f, "upstream: {}", self.message),
        }
    }
}

/// Lazy finite chunk sequence. Dropping the receiver cancels the producer,
/// which closes the upstream connection within one round-trip.
pub struct ChunkStream {
    pub rx: mpsc::Receiver<Result<CanonicalChunk, UpstreamError>>,
}

/// Everything an adapter needs for one upstream call.
pub struct UpstreamContext {
    pub provider: Arc<Provider>,
    pub account: Arc<Account>,
    pub upstream_model: String,
    pub trace_id: String,
}

/// One implementation per provider type; the dispatcher only ever talks to
/// this interface.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> &'static str;

    /// Begin the upstream call. An `Err` here means nothing reached the
    /// caller yet and the dispatcher may retry on another account.
    async fn execute(
        &self,
        ctx: &UpstreamContext,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, UpstreamError>;
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_type(), adapter);
    }

    pub fn get(&self, provider_type: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_type).cloned()
    }
}

/// Inbound request body plus what the route already knows about it.
pub enum InboundRequest {
    OpenAiChat { body: Bytes },
    ClaudeMessages { body: Bytes },
    GeminiGenerate { model: String, stream: bool, body: Bytes },
}

impl InboundRequest {
    pub fn dialect(&self) -> Dialect {
        match self {
            InboundRequest::OpenAiChat { .. } => Dialect::OpenAi,
            InboundRequest::ClaudeMessages { .. } => Dialect::Claude,
            InboundRequest::GeminiGenerate { .. } => Dialect::Gemini,
        }
    }
}

pub enum GatewayResponse {
    Json {
        status: StatusCode,
        body: Bytes,
        retry_after: Option<u64>,
    },
    Stream {
        status: StatusCode,
        content_type: &'static str,
        rx: mpsc::Receiver<Bytes>,
    },
}

impl GatewayResponse {
    fn error(dialect: Dialect, error: &GatewayError, retry_after: Option<u64>) -> Self {
        let (status, body) = error.render(dialect);
        GatewayResponse::Json {
            status,
            body,
            retry_after,
        }
    }
}

enum DialectStreamRenderer {
    OpenAi(openai::StreamRenderer),
    Claude(claude::StreamRenderer),
    Gemini(gemini::StreamRenderer),
}

impl DialectStreamRenderer {
    fn new(dialect: Dialect, model: &str, response_id: &str, created: i64) -> Self {
        match dialect {
            Dialect::OpenAi => DialectStreamRenderer::OpenAi(openai::StreamRenderer::new(
                format!("chatcmpl-{response_id}"),
                model,
                created,
            )),
            Dialect::Claude => DialectStreamRenderer::Claude(claude::StreamRenderer::new(
                format!("msg_{response_id}"),
                model,
            )),
            Dialect::Gemini => DialectStreamRenderer::Gemini(gemini::StreamRenderer::new(model)),
        }
    }

    fn push(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        match self {
            DialectStreamRenderer::OpenAi(renderer) => renderer.push(chunk),
            DialectStreamRenderer::Claude(renderer) => renderer.push(chunk),
            DialectStreamRenderer::Gemini(renderer) => renderer.push(chunk),
        }
    }

    fn abort(&mut self, message: &str) -> Vec<Bytes> {
        match self {
            DialectStreamRenderer::OpenAi(renderer) => renderer.abort(message),
            DialectStreamRenderer::Claude(renderer) => renderer.abort(message),
            DialectStreamRenderer::Gemini(renderer) => renderer.abort(message),
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            DialectStreamRenderer::OpenAi(renderer) => renderer.content_type(),
            DialectStreamRenderer::Claude(renderer) => renderer.content_type(),
            DialectStreamRenderer::Gemini(renderer) => renderer.content_type(),
        }
    }
}

/// The request-dispatch state machine: authorize, parse, resolve, then the
/// attempt loop with rate gating, health-aware account selection, streaming
/// execution, metering, and the append-only log row.
pub struct Dispatcher {
    services: Arc<GatewayServices>,
}

struct RequestMeta {
    trace_id: String,
    dialect: Dialect,
    started: Instant,
    started_epoch: i64,
    token: AccessToken,
    user: User,
    model: String,
    estimate: u32,
    /// Config snapshot captured at request entry; the commit-time estimator
    /// must see the same weight table as the authorize-time one.
    config: Arc<crate::config::GatewayConfig>,
}

impl Dispatcher {
    pub fn new(services: Arc<GatewayServices>) -> Self {
        Self { services }
    }

    pub async fn handle(
        &self,
        inbound: InboundRequest,
        bearer_key: &str,
        client_ip: IpAddr,
    ) -> GatewayResponse {
        let services = &self.services;
        let config = services.config.load();
        let dialect = inbound.dialect();
        let trace_id = Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        let started_epoch = OffsetDateTime::now_utc().unix_timestamp();

        let (token, user) = match services
            .tokens
            .authorize_key(bearer_key, client_ip, started_epoch)
            .await
        {
            Ok(pair) => pair,
            Err(error) => {
                info!(
                    event = "request_rejected",
                    trace_id = %trace_id,
                    dialect = dialect.as_str(),
                    code = error.kind.code()
                );
                return GatewayResponse::error(dialect, &error, None);
            }
        };

        let mut canonical = match parse_inbound(inbound) {
            Ok(canonical) => canonical,
            Err(translate_error) => {
                let error = translate_to_gateway(translate_error);
                self.log_reject(&token, &user, "", &error, started_epoch, started)
                    .await;
                return GatewayResponse::error(dialect, &error, None);
            }
        };

        // Long conversations shrink before estimation, so the pre-charge and
        // quota check see the prompt that actually goes upstream.
        let compression = crate::compress::compress_if_needed(&mut canonical, &config);
        if compression.compressed {
            info!(
                event = "context_compressed",
                trace_id = %trace_id,
                model = %canonical.model,
                original_tokens = compression.original_tokens,
                compressed_tokens = compression.compressed_tokens
            );
        }

        let estimate =
            crate::estimator::estimate_request(&canonical, &config.token_estimator_weights);

        if let Err(error) = services
            .tokens
            .authorize_request(&token, &canonical.model, estimate)
        {
            self.log_reject(&token, &user, &canonical.model, &error, started_epoch, started)
                .await;
            return GatewayResponse::error(dialect, &error, None);
        }

        let candidates = services.providers.resolve(
            &canonical.model,
            &token.group,
            token.cross_group_retry,
        );
        if candidates.is_empty() {
            let error = GatewayError::new(
                ErrorKind::NoProviderAvailable,
                format!("no available provider for model {}", canonical.model),
            );
            self.log_reject(&token, &user, &canonical.model, &error, started_epoch, started)
                .await;
            return GatewayResponse::error(dialect, &error, None);
        }

        let meta = RequestMeta {
            trace_id,
            dialect,
            started,
            started_epoch,
            token,
            user,
            model: canonical.model.clone(),
            estimate,
            config,
        };
        info!(
            event = "request_accepted",
            trace_id = %meta.trace_id,
            dialect = dialect.as_str(),
            model = %meta.model,
            stream = canonical.stream,
            estimate
        );

        self.attempt_loop(meta, canonical, candidates).await
    }

    async fn attempt_loop(
        &self,
        meta: RequestMeta,
        canonical: CanonicalRequest,
        candidates: Vec<Arc<Provider>>,
    ) -> GatewayResponse {
        let services = &self.services;
        let config = meta.config.clone();
        let mut attempts = 0u32;
        let mut tried: HashSet<i64> = HashSet::new();
        let mut last_error = GatewayError::new(
            ErrorKind::NoProviderAvailable,
            "all candidate accounts were unavailable",
        );

        'providers: for provider in candidates {
            let Some(adapter) = services.adapters.get(&provider.provider_type) else {
                warn!(
                    event = "adapter_missing",
                    provider = %provider.name,
                    provider_type = %provider.provider_type
                );
                continue;
            };

            loop {
                if attempts >= config.max_attempts {
                    break 'providers;
                }
                let pool: Vec<Arc<Account>> = services
                    .accounts
                    .list_for_provider(provider.id)
                    .await
                    .into_iter()
                    .filter(|account| !tried.contains(&account.id))
                    .collect();
                let Some(account) = services
                    .accounts
                    .pick(
                        &pool,
                        config.account_strategy,
                        &services.health,
                        config.allow_unhealthy_fallback,
                        meta.started_epoch,
                    )
                    .await
                else {
                    continue 'providers;
                };
                tried.insert(account.id);
                attempts += 1;

                let charge = match services.ratelimit.check(
                    account.id,
                    meta.token.id,
                    meta.token.limits(),
                    meta.estimate,
                ) {
                    Ok(charge) => charge,
                    Err(denial) if denial.layer == RateLayer::Account => {
                        // Account bucket saturated: skip, not a health event.
                        continue;
                    }
                    Err(denial) => {
                        let error = GatewayError::kind(ErrorKind::RateLimited);
                        self.log_reject(
                            &meta.token,
                            &meta.user,
                            &meta.model,
                            &error,
                            meta.started_epoch,
                            meta.started,
                        )
                        .await;
                        return GatewayResponse::error(
                            meta.dialect,
                            &error,
                            Some(denial.retry_after_secs),
                        );
                    }
                };

                let ctx = UpstreamContext {
                    provider: provider.clone(),
                    account: account.clone(),
                    upstream_model: provider.upstream_model(&meta.model).to_string(),
                    trace_id: meta.trace_id.clone(),
                };

                let executed =
                    tokio::time::timeout(config.first_byte_timeout(), adapter.execute(&ctx, &canonical))
                        .await;
                let mut stream = match executed {
                    Err(_) => {
                        last_error = self
                            .attempt_failed(
                                &meta,
                                &account,
                                charge,
                                UpstreamError::new(
                                    Outcome::Timeout,
                                    None,
                                    "timed out connecting upstream",
                                ),
                            )
                            .await;
                        continue;
                    }
                    Ok(Err(upstream_error)) => {
                        let retryable = upstream_error.outcome.is_retryable();
                        last_error = self
                            .attempt_failed(&meta, &account, charge, upstream_error)
                            .await;
                        if retryable {
                            continue;
                        }
                        break 'providers;
                    }
                    Ok(Ok(stream)) => stream,
                };

                let first = tokio::time::timeout(config.first_byte_timeout(), stream.rx.recv()).await;
                let first_chunk = match first {
                    Err(_) => {
                        last_error = self
                            .attempt_failed(
                                &meta,
                                &account,
                                charge,
                                UpstreamError::new(
                                    Outcome::Timeout,
                                    None,
                                    "timed out waiting for first byte",
                                ),
                            )
                            .await;
                        continue;
                    }
                    Ok(None) => {
                        last_error = self
                            .attempt_failed(
                                &meta,
                                &account,
                                charge,
                                UpstreamError::new(
                                    Outcome::Upstream5xx,
                                    None,
                                    "upstream closed before the first chunk",
                                ),
                            )
                            .await;
                        continue;
                    }
                    Ok(Some(Err(upstream_error))) => {
                        let retryable = upstream_error.outcome.is_retryable();
                        last_error = self
                            .attempt_failed(&meta, &account, charge, upstream_error)
                            .await;
                        if retryable {
                            continue;
                        }
                        break 'providers;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                // First chunk received: this account is committed, no more
                // retries for this request.
                return if canonical.stream {
                    self.stream_response(meta, provider, account, charge, stream, first_chunk)
                        .await
                } else {
                    self.unary_response(meta, provider, account, charge, stream, first_chunk)
                        .await
                };
            }
        }

        self.log_reject(
            &meta.token,
            &meta.user,
            &meta.model,
            &last_error,
            meta.started_epoch,
            meta.started,
        )
        .await;
        warn!(
            event = "request_failed",
            trace_id = %meta.trace_id,
            model = %meta.model,
            attempts,
            code = last_error.kind.code()
        );
        GatewayResponse::error(meta.dialect, &last_error, None)
    }

    /// Failure before anything reached the caller: refund the pre-charge,
    /// feed the health monitor, bump the account counters.
    async fn attempt_failed(
        &self,
        meta: &RequestMeta,
        account: &Arc<Account>,
        charge: RateCharge,
        error: UpstreamError,
    ) -> GatewayError {
        let services = &self.services;
        services.ratelimit.refund(charge);
        services.health.record(account.id, error.outcome).await;
        account.total_requests.fetch_add(1, Ordering::Relaxed);
        account.failed_requests.fetch_add(1, Ordering::Relaxed);
        if error.outcome == Outcome::RateLimited {
            account.rate_limit_errors.fetch_add(1, Ordering::Relaxed);
        }
        if error.outcome == Outcome::AuthFailed {
            account.auth_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(db_error) = services
            .storage
            .record_account_result(
                account.id,
                true,
                error.outcome == Outcome::RateLimited,
                error.outcome == Outcome::AuthFailed,
                meta.started_epoch,
            )
            .await
        {
            warn!(event = "account_stat_write_failed", account_id = account.id, error = %db_error);
        }
        warn!(
            event = "attempt_failed",
            trace_id = %meta.trace_id,
            account_id = account.id,
            outcome = ?error.outcome,
            error = %error
        );
        let kind = error
            .outcome
            .error_kind()
            .unwrap_or(ErrorKind::Upstream5xx);
        GatewayError::new(kind, error.message)
    }

    async fn unary_response(
        &self,
        meta: RequestMeta,
        provider: Arc<Provider>,
        account: Arc<Account>,
        charge: RateCharge,
        mut stream: ChunkStream,
        first_chunk: CanonicalChunk,
    ) -> GatewayResponse {
        let config = meta.config.clone();
        let mut accumulator = ChunkAccumulator::new();
        accumulator.push(&first_chunk);
        let mut terminal_seen = first_chunk.terminal;

        while !terminal_seen {
            match tokio::time::timeout(config.between_chunks_timeout(), stream.rx.recv()).await {
                Err(_) => {
                    let error = UpstreamError::new(Outcome::Timeout, None, "stream stalled");
                    return self
                        .unary_failed(meta, provider, account, charge, accumulator, error)
                        .await;
                }
                Ok(None) => break,
                Ok(Some(Err(upstream_error))) => {
                    return self
                        .unary_failed(meta, provider, account, charge, accumulator, upstream_error)
                        .await;
                }
                Ok(Some(Ok(chunk))) => {
                    terminal_seen = chunk.terminal;
                    accumulator.push(&chunk);
                }
            }
        }
        drop(stream);

        let usage = accumulator.usage();
        let completion_text = accumulator.completion_text().to_string();
        let settled = settle_usage(
            usage,
            meta.estimate,
            &meta.model,
            &completion_text,
            &config.token_estimator_weights,
        );
        let response = accumulator.finalize(meta.model.clone());

        self.settle_success(&meta, &provider, &account, charge, settled, 200)
            .await;

        let response_id = meta.trace_id.clone();
        let body = match meta.dialect {
            Dialect::OpenAi => {
                let rendered = openai::render_unary(
                    &response,
                    &format!("chatcmpl-{response_id}"),
                    meta.started_epoch,
                );
                serde_json::to_vec(&rendered)
            }
            Dialect::Claude => {
                let rendered = claude::render_unary(&response, &format!("msg_{response_id}"));
                serde_json::to_vec(&rendered)
            }
            Dialect::Gemini => serde_json::to_vec(&gemini::render_unary(&response)),
        };
        GatewayResponse::Json {
            status: StatusCode::OK,
            body: Bytes::from(body.unwrap_or_default()),
            retry_after: None,
        }
    }

    /// Unary call that died after the commit point: no retry, the partial
    /// usage is still billed.
    async fn unary_failed(
        &self,
        meta: RequestMeta,
        _provider: Arc<Provider>,
        account: Arc<Account>,
        charge: RateCharge,
        accumulator: ChunkAccumulator,
        error: UpstreamError,
    ) -> GatewayResponse {
        let config = meta.config.clone();
        let usage = accumulator.usage();
        let completion_text = accumulator.completion_text().to_string();
        let settled = settle_usage(
            usage,
            meta.estimate,
            &meta.model,
            &completion_text,
            &config.token_estimator_weights,
        );
        let kind = error.outcome.error_kind().unwrap_or(ErrorKind::Upstream5xx);
        let gateway_error = GatewayError::new(kind, error.message.clone());

        self.services.health.record(account.id, error.outcome).await;
        account.total_requests.fetch_add(1, Ordering::Relaxed);
        account.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.services.ratelimit.reconcile(charge, settled.total());
        let _ = self
            .services
            .tokens
            .commit_usage(meta.token.id, settled.prompt_tokens, settled.completion_tokens)
            .await;
        self.append_log(
            &meta,
            Some(account.provider_id),
            Some(account.id),
            kind.status().as_u16(),
            settled,
            Some(kind.code()),
        )
        .await;
        GatewayResponse::error(meta.dialect, &gateway_error, None)
    }

    async fn stream_response(
        &self,
        meta: RequestMeta,
        provider: Arc<Provider>,
        account: Arc<Account>,
        charge: RateCharge,
        stream: ChunkStream,
        first_chunk: CanonicalChunk,
    ) -> GatewayResponse {
        let config = meta.config.clone();
        let mut renderer = DialectStreamRenderer::new(
            meta.dialect,
            &meta.model,
            &meta.trace_id,
            meta.started_epoch,
        );
        let content_type = renderer.content_type();

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let mut accumulator = ChunkAccumulator::new();
        accumulator.push(&first_chunk);
        let first_frames = renderer.push(&first_chunk);
        let terminal = first_chunk.terminal;

        let dispatcher = Dispatcher {
            services: self.services.clone(),
        };
        tokio::spawn(async move {
            let mut client_gone = false;
            for frame in first_frames {
                if tx.send(frame).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            if client_gone {
                dispatcher
                    .finish_stream(meta, account, charge, accumulator, StreamEnd::Cancelled)
                    .await;
                return;
            }
            if terminal {
                dispatcher
                    .finish_stream(meta, account, charge, accumulator, StreamEnd::Complete)
                    .await;
                return;
            }
            dispatcher
                .pump_stream(meta, provider, account, charge, stream, renderer, accumulator, tx)
                .await;
        });

        GatewayResponse::Stream {
            status: StatusCode::OK,
            content_type,
            rx,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump_stream(
        &self,
        meta: RequestMeta,
        _provider: Arc<Provider>,
        account: Arc<Account>,
        charge: RateCharge,
        mut stream: ChunkStream,
        mut renderer: DialectStreamRenderer,
        mut accumulator: ChunkAccumulator,
        tx: mpsc::Sender<Bytes>,
    ) {
        let config = meta.config.clone();
        let end = loop {
            match tokio::time::timeout(config.between_chunks_timeout(), stream.rx.recv()).await {
                Err(_) => {
                    for frame in renderer.abort("upstream stream stalled") {
                        let _ = tx.send(frame).await;
                    }
                    break StreamEnd::Failed(Outcome::Timeout);
                }
                Ok(None) => {
                    // Upstream ended without a terminal marker; close out
                    // cleanly for the caller.
                    let synthetic = CanonicalChunk {
                        terminal: true,
                        ..Default::default()
                    };
                    accumulator.push(&synthetic);
                    for frame in renderer.push(&synthetic) {
                        let _ = tx.send(frame).await;
                    }
                    break StreamEnd::Complete;
                }
                Ok(Some(Err(upstream_error))) => {
                    for frame in renderer.abort(&upstream_error.message) {
                        let _ = tx.send(frame).await;
                    }
                    break StreamEnd::Failed(upstream_error.outcome);
                }
                Ok(Some(Ok(chunk))) => {
                    accumulator.push(&chunk);
                    let terminal = chunk.terminal;
                    let mut client_gone = false;
                    for frame in renderer.push(&chunk) {
                        if tx.send(frame).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    if client_gone {
                        break StreamEnd::Cancelled;
                    }
                    if terminal {
                        break StreamEnd::Complete;
                    }
                }
            }
        };
        // On cancellation, dropping the stream closes the upstream
        // connection.
        drop(stream);
        self.finish_stream(meta, account, charge, accumulator, end).await;
    }

    async fn finish_stream(
        &self,
        meta: RequestMeta,
        account: Arc<Account>,
        charge: RateCharge,
        accumulator: ChunkAccumulator,
        end: StreamEnd,
    ) {
        let config = meta.config.clone();
        let usage = accumulator.usage();
        let completion_text = accumulator.completion_text().to_string();
        let settled = settle_usage(
            usage,
            meta.estimate,
            &meta.model,
            &completion_text,
            &config.token_estimator_weights,
        );

        let (status, error_kind) = match end {
            StreamEnd::Complete => {
                self.services.health.record(account.id, Outcome::Success).await;
                (200u16, None)
            }
            StreamEnd::Failed(outcome) => {
                self.services.health.record(account.id, outcome).await;
                let kind = outcome.error_kind().unwrap_or(ErrorKind::Upstream5xx);
                (kind.status().as_u16(), Some(kind.code()))
            }
            StreamEnd::Cancelled => (499u16, Some(ErrorKind::ClientCancelled.code())),
        };

        let failed = !matches!(end, StreamEnd::Complete);
        account.total_requests.fetch_add(1, Ordering::Relaxed);
        if failed && !matches!(end, StreamEnd::Cancelled) {
            account.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(end, StreamEnd::Cancelled) {
            // The caller walked away; release the pre-charge. The partial
            // usage still goes to the quota commit below.
            self.services.ratelimit.refund(charge);
        } else {
            self.services.ratelimit.reconcile(charge, settled.total());
        }
        let _ = self
            .services
            .tokens
            .commit_usage(meta.token.id, settled.prompt_tokens, settled.completion_tokens)
            .await;
        if let Err(db_error) = self
            .services
            .storage
            .record_account_result(
                account.id,
                failed && !matches!(end, StreamEnd::Cancelled),
                false,
                false,
                meta.started_epoch,
            )
            .await
        {
            warn!(event = "account_stat_write_failed", account_id = account.id, error = %db_error);
        }
        self.append_log(
            &meta,
            Some(account.provider_id),
            Some(account.id),
            status,
            settled,
            error_kind,
        )
        .await;
        info!(
            event = "request_finished",
            trace_id = %meta.trace_id,
            model = %meta.model,
            status,
            prompt_tokens = settled.prompt_tokens,
            completion_tokens = settled.completion_tokens,
            elapsed_ms = meta.started.elapsed().as_millis() as i64
        );
    }

    /// Success bookkeeping shared by the unary path.
    async fn settle_success(
        &self,
        meta: &RequestMeta,
        _provider: &Arc<Provider>,
        account: &Arc<Account>,
        charge: RateCharge,
        settled: SettledUsage,
        status: u16,
    ) {
        self.services.health.record(account.id, Outcome::Success).await;
        account.total_requests.fetch_add(1, Ordering::Relaxed);
        self.services.ratelimit.reconcile(charge, settled.total());
        let _ = self
            .services
            .tokens
            .commit_usage(meta.token.id, settled.prompt_tokens, settled.completion_tokens)
            .await;
        if let Err(db_error) = self
            .services
            .storage
            .record_account_result(account.id, false, false, false, meta.started_epoch)
            .await
        {
            warn!(event = "account_stat_write_failed", account_id = account.id, error = %db_error);
        }
        self.append_log(
            meta,
            Some(account.provider_id),
            Some(account.id),
            status,
            settled,
            None,
        )
        .await;
        info!(
            event = "request_finished",
            trace_id = %meta.trace_id,
            model = %meta.model,
            status,
            prompt_tokens = settled.prompt_tokens,
            completion_tokens = settled.completion_tokens,
            elapsed_ms = meta.started.elapsed().as_millis() as i64
        );
    }

    async fn append_log(
        &self,
        meta: &RequestMeta,
        provider_id: Option<i64>,
        account_id: Option<i64>,
        status: u16,
        usage: SettledUsage,
        error_kind: Option<&'static str>,
    ) {
        let row = LogRow {
            created_at: meta.started_epoch,
            user_id: meta.user.id,
            token_id: meta.token.id,
            provider_id,
            account_id,
            model: &meta.model,
            status,
            duration_ms: meta.started.elapsed().as_millis() as i64,
            usage,
            error_kind,
        };
        self.services.log_bus.append(row.into_record()).await;
    }

    /// Terminal rejection before any account was committed: zero-token row.
    async fn log_reject(
        &self,
        token: &AccessToken,
        user: &User,
        model: &str,
        error: &GatewayError,
        started_epoch: i64,
        started: Instant,
    ) {
        let row = LogRow {
            created_at: started_epoch,
            user_id: user.id,
            token_id: token.id,
            provider_id: None,
            account_id: None,
            model,
            status: error.kind.status().as_u16(),
            duration_ms: started.elapsed().as_millis() as i64,
            usage: SettledUsage::default(),
            error_kind: Some(error.kind.code()),
        };
        self.services.log_bus.append(row.into_record()).await;
    }
}

#[derive(Clone, Copy)]
enum StreamEnd {
    Complete,
    Failed(Outcome),
    Cancelled,
}

fn parse_inbound(inbound: InboundRequest) -> Result<CanonicalRequest, TranslateError> {
    match inbound {
        InboundRequest::OpenAiChat { body } => {
            let request = serde_json::from_slice(&body)
                .map_err(|err| TranslateError::Invalid(err.to_string()))?;
            openai::parse_request(request)
        }
        InboundRequest::ClaudeMessages { body } => {
            let request = serde_json::from_slice(&body)
                .map_err(|err| TranslateError::Invalid(err.to_string()))?;
            claude::parse_request(request)
        }
        InboundRequest::GeminiGenerate {
            model,
            stream,
            body,
        } => {
            let request = serde_json::from_slice(&body)
                .map_err(|err| TranslateError::Invalid(err.to_string()))?;
            gemini::parse_request(&model, stream, request)
        }
    }
}

fn translate_to_gateway(error: TranslateError) -> GatewayError {
    match error {
        TranslateError::Unsupported(what) => {
            GatewayError::new(ErrorKind::UnsupportedRequestFeature, what)
        }
        TranslateError::Invalid(message) => GatewayError::new(ErrorKind::BadRequest, message),
    }
}
