use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelgate_core::{
    AdapterRegistry, ConfigHandle, GatewayConfig, GatewayServices,
};
use modelgate_storage::{LogBus, LogBusConfig, Storage};
use modelgate_upstream::client::UpstreamClientConfig;
use modelgate_upstream::{
    glm_adapter, AnthropicAdapter, GoogleAdapter, KiroAdapter, OpenAiCompatAdapter, UpstreamClient,
    WreqClient,
};

mod cli;
mod tasks;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let gateway_config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str::<GatewayConfig>(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => GatewayConfig::default(),
    };
    let config = ConfigHandle::new(gateway_config);

    let storage = Storage::connect(&args.dsn)
        .await
        .with_context(|| format!("connecting to {}", args.dsn))?;
    storage.sync_schema().await.context("syncing schema")?;

    let log_bus = LogBus::spawn(storage.clone(), LogBusConfig::default());

    let loaded = config.load();
    let client: Arc<dyn UpstreamClient> = Arc::new(
        WreqClient::new(UpstreamClientConfig {
            proxy: args.proxy.clone(),
            connect_timeout: loaded.connect_timeout(),
            request_timeout: std::time::Duration::from_secs(3600),
            stream_idle_timeout: loaded.between_chunks_timeout(),
        })
        .context("building upstream client")?,
    );
    drop(loaded);

    let kiro = Arc::new(KiroAdapter::new(client.clone(), storage.clone()));
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(OpenAiCompatAdapter::openai(client.clone())));
    adapters.register(Arc::new(glm_adapter(client.clone())));
    adapters.register(Arc::new(AnthropicAdapter::new(client.clone())));
    adapters.register(Arc::new(GoogleAdapter::new(client.clone())));
    adapters.register(kiro.clone());

    let services = Arc::new(GatewayServices::new(config, storage.clone(), log_bus, adapters));
    let snapshot = storage.load_snapshot().await.context("loading snapshot")?;
    services.publish_snapshot(&snapshot).await;
    info!(
        event = "snapshot_loaded",
        users = snapshot.users.len(),
        tokens = snapshot.tokens.len(),
        providers = snapshot.providers.len(),
        accounts = snapshot.accounts.len()
    );

    tasks::spawn_background(services.clone(), kiro);

    let app = modelgate_router::proxy_router(services);
    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
