use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keygate_channel::{
    ChannelKeyValidator, ChannelRegistry, ValidationHttp, register_builtin_channels,
};
use keygate_common::ProxySettings;
use keygate_core::{
    AppState, MemorySettingsStore, UpstreamClientConfig, WreqContinuationClient,
    WreqUpstreamClient,
};
use keygate_pool::{CredentialPool, RevalidationConfig, spawn_revalidation_task};
use keygate_stream::{StatsCollector, StreamProcessor};

mod bootstrap;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "keygate",
    version,
    about = "Multi-tenant LLM reverse proxy with streaming retry-resume"
)]
struct CliArgs {
    /// Bind host.
    #[arg(long, env = "KEYGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, env = "KEYGATE_PORT", default_value_t = 8686)]
    port: u16,

    /// Bootstrap file with groups, keys and settings overrides.
    #[arg(long, env = "KEYGATE_CONFIG", default_value = "keygate.json")]
    config: String,

    /// Seconds between credential revalidation passes.
    #[arg(long, env = "KEYGATE_REVALIDATION_INTERVAL_S", default_value_t = 1800)]
    revalidation_interval_s: u64,

    /// Credentials probed per revalidation batch.
    #[arg(long, env = "KEYGATE_REVALIDATION_BATCH_SIZE", default_value_t = 10)]
    revalidation_batch_size: usize,

    /// Pause between revalidation batches, in milliseconds.
    #[arg(long, env = "KEYGATE_REVALIDATION_BATCH_DELAY_MS", default_value_t = 500)]
    revalidation_batch_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    let file = bootstrap::load(&args.config)?;

    let pool = Arc::new(CredentialPool::new());
    let mut imported = 0usize;
    for entry in &file.groups {
        pool.insert_group(entry.group.clone()).await;
        let ids = pool
            .import_credentials(entry.group.id, entry.keys.iter().cloned())
            .await;
        imported += ids.len();
        info!(
            event = "group_loaded",
            group = %entry.group.name,
            channel = %entry.group.channel,
            credentials = ids.len(),
        );
    }
    if imported == 0 {
        warn!("no credentials loaded; every proxy request will answer 503");
    }

    let mut registry = ChannelRegistry::new();
    register_builtin_channels(
        &mut registry,
        ValidationHttp::new().context("build validation http client")?,
    );
    let registry = Arc::new(registry);

    spawn_revalidation_task(
        pool.clone(),
        Arc::new(ChannelKeyValidator::new(registry.clone())),
        RevalidationConfig {
            interval: Duration::from_secs(args.revalidation_interval_s.max(1)),
            batch_size: args.revalidation_batch_size.max(1),
            batch_delay: Duration::from_millis(args.revalidation_batch_delay_ms),
        },
    );

    let settings = file
        .settings
        .unwrap_or_default()
        .overlay(&ProxySettings::default());
    let processor = Arc::new(
        StreamProcessor::new(
            settings,
            Arc::new(StatsCollector::new()),
            Arc::new(WreqContinuationClient::new()),
        )
        .context("invalid bootstrap settings")?,
    );

    let upstream = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::default())
            .context("build upstream http client")?,
    );
    let state = Arc::new(AppState::new(
        pool,
        registry,
        processor,
        upstream,
        Arc::new(MemorySettingsStore::new()),
    ));
    state.persist_settings().await;

    let app = axum::Router::new()
        .merge(keygate_router::proxy_router(state.clone()))
        .nest("/admin", keygate_router::admin_router(state));

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
