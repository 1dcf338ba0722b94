pub mod api;
pub mod cache;
pub mod config;
pub mod core;
pub mod llm;
pub mod reports;
pub mod storage;
pub mod webhooks;

pub use config::Config;
pub use core::PromptGateway;
pub use storage::Storage;

use anyhow::Result;
use api::{AppState, WebApiAdapter};
use cache::{CacheService, MemoryCache};
use llm::{CostCalculator, VendorAdapter};
use reports::ReportService;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::sqlite::SqliteStorage;
use tokio_util::sync::CancellationToken;

/// Cost table from `pricing.path`, or the built-in one.
pub fn load_pricing(config: &Config) -> Result<CostCalculator> {
    match config.pricing.path.as_deref() {
        Some(path) => {
            tracing::info!("Loading cost table from {}", path);
            CostCalculator::from_path(Path::new(path))
        }
        None => CostCalculator::builtin(),
    }
}

/// Report service over `storage` using the configured report TTL.
pub fn report_service<S: Storage>(
    storage: S,
    cache: Arc<dyn CacheService>,
    config: &Config,
) -> ReportService<S> {
    ReportService::new(
        storage,
        cache,
        Duration::from_secs(config.cache.report_ttl_secs),
    )
}

/// Wire storage, caches, pricing and the vendor adapter together.
pub async fn build_state(config: &Config) -> Result<AppState<SqliteStorage>> {
    let storage = SqliteStorage::new(&config.storage.path).await?;
    tracing::info!("Storage initialized: {}", config.storage.path);

    let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::new(config.cache.max_entries));
    let pricing = Arc::new(load_pricing(config)?);
    tracing::info!("Cost table loaded ({} models)", pricing.models().count());

    let gateway = PromptGateway::new(
        storage.clone(),
        Arc::new(VendorAdapter::new()),
        pricing,
        cache.clone(),
        config,
    )?;

    Ok(AppState {
        gateway,
        reports: report_service(storage.clone(), cache, config),
        storage,
    })
}

/// Main entry point for the gateway
pub async fn run(config: Config) -> Result<()> {
    tracing::info!("Starting promptgate...");

    let state = build_state(&config).await?;
    let api = WebApiAdapter::new(state, config.gateway.host.clone(), config.gateway.port);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    api.start(shutdown).await?;
    tracing::info!("promptgate stopped");
    Ok(())
}
