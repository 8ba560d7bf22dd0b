use std::net::SocketAddr;
use std::sync::Arc;

use stitch_core::config::EngineConfig;
use stitch_core::engine::StitchEngine;
use stitch_core::registry::{EchoWorker, WorkerRegistry};
use stitch_core::store::RunStore;
use stitch_core::store_memory::MemoryStore;
use stitch_server::rate_limit::RateLimits;
use stitch_server::routes::{router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Missing BASE_URL is fatal here, before anything listens.
    let config = EngineConfig::from_env()?;

    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
    tracing::info!("Using MemoryStore (in-process run state)");

    let mut registry = WorkerRegistry::new();
    let echo: Arc<EchoWorker> = Arc::new(EchoWorker::new());
    registry.register("echo", echo.clone());
    for worker_type in &config.worker_types {
        // WORKER_TYPES seeds the registry; each name gets the loopback
        // executor until a real in-process worker claims it.
        registry.register(worker_type.clone(), echo.clone());
    }
    tracing::info!(worker_types = ?registry.type_names(), "worker registry populated");

    let limits = Arc::new(RateLimits::new(
        config.api_rate_limit,
        config.webhook_rate_limit,
    ));
    let engine = Arc::new(StitchEngine::new(store, Arc::new(registry), config)?);

    let app = router(AppState { engine, limits });

    let addr: SocketAddr = "0.0.0.0:4000".parse()?;
    tracing::info!("Stitch engine listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
