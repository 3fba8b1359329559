//! Campusgate Server
//!
//! Wires the gateway together: configuration, the key-value store, the
//! message bus, the queue registry and worker pool, and the HTTP surface.
//!
//! ## Development Mode
//!
//! Set `GATEWAY_DEV_MODE=true` to run without external infrastructure:
//! - an in-memory key-value store replaces Redis
//! - bus dispatch is stubbed (the `queue.test` echo subject still works)

use anyhow::Result;
use cg_bus::{BusClient, BusError, NatsBus};
use cg_config::ConfigLoader;
use cg_gateway::api::{create_router, AppState};
use cg_gateway::cache::spawn_cache_cleanup;
use cg_gateway::idempotency::spawn_idempotency_cleanup;
use cg_gateway::registry::spawn_config_listener;
use cg_gateway::status::spawn_status_housekeeping;
use cg_gateway::{
    InterceptionPipeline, InMemoryIdempotency, JobProcessor, LruResponseCache, QueueControl,
    QueueRegistry, QueueRouter, ResultRepository, StatusFabric, SyncDispatcher, WorkerPool,
};
use cg_store::{KvStore, MemoryStore, RedisStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

const CACHE_MAX_ENTRIES: usize = 1000;
const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const IDEMPOTENCY_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    cg_common::logging::init_logging("cg-server");

    info!("Starting Campusgate gateway");

    let dev_mode = std::env::var("GATEWAY_DEV_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    // 1. Configuration
    let config = ConfigLoader::load();
    let seed = ConfigLoader::load_queue_system_config(&config)?;

    // 2. Key-value store
    let store: Arc<dyn KvStore> = if dev_mode {
        info!("Development mode - using in-memory key-value store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.store).await?)
    };

    // 3. Message bus
    let bus: Arc<dyn BusClient> = if dev_mode {
        info!("Development mode - bus dispatch stubbed");
        Arc::new(DevNullBus)
    } else {
        Arc::new(NatsBus::connect(&config.bus).await?)
    };

    // 4. Core services
    let fabric = Arc::new(StatusFabric::new());
    let cache = Arc::new(LruResponseCache::new(CACHE_MAX_ENTRIES));
    let results = Arc::new(ResultRepository::new(
        store.clone(),
        config.queue.effective_result_ttl_secs(),
        config.queue.result_history_limit,
    ));
    let processor = Arc::new(JobProcessor::new(
        bus.clone(),
        cache.clone(),
        results.clone(),
        fabric.clone(),
    ));

    // 5. Registry and worker pool
    let registry = Arc::new(QueueRegistry::new(
        store.clone(),
        &config.queue.config_key,
        &config.queue.config_channel,
        &config.instance_id,
    ));
    let worker_pool = Arc::new(WorkerPool::new(
        processor.clone(),
        &config.queue.worker_strategy,
        config.queue.worker_max_per_queue,
    ));
    registry.add_listener(worker_pool.clone());
    registry.init(seed).await?;

    // 6. Interception pipeline
    let routing = Arc::new(cg_gateway::RoutingTable::with_default_rules());
    let queue_router = Arc::new(QueueRouter::new(registry.clone()));
    let control = Arc::new(QueueControl::new(
        config.queue.enabled,
        config.queue.exclusions.clone(),
    ));
    let idempotency = Arc::new(InMemoryIdempotency::new());
    let sync = Arc::new(SyncDispatcher::new(
        routing.clone(),
        bus.clone(),
        Duration::from_secs(config.bus.request_timeout_secs),
    ));
    let pipeline = Arc::new(InterceptionPipeline::new(
        routing,
        registry.clone(),
        queue_router,
        fabric.clone(),
        idempotency.clone(),
        control.clone(),
        sync,
    ));

    // 7. Background tasks
    let _config_listener = spawn_config_listener(registry.clone());
    let _cache_cleanup = spawn_cache_cleanup(cache.clone(), CACHE_CLEANUP_INTERVAL);
    let _status_housekeeping = spawn_status_housekeeping(fabric.clone());
    let _idempotency_cleanup =
        spawn_idempotency_cleanup(idempotency.clone(), IDEMPOTENCY_CLEANUP_INTERVAL);

    // 8. HTTP server
    let state = AppState {
        pipeline,
        registry: registry.clone(),
        worker_pool: worker_pool.clone(),
        fabric,
        results,
        cache,
        control,
        store,
        bus,
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 9. Drain: stop pick-up, finish in-flight work, close queues.
    info!("Shutting down - draining workers");
    worker_pool.shutdown().await;
    registry.close_all().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

/// Dev-mode bus stub: the `queue.test` echo subject never reaches the bus,
/// and everything else fails fast with a clear message.
struct DevNullBus;

#[async_trait::async_trait]
impl BusClient for DevNullBus {
    async fn publish(&self, _subject: &str, _payload: serde_json::Value) -> cg_bus::Result<()> {
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        _payload: serde_json::Value,
        _timeout: Duration,
    ) -> cg_bus::Result<serde_json::Value> {
        Err(BusError::Request(format!(
            "bus disabled in dev mode (subject {})",
            subject
        )))
    }

    fn is_connected(&self) -> bool {
        false
    }
}
