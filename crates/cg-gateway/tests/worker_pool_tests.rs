//! Worker pool tests
//!
//! Exercises the pool directly against a registry, an in-memory store and a
//! mock bus: reconciliation, add/remove caps, pause semantics, concurrency
//! bounds and teardown on concurrency changes.

use cg_bus::BusClient;
use cg_common::{Job, QueueDefinition, QueueDefinitionPatch, QueueSystemConfig, Verb};
use cg_gateway::{
    JobProcessor, LruResponseCache, QueueRegistry, ResultRepository, StatusFabric, WorkerPool,
};
use cg_store::MemoryStore;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bus that tracks its concurrent in-flight request count.
struct GaugeBus {
    current: AtomicU32,
    max_seen: AtomicU32,
    total: AtomicU32,
    hold: Duration,
}

impl GaugeBus {
    fn new(hold: Duration) -> Self {
        Self {
            current: AtomicU32::new(0),
            max_seen: AtomicU32::new(0),
            total: AtomicU32::new(0),
            hold,
        }
    }

    fn max_seen(&self) -> u32 {
        self.max_seen.load(Ordering::SeqCst)
    }

    fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BusClient for GaugeBus {
    async fn publish(&self, _subject: &str, _payload: Value) -> cg_bus::Result<()> {
        Ok(())
    }

    async fn request(
        &self,
        _subject: &str,
        _payload: Value,
        _timeout: Duration,
    ) -> cg_bus::Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"ok": true}))
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct Harness {
    registry: Arc<QueueRegistry>,
    pool: Arc<WorkerPool>,
    fabric: Arc<StatusFabric>,
    bus: Arc<GaugeBus>,
}

async fn harness(def: QueueDefinition, hold: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(GaugeBus::new(hold));
    let fabric = Arc::new(StatusFabric::new());
    let cache = Arc::new(LruResponseCache::new(100));
    let results = Arc::new(ResultRepository::new(store.clone(), 3600, 100));
    let processor = Arc::new(JobProcessor::new(
        bus.clone(),
        cache,
        results,
        fabric.clone(),
    ));

    let registry = Arc::new(QueueRegistry::new(
        store,
        "queues:config",
        "queues:config:events",
        "pool-tests",
    ));
    let pool = Arc::new(WorkerPool::new(processor, "default", 5));
    registry.add_listener(pool.clone());

    let name = def.name.clone();
    registry
        .init(QueueSystemConfig {
            queues: vec![def],
            default_queue: name,
            job_ttl_secs: 3600,
            polling_timeout_secs: 30,
        })
        .await
        .unwrap();

    Harness {
        registry,
        pool,
        fabric,
        bus,
    }
}

fn routed_job(id: &str) -> Job {
    Job {
        id: id.to_string(),
        verb: Verb::POST,
        normalized_path: "/courses".to_string(),
        raw_url: "/courses".to_string(),
        body: Some(json!({"code": "X"})),
        query_params: IndexMap::new(),
        route_params: HashMap::new(),
        headers: HashMap::new(),
        user_id: None,
        client_ip: "127.0.0.1".to_string(),
        created_at: chrono::Utc::now().timestamp_millis(),
        context: None,
        subject: Some("programs.courses.create".to_string()),
        payload: Some(json!({"code": "X"})),
        attempts: 0,
        queue_name: None,
        worker_id: None,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn ensure_workers_matches_definition() {
    let mut def = QueueDefinition::new("q");
    def.workers = 3;
    let h = harness(def, Duration::from_millis(1)).await;

    assert_eq!(h.pool.worker_count("q").await, 3);

    // Shrinking the definition reconciles down.
    h.registry
        .update(
            "q",
            QueueDefinitionPatch {
                workers: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(h.pool.worker_count("q").await, 1);
}

#[tokio::test]
async fn add_worker_respects_the_cap() {
    let mut def = QueueDefinition::new("q");
    def.workers = 1;
    let h = harness(def, Duration::from_millis(1)).await;

    for _ in 0..4 {
        h.pool.add_worker("q").await.unwrap();
    }
    assert_eq!(h.pool.worker_count("q").await, 5);
    assert!(h.pool.add_worker("q").await.is_err());

    h.pool.remove_worker("q").await.unwrap();
    assert_eq!(h.pool.worker_count("q").await, 4);
}

#[tokio::test]
async fn remove_worker_errors_when_empty() {
    let mut def = QueueDefinition::new("q");
    def.workers = 0;
    let h = harness(def, Duration::from_millis(1)).await;

    assert_eq!(h.pool.worker_count("q").await, 0);
    assert!(h.pool.remove_worker("q").await.is_err());
    assert!(h.pool.add_worker("missing").await.is_err());
}

#[tokio::test]
async fn concurrency_bounds_in_flight_dispatches() {
    let mut def = QueueDefinition::new("q");
    def.workers = 1;
    def.concurrency = 2;
    let h = harness(def, Duration::from_millis(80)).await;

    for i in 0..6 {
        h.registry.enqueue("q", routed_job(&format!("j{}", i))).await.unwrap();
    }

    let bus = h.bus.clone();
    wait_until(
        || bus.total() == 6,
        Duration::from_secs(5),
        "all jobs dispatched",
    )
    .await;

    assert!(
        h.bus.max_seen() <= 2,
        "in-flight exceeded concurrency: {}",
        h.bus.max_seen()
    );
}

#[tokio::test]
async fn pause_queue_holds_pickup_until_resume() {
    let mut def = QueueDefinition::new("q");
    def.workers = 1;
    let h = harness(def, Duration::from_millis(1)).await;

    h.pool.pause_queue("q").await.unwrap();
    h.registry.enqueue("q", routed_job("j1")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.bus.total(), 0);
    let counts = h.registry.handle("q").await.unwrap().counts();
    assert_eq!(counts.paused, 1);

    h.pool.resume_queue("q").await.unwrap();
    let bus = h.bus.clone();
    wait_until(|| bus.total() == 1, Duration::from_secs(3), "job processed").await;

    let fabric = h.fabric.clone();
    wait_until(
        || {
            fabric
                .get_status("j1")
                .map(|s| s.status == cg_common::JobStatus::Completed)
                .unwrap_or(false)
        },
        Duration::from_secs(3),
        "completed status",
    )
    .await;
}

#[tokio::test]
async fn concurrency_change_rebuilds_workers_and_keeps_processing() {
    let mut def = QueueDefinition::new("q");
    def.workers = 2;
    def.concurrency = 1;
    let h = harness(def, Duration::from_millis(10)).await;

    h.registry
        .update(
            "q",
            QueueDefinitionPatch {
                concurrency: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The group was torn down and rebuilt at the same size.
    assert_eq!(h.pool.worker_count("q").await, 2);

    h.registry.enqueue("q", routed_job("after")).await.unwrap();
    let bus = h.bus.clone();
    wait_until(|| bus.total() == 1, Duration::from_secs(3), "job after rebuild").await;
}

#[tokio::test]
async fn status_reports_worker_states() {
    let mut def = QueueDefinition::new("q");
    def.workers = 2;
    let h = harness(def, Duration::from_millis(1)).await;

    let status = h.pool.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].queue, "q");
    assert_eq!(status[0].workers.len(), 2);
    assert!(status[0].workers.iter().all(|w| w.state == "active"));
    assert!(status[0].workers[0].id.starts_with("q-default-"));

    h.pool.pause_all();
    let status = h.pool.status().await;
    assert!(status[0].workers.iter().all(|w| w.state == "paused"));
    h.pool.resume_all();
}

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let mut def = QueueDefinition::new("q");
    def.workers = 3;
    let h = harness(def, Duration::from_millis(1)).await;

    h.pool.shutdown().await;
    assert_eq!(h.pool.worker_count("q").await, 0);
}
