//! Cross-instance configuration coherence
//!
//! Two registries sharing one store: a mutation on instance A persists the
//! config and publishes a change event; instance B's listener reloads from
//! storage and reconciles its own broker queues and workers.

use cg_common::{QueueDefinition, QueueDefinitionPatch, QueueSystemConfig};
use cg_gateway::registry::{spawn_config_listener, QueueRegistry};
use cg_store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn base_config() -> QueueSystemConfig {
    let mut standard = QueueDefinition::new("standard");
    standard.priority = 5;
    QueueSystemConfig {
        queues: vec![standard],
        default_queue: "standard".to_string(),
        job_ttl_secs: 3600,
        polling_timeout_secs: 30,
    }
}

async fn registry(store: Arc<MemoryStore>, instance: &str) -> Arc<QueueRegistry> {
    let registry = Arc::new(QueueRegistry::new(
        store,
        "queues:config",
        "queues:config:events",
        instance,
    ));
    registry.init(base_config()).await.unwrap();
    registry
}

async fn wait_until<F, Fut>(mut check: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn external_create_event_reaches_other_instance() {
    let store = Arc::new(MemoryStore::new());
    let a = registry(store.clone(), "instance-a").await;
    let b = registry(store.clone(), "instance-b").await;
    let _listener = spawn_config_listener(b.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut vip = QueueDefinition::new("vip");
    vip.priority = 20;
    vip.url_patterns = vec!["/vip/*".to_string()];
    a.create(vip).await.unwrap();

    wait_until(
        || {
            let b = b.clone();
            async move { b.get("vip").await.is_some() }
        },
        Duration::from_secs(2),
    )
    .await;

    // Instance B built a live broker queue for the new definition.
    assert!(b.handle("vip").await.is_some());
    assert_eq!(b.get("vip").await.unwrap().priority, 20);
}

#[tokio::test]
async fn external_update_and_remove_reconcile() {
    let store = Arc::new(MemoryStore::new());
    let a = registry(store.clone(), "instance-a").await;
    let b = registry(store.clone(), "instance-b").await;
    let _listener = spawn_config_listener(b.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let temp = QueueDefinition::new("temp");
    a.create(temp).await.unwrap();
    wait_until(
        || {
            let b = b.clone();
            async move { b.get("temp").await.is_some() }
        },
        Duration::from_secs(2),
    )
    .await;

    a.update(
        "temp",
        QueueDefinitionPatch {
            priority: Some(9),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    wait_until(
        || {
            let b = b.clone();
            async move { b.get("temp").await.map(|d| d.priority) == Some(9) }
        },
        Duration::from_secs(2),
    )
    .await;

    a.remove("temp").await.unwrap();
    wait_until(
        || {
            let b = b.clone();
            async move { b.get("temp").await.is_none() }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(b.handle("temp").await.is_none());
}

#[tokio::test]
async fn own_events_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let a = registry(store.clone(), "instance-a").await;
    let _listener = spawn_config_listener(a.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A mutation on the same instance must not bounce back through the
    // listener and clobber live state.
    a.create(QueueDefinition::new("own")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(a.get("own").await.is_some());
    assert!(a.handle("own").await.is_some());
    assert!(!a.handle("own").await.unwrap().is_closed());
}

#[tokio::test]
async fn update_coherence_between_memory_and_storage() {
    let store = Arc::new(MemoryStore::new());
    let a = registry(store.clone(), "instance-a").await;

    a.update(
        "standard",
        QueueDefinitionPatch {
            workers: Some(4),
            label: Some("Standard lane".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let in_memory = a.get("standard").await.unwrap();
    assert_eq!(in_memory.workers, 4);
    assert_eq!(in_memory.label, "Standard lane");

    use cg_store::KvStore;
    let raw = store.get("queues:config").await.unwrap().unwrap();
    let persisted: QueueSystemConfig = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted.get("standard").unwrap().workers, 4);
}
