//! QueueRegistry - the dynamic, runtime-mutable set of named priority queues
//!
//! Every mutation (i) updates the in-memory map, (ii) persists the full
//! config to the key-value store under `queues:config`, (iii) publishes a
//! change event on `queues:config:events`. On receipt of an event from
//! another instance the registry reloads from storage and reconciles its
//! broker queues. Observers (the worker pool) are notified through
//! [`QueueEventListener`] so worker lifecycle never reaches back into the
//! registry's internals.

use async_trait::async_trait;
use cg_common::{ConfigChangeEvent, QueueDefinition, QueueDefinitionPatch, QueueSystemConfig};
use cg_store::KvStore;
use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerQueue;
use crate::{GatewayError, Result};

/// Observer hook for registry mutations. The worker pool subscribes and
/// reconciles its worker groups.
#[async_trait]
pub trait QueueEventListener: Send + Sync {
    async fn on_queue_created(&self, def: &QueueDefinition, queue: Arc<BrokerQueue>);

    /// `concurrency_changed` forces a full worker teardown because broker
    /// workers bind concurrency at construction.
    async fn on_queue_updated(
        &self,
        def: &QueueDefinition,
        queue: Arc<BrokerQueue>,
        concurrency_changed: bool,
    );

    async fn on_queue_removed(&self, name: &str);
}

struct RegistryState {
    config: QueueSystemConfig,
    queues: HashMap<String, Arc<BrokerQueue>>,
}

pub struct QueueRegistry {
    store: Arc<dyn KvStore>,
    config_key: String,
    config_channel: String,
    instance_id: String,
    state: RwLock<RegistryState>,
    listeners: SyncRwLock<Vec<Arc<dyn QueueEventListener>>>,
}

impl QueueRegistry {
    pub fn new(
        store: Arc<dyn KvStore>,
        config_key: &str,
        config_channel: &str,
        instance_id: &str,
    ) -> Self {
        Self {
            store,
            config_key: config_key.to_string(),
            config_channel: config_channel.to_string(),
            instance_id: instance_id.to_string(),
            state: RwLock::new(RegistryState {
                config: QueueSystemConfig {
                    queues: Vec::new(),
                    default_queue: String::new(),
                    job_ttl_secs: 3600,
                    polling_timeout_secs: 30,
                },
                queues: HashMap::new(),
            }),
            listeners: SyncRwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueEventListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn QueueEventListener>> {
        self.listeners.read().clone()
    }

    /// Initialize from storage when a persisted config exists, otherwise
    /// persist the seed. Builds the broker queues and notifies listeners for
    /// each definition.
    pub async fn init(&self, seed: QueueSystemConfig) -> Result<()> {
        let config = match self.load_persisted().await {
            Some(stored) => {
                info!(queues = stored.queues.len(), "Loaded queue config from storage");
                stored
            }
            None => {
                info!(queues = seed.queues.len(), "No persisted queue config - seeding");
                self.persist(&seed).await;
                seed
            }
        };

        let mut created = Vec::new();
        {
            let mut state = self.state.write().await;
            for def in &config.queues {
                let queue = Arc::new(BrokerQueue::new(
                    &def.name,
                    def.attempts,
                    def.retry_delay_ms,
                ));
                state.queues.insert(def.name.clone(), queue.clone());
                created.push((def.clone(), queue));
            }
            state.config = config;
        }

        for (def, queue) in created {
            for listener in self.listeners() {
                listener.on_queue_created(&def, queue.clone()).await;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get(&self, name: &str) -> Option<QueueDefinition> {
        self.state.read().await.config.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<QueueDefinition> {
        self.state.read().await.config.queues.clone()
    }

    pub async fn default_queue_name(&self) -> String {
        self.state.read().await.config.default_queue.clone()
    }

    pub async fn config_snapshot(&self) -> QueueSystemConfig {
        self.state.read().await.config.clone()
    }

    pub async fn handle(&self, name: &str) -> Option<Arc<BrokerQueue>> {
        self.state.read().await.queues.get(name).cloned()
    }

    /// Live load of a queue, `u64::MAX` when its broker queue is missing so a
    /// broken queue never steals traffic.
    pub async fn load(&self, name: &str) -> u64 {
        match self.handle(name).await {
            Some(queue) if !queue.is_closed() => queue.counts().load(),
            _ => u64::MAX,
        }
    }

    /// Enqueue a routed job. Returns the definition used, for response
    /// metadata.
    pub async fn enqueue(&self, queue_name: &str, mut job: cg_common::Job) -> Result<QueueDefinition> {
        let state = self.state.read().await;
        let def = state
            .config
            .get(queue_name)
            .cloned()
            .ok_or_else(|| GatewayError::QueueNotFound(queue_name.to_string()))?;
        let queue = state
            .queues
            .get(queue_name)
            .cloned()
            .ok_or_else(|| GatewayError::QueueUnavailable(queue_name.to_string()))?;
        drop(state);

        job.queue_name = Some(queue_name.to_string());
        queue.enqueue(job, def.priority)?;
        Ok(def)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create a new queue. Fails when the name already exists.
    pub async fn create(&self, mut def: QueueDefinition) -> Result<()> {
        def.concurrency = def.concurrency.max(1);

        let (snapshot, queue) = {
            let mut state = self.state.write().await;
            if state.config.get(&def.name).is_some() {
                return Err(GatewayError::QueueExists(def.name.clone()));
            }
            let queue = Arc::new(BrokerQueue::new(
                &def.name,
                def.attempts,
                def.retry_delay_ms,
            ));
            state.queues.insert(def.name.clone(), queue.clone());
            state.config.queues.push(def.clone());
            (state.config.clone(), queue)
        };

        self.persist(&snapshot).await;
        self.publish_event("created", &def.name).await;
        for listener in self.listeners() {
            listener.on_queue_created(&def, queue.clone()).await;
        }

        info!(queue = %def.name, priority = def.priority, workers = def.workers, "Queue created");
        Ok(())
    }

    /// Remove a queue, closing its broker queue. Fails when absent, and the
    /// default queue cannot be removed.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            if state.config.default_queue == name {
                return Err(GatewayError::DefaultQueueRemoval(name.to_string()));
            }
            if state.config.get(name).is_none() {
                return Err(GatewayError::QueueNotFound(name.to_string()));
            }
            if let Some(queue) = state.queues.remove(name) {
                queue.close();
            }
            state.config.queues.retain(|q| q.name != name);
            state.config.clone()
        };

        self.persist(&snapshot).await;
        self.publish_event("removed", name).await;
        for listener in self.listeners() {
            listener.on_queue_removed(name).await;
        }

        info!(queue = %name, "Queue removed");
        Ok(())
    }

    /// Apply a partial update. Rebuilds the broker queue when a
    /// construction-bound field (priority/timeout/attempts/retry/caps)
    /// changed; otherwise only the in-memory definition changes.
    pub async fn update(&self, name: &str, patch: QueueDefinitionPatch) -> Result<QueueDefinition> {
        let rebuild = patch.requires_rebuild();
        let concurrency_changed;

        let (snapshot, def, queue) = {
            let mut state = self.state.write().await;
            let Some(def) = state.config.queues.iter_mut().find(|q| q.name == name) else {
                return Err(GatewayError::QueueNotFound(name.to_string()));
            };

            let old_concurrency = def.concurrency;
            patch.apply(def);
            concurrency_changed = def.concurrency != old_concurrency;
            let def = def.clone();

            let queue = if rebuild {
                let new_queue = Arc::new(BrokerQueue::new(
                    &def.name,
                    def.attempts,
                    def.retry_delay_ms,
                ));
                if let Some(old_queue) = state.queues.insert(name.to_string(), new_queue.clone()) {
                    for (job, attempts_made, _) in old_queue.drain_pending() {
                        new_queue.restore(job, attempts_made, def.priority);
                    }
                }
                new_queue
            } else {
                state
                    .queues
                    .get(name)
                    .cloned()
                    .ok_or_else(|| GatewayError::QueueUnavailable(name.to_string()))?
            };

            (state.config.clone(), def, queue)
        };

        self.persist(&snapshot).await;
        self.publish_event("updated", name).await;
        for listener in self.listeners() {
            listener
                .on_queue_updated(&def, queue.clone(), concurrency_changed)
                .await;
        }

        info!(queue = %name, rebuild = rebuild, concurrency_changed = concurrency_changed, "Queue updated");
        Ok(def)
    }

    /// Set the configured worker count for a queue.
    pub async fn set_workers(&self, name: &str, workers: u32) -> Result<QueueDefinition> {
        self.update(
            name,
            QueueDefinitionPatch {
                workers: Some(workers),
                ..Default::default()
            },
        )
        .await
    }

    /// Set the per-worker concurrency for a queue.
    pub async fn set_concurrency(&self, name: &str, concurrency: u32) -> Result<QueueDefinition> {
        self.update(
            name,
            QueueDefinitionPatch {
                concurrency: Some(concurrency),
                ..Default::default()
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Persistence & cross-instance sync
    // ------------------------------------------------------------------

    async fn load_persisted(&self) -> Option<QueueSystemConfig> {
        match self.store.get(&self.config_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    error!(error = %e, "Persisted queue config is unreadable - ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "Failed to read persisted queue config");
                None
            }
        }
    }

    /// Persist the full config. Persistence failures are logged, never
    /// propagated: the in-memory state stays authoritative.
    async fn persist(&self, config: &QueueSystemConfig) {
        let raw = match serde_json::to_string(config) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Failed to serialize queue config");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.config_key, &raw).await {
            error!(error = %e, key = %self.config_key, "Failed to persist queue config");
        }
    }

    async fn publish_event(&self, kind: &str, queue_name: &str) {
        let event = ConfigChangeEvent {
            kind: kind.to_string(),
            queue_name: queue_name.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            instance_id: self.instance_id.clone(),
        };
        let raw = match serde_json::to_string(&event) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Failed to serialize config change event");
                return;
            }
        };
        if let Err(e) = self.store.publish(&self.config_channel, &raw).await {
            error!(error = %e, channel = %self.config_channel, "Failed to publish config change event");
        }
    }

    /// Reload from storage after an externally-originated change event,
    /// reconciling broker queues and notifying listeners.
    pub async fn reload_from_store(&self) -> Result<()> {
        let Some(new_config) = self.load_persisted().await else {
            warn!("Reload requested but no persisted config found");
            return Ok(());
        };

        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut removed = Vec::new();

        {
            let mut state = self.state.write().await;

            let old_names: Vec<String> =
                state.config.queues.iter().map(|q| q.name.clone()).collect();

            for name in &old_names {
                if new_config.get(name).is_none() {
                    if let Some(queue) = state.queues.remove(name) {
                        queue.close();
                    }
                    removed.push(name.clone());
                }
            }

            for def in &new_config.queues {
                match state.config.get(&def.name) {
                    None => {
                        let queue = Arc::new(BrokerQueue::new(
                            &def.name,
                            def.attempts,
                            def.retry_delay_ms,
                        ));
                        state.queues.insert(def.name.clone(), queue.clone());
                        created.push((def.clone(), queue));
                    }
                    Some(old) => {
                        let old = old.clone();
                        let changed = serde_json::to_string(&old).ok()
                            != serde_json::to_string(def).ok();
                        if !changed {
                            continue;
                        }

                        let rebuild = old.priority != def.priority
                            || old.timeout_secs != def.timeout_secs
                            || old.attempts != def.attempts
                            || old.retry_delay_ms != def.retry_delay_ms
                            || old.keep_completed != def.keep_completed
                            || old.keep_failed != def.keep_failed;
                        let concurrency_changed = old.concurrency != def.concurrency;

                        let queue = if rebuild {
                            let new_queue = Arc::new(BrokerQueue::new(
                                &def.name,
                                def.attempts,
                                def.retry_delay_ms,
                            ));
                            if let Some(old_queue) =
                                state.queues.insert(def.name.clone(), new_queue.clone())
                            {
                                for (job, attempts_made, _) in old_queue.drain_pending() {
                                    new_queue.restore(job, attempts_made, def.priority);
                                }
                            }
                            new_queue
                        } else {
                            match state.queues.get(&def.name) {
                                Some(q) => q.clone(),
                                None => {
                                    let q = Arc::new(BrokerQueue::new(
                                        &def.name,
                                        def.attempts,
                                        def.retry_delay_ms,
                                    ));
                                    state.queues.insert(def.name.clone(), q.clone());
                                    q
                                }
                            }
                        };

                        updated.push((def.clone(), queue, concurrency_changed));
                    }
                }
            }

            state.config = new_config;
        }

        for (def, queue) in &created {
            for listener in self.listeners() {
                listener.on_queue_created(def, queue.clone()).await;
            }
        }
        for (def, queue, concurrency_changed) in &updated {
            for listener in self.listeners() {
                listener
                    .on_queue_updated(def, queue.clone(), *concurrency_changed)
                    .await;
            }
        }
        for name in &removed {
            for listener in self.listeners() {
                listener.on_queue_removed(name).await;
            }
        }

        info!(
            created = created.len(),
            updated = updated.len(),
            removed = removed.len(),
            "Reloaded queue config from storage"
        );
        Ok(())
    }

    /// Close every broker queue (shutdown path).
    pub async fn close_all(&self) {
        let state = self.state.read().await;
        for queue in state.queues.values() {
            queue.close();
        }
    }
}

/// Background task: subscribe to the config change channel and reload on
/// externally-originated events.
pub fn spawn_config_listener(registry: Arc<QueueRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let channel = registry.config_channel.clone();
        let mut rx = match registry.store.subscribe(&channel).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, channel = %channel, "Failed to subscribe to config change channel");
                return;
            }
        };

        info!(channel = %channel, "Listening for config change events");

        while let Some(raw) = rx.recv().await {
            let event: ConfigChangeEvent = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed config change event");
                    continue;
                }
            };

            if event.instance_id == registry.instance_id {
                debug!(kind = %event.kind, "Skipping own config change event");
                continue;
            }

            info!(
                kind = %event.kind,
                queue = %event.queue_name,
                origin = %event.instance_id,
                "Received external config change - reloading"
            );

            if let Err(e) = registry.reload_from_store().await {
                error!(error = %e, "Config reload failed");
            }
        }
    })
}
