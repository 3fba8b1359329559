//! WorkerPool - per-queue worker groups with pause/resume/scale control
//!
//! Each enabled queue gets `workers` independent workers, each running up to
//! `concurrency` jobs in parallel behind a semaphore. Workers are named
//! `{queue}-{strategy}-{n}`. The pool subscribes to registry events and
//! reconciles; when concurrency changes, the queue's workers are torn down
//! first because concurrency binds at worker construction. Pause blocks new
//! pick-up but lets in-flight jobs finish.

use async_trait::async_trait;
use cg_common::QueueDefinition;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::broker::{BrokerQueue, QueueCounts, Take};
use crate::processor::JobProcessor;
use crate::registry::QueueEventListener;
use crate::{GatewayError, Result};

struct WorkerShared {
    paused: AtomicBool,
    stopping: AtomicBool,
}

struct WorkerHandle {
    id: String,
    shared: Arc<WorkerShared>,
    join: tokio::task::JoinHandle<()>,
}

struct WorkerGroup {
    def: QueueDefinition,
    queue: Arc<BrokerQueue>,
    workers: Vec<WorkerHandle>,
    next_index: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: String,
    /// `active`, `paused` or `stopped`.
    pub state: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueWorkerStatus {
    pub queue: String,
    pub concurrency: u32,
    pub configured_workers: u32,
    pub counts: QueueCounts,
    pub workers: Vec<WorkerStatus>,
}

pub struct WorkerPool {
    processor: Arc<JobProcessor>,
    strategy: String,
    max_per_queue: u32,
    groups: Mutex<HashMap<String, WorkerGroup>>,
    paused_all: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(processor: Arc<JobProcessor>, strategy: &str, max_per_queue: u32) -> Self {
        Self {
            processor,
            strategy: strategy.to_string(),
            max_per_queue: max_per_queue.max(1),
            groups: Mutex::new(HashMap::new()),
            paused_all: Arc::new(AtomicBool::new(false)),
        }
    }

    // ------------------------------------------------------------------
    // Control API
    // ------------------------------------------------------------------

    /// Add one worker to a queue's group, bounded by the per-queue cap.
    pub async fn add_worker(&self, queue_name: &str) -> Result<String> {
        let mut groups = self.groups.lock().await;
        let group = groups
            .get_mut(queue_name)
            .ok_or_else(|| GatewayError::QueueNotFound(queue_name.to_string()))?;

        if group.workers.len() as u32 >= self.max_per_queue {
            return Err(GatewayError::Worker(format!(
                "queue {} already at the {}-worker cap",
                queue_name, self.max_per_queue
            )));
        }

        let id = self.spawn_worker(group);
        Ok(id)
    }

    /// Remove the most-recently-added worker, waiting for its in-flight jobs.
    pub async fn remove_worker(&self, queue_name: &str) -> Result<()> {
        let handle = {
            let mut groups = self.groups.lock().await;
            let group = groups
                .get_mut(queue_name)
                .ok_or_else(|| GatewayError::QueueNotFound(queue_name.to_string()))?;
            group
                .workers
                .pop()
                .ok_or_else(|| GatewayError::Worker(format!("queue {} has no workers", queue_name)))?
        };
        Self::stop_worker(handle).await;
        Ok(())
    }

    /// Reconcile a queue's worker count to its configured target. This is
    /// the reconciliation primitive invoked after every definition change.
    pub async fn ensure_workers(&self, queue_name: &str) -> Result<usize> {
        let mut groups = self.groups.lock().await;
        let group = groups
            .get_mut(queue_name)
            .ok_or_else(|| GatewayError::QueueNotFound(queue_name.to_string()))?;

        let target = if group.def.enabled {
            group.def.workers.min(self.max_per_queue) as usize
        } else {
            0
        };

        while group.workers.len() < target {
            self.spawn_worker(group);
        }
        let mut removed = Vec::new();
        while group.workers.len() > target {
            if let Some(handle) = group.workers.pop() {
                removed.push(handle);
            }
        }
        let count = group.workers.len();
        drop(groups);

        for handle in removed {
            Self::stop_worker(handle).await;
        }
        Ok(count)
    }

    pub fn pause_all(&self) {
        info!("Pausing all workers");
        self.paused_all.store(true, Ordering::SeqCst);
    }

    pub fn resume_all(&self) {
        info!("Resuming all workers");
        self.paused_all.store(false, Ordering::SeqCst);
    }

    pub async fn pause_queue(&self, queue_name: &str) -> Result<()> {
        let groups = self.groups.lock().await;
        let group = groups
            .get(queue_name)
            .ok_or_else(|| GatewayError::QueueNotFound(queue_name.to_string()))?;
        group.queue.pause();
        for worker in &group.workers {
            worker.shared.paused.store(true, Ordering::SeqCst);
        }
        info!(queue = %queue_name, "Queue paused");
        Ok(())
    }

    pub async fn resume_queue(&self, queue_name: &str) -> Result<()> {
        let groups = self.groups.lock().await;
        let group = groups
            .get(queue_name)
            .ok_or_else(|| GatewayError::QueueNotFound(queue_name.to_string()))?;
        group.queue.resume();
        for worker in &group.workers {
            worker.shared.paused.store(false, Ordering::SeqCst);
        }
        info!(queue = %queue_name, "Queue resumed");
        Ok(())
    }

    pub async fn status(&self) -> Vec<QueueWorkerStatus> {
        let groups = self.groups.lock().await;
        let paused_all = self.paused_all.load(Ordering::SeqCst);

        let mut statuses: Vec<QueueWorkerStatus> = groups
            .values()
            .map(|group| QueueWorkerStatus {
                queue: group.def.name.clone(),
                concurrency: group.def.concurrency,
                configured_workers: group.def.workers,
                counts: group.queue.counts(),
                workers: group
                    .workers
                    .iter()
                    .map(|worker| WorkerStatus {
                        id: worker.id.clone(),
                        state: if worker.shared.stopping.load(Ordering::SeqCst) {
                            "stopped".to_string()
                        } else if paused_all || worker.shared.paused.load(Ordering::SeqCst) {
                            "paused".to_string()
                        } else {
                            "active".to_string()
                        },
                    })
                    .collect(),
            })
            .collect();
        statuses.sort_by(|a, b| a.queue.cmp(&b.queue));
        statuses
    }

    pub async fn worker_count(&self, queue_name: &str) -> usize {
        self.groups
            .lock()
            .await
            .get(queue_name)
            .map(|g| g.workers.len())
            .unwrap_or(0)
    }

    /// Stop every worker, waiting for in-flight jobs.
    pub async fn shutdown(&self) {
        info!("Worker pool shutting down");
        let groups: Vec<WorkerGroup> = {
            let mut map = self.groups.lock().await;
            map.drain().map(|(_, group)| group).collect()
        };
        for group in groups {
            for handle in group.workers {
                Self::stop_worker(handle).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn spawn_worker(&self, group: &mut WorkerGroup) -> String {
        group.next_index += 1;
        let id = format!("{}-{}-{}", group.def.name, self.strategy, group.next_index);
        let shared = Arc::new(WorkerShared {
            paused: AtomicBool::new(group.queue.is_paused()),
            stopping: AtomicBool::new(false),
        });

        let join = tokio::spawn(run_worker(
            id.clone(),
            group.def.clone(),
            group.queue.clone(),
            self.processor.clone(),
            shared.clone(),
            self.paused_all.clone(),
        ));

        info!(worker = %id, queue = %group.def.name, concurrency = group.def.concurrency, "Worker created");
        group.workers.push(WorkerHandle { id, shared, join });
        group.workers.last().map(|w| w.id.clone()).unwrap_or_default()
    }

    async fn stop_worker(handle: WorkerHandle) {
        handle.shared.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = handle.join.await {
            warn!(worker = %handle.id, error = %e, "Worker task ended abnormally");
        } else {
            info!(worker = %handle.id, "Worker stopped");
        }
    }

    async fn teardown_group_workers(&self, queue_name: &str) {
        let workers = {
            let mut groups = self.groups.lock().await;
            match groups.get_mut(queue_name) {
                Some(group) => std::mem::take(&mut group.workers),
                None => return,
            }
        };
        for handle in workers {
            Self::stop_worker(handle).await;
        }
    }
}

#[async_trait]
impl QueueEventListener for WorkerPool {
    async fn on_queue_created(&self, def: &QueueDefinition, queue: Arc<BrokerQueue>) {
        {
            let mut groups = self.groups.lock().await;
            groups.insert(
                def.name.clone(),
                WorkerGroup {
                    def: def.clone(),
                    queue,
                    workers: Vec::new(),
                    next_index: 0,
                },
            );
        }
        if let Err(e) = self.ensure_workers(&def.name).await {
            warn!(queue = %def.name, error = %e, "Failed to start workers for new queue");
        }
    }

    async fn on_queue_updated(
        &self,
        def: &QueueDefinition,
        queue: Arc<BrokerQueue>,
        concurrency_changed: bool,
    ) {
        let handle_changed = {
            let mut groups = self.groups.lock().await;
            match groups.get_mut(&def.name) {
                Some(group) => {
                    let changed = !Arc::ptr_eq(&group.queue, &queue);
                    group.def = def.clone();
                    group.queue = queue.clone();
                    changed
                }
                None => {
                    groups.insert(
                        def.name.clone(),
                        WorkerGroup {
                            def: def.clone(),
                            queue,
                            workers: Vec::new(),
                            next_index: 0,
                        },
                    );
                    false
                }
            }
        };

        // Workers bind concurrency and their queue handle at construction,
        // so either change forces a full teardown before reconciling.
        if concurrency_changed || handle_changed {
            debug!(queue = %def.name, "Tearing down workers before reconcile");
            self.teardown_group_workers(&def.name).await;
        }

        if let Err(e) = self.ensure_workers(&def.name).await {
            warn!(queue = %def.name, error = %e, "Worker reconciliation failed");
        }
    }

    async fn on_queue_removed(&self, name: &str) {
        let group = self.groups.lock().await.remove(name);
        if let Some(group) = group {
            for handle in group.workers {
                Self::stop_worker(handle).await;
            }
        }
        info!(queue = %name, "Worker group removed");
    }
}

/// The worker loop: pull jobs while active, run up to `concurrency` of them
/// in parallel, retry failed attempts through the queue's delayed set.
async fn run_worker(
    worker_id: String,
    def: QueueDefinition,
    queue: Arc<BrokerQueue>,
    processor: Arc<JobProcessor>,
    shared: Arc<WorkerShared>,
    paused_all: Arc<AtomicBool>,
) {
    let concurrency = def.concurrency.max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(concurrency));
    info!(worker = %worker_id, queue = %def.name, "Worker started");

    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        if shared.paused.load(Ordering::SeqCst) || paused_all.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        match queue.take() {
            Take::Job(taken) => {
                let worker_id = worker_id.clone();
                let def = def.clone();
                let queue = queue.clone();
                let processor = processor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let taken = *taken;
                    let mut job = taken.job;
                    let attempt = taken.attempt;

                    if def.processing_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(def.processing_delay_ms)).await;
                    }

                    match processor.process(&mut job, &def, &worker_id, attempt).await {
                        Ok(()) => {
                            queue.release();
                            processor.reemit_completion(&job.id, &def.name).await;
                        }
                        Err(failure) => {
                            queue.release();
                            if queue.can_retry(attempt) {
                                processor.note_retry(&job, &def, &failure, attempt);
                                queue.retry(job, attempt, def.priority);
                            } else {
                                processor.record_failure(&job, &def, &failure, attempt).await;
                            }
                        }
                    }
                });
            }
            Take::Closed => {
                drop(permit);
                break;
            }
            Take::Idle => {
                drop(permit);
                queue.wait_for_work().await;
            }
        }
    }

    // Graceful exit: wait until every in-flight job released its permit.
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!(worker = %worker_id, queue = %def.name, "Worker exiting");
}
