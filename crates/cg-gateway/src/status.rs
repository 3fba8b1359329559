//! StatusFabric - authoritative in-memory job status with subscriber fan-out
//!
//! Every accepted status write fans out to the subscribers registered for
//! that job id. Writes are monotonic by timestamp: stale updates are
//! discarded, which makes re-emitting a completion after the fact harmless.
//! Fan-out is non-blocking; a subscriber that cannot keep up is disconnected.

use cg_common::{JobStatus, JobStatusUpdate};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Status entries older than this are dropped by housekeeping.
const STATUS_MAX_AGE: Duration = Duration::from_secs(3600);
/// Subscriber handles idle longer than this are disconnected.
const SUBSCRIBER_IDLE_MAX: Duration = Duration::from_secs(300);

const FANOUT_BUFFER: usize = 64;

struct Subscriber {
    tx: mpsc::Sender<JobStatusUpdate>,
    last_seen: Mutex<Instant>,
    jobs: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusStatistics {
    pub total_jobs: usize,
    pub by_status: HashMap<String, u64>,
    /// Epoch milliseconds of the oldest tracked status.
    pub oldest_timestamp: Option<i64>,
    pub subscribers: usize,
}

#[derive(Default)]
pub struct StatusFabric {
    statuses: DashMap<String, JobStatusUpdate>,
    subscribers: DashMap<Uuid, Subscriber>,
    /// jobId -> subscriber handles interested in it.
    job_index: DashMap<String, HashSet<Uuid>>,
}

impl StatusFabric {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Apply a status update if it is not stale, then fan it out.
    pub fn update(&self, update: JobStatusUpdate) {
        {
            let existing = self.statuses.get(&update.job_id);
            if let Some(existing) = existing {
                if existing.timestamp > update.timestamp {
                    debug!(
                        job_id = %update.job_id,
                        incoming = update.timestamp,
                        existing = existing.timestamp,
                        "Discarding stale status update"
                    );
                    return;
                }
            }
        }
        self.statuses.insert(update.job_id.clone(), update.clone());
        self.fan_out(&update);
    }

    pub fn mark_queued(&self, job_id: &str, queue: &str) {
        self.update(JobStatusUpdate::now(job_id, JobStatus::Queued, queue));
    }

    pub fn mark_processing(&self, job_id: &str, queue: &str) {
        self.update(JobStatusUpdate::now(job_id, JobStatus::Processing, queue));
    }

    pub fn mark_completed(&self, job_id: &str, queue: &str) {
        self.update(JobStatusUpdate::now(job_id, JobStatus::Completed, queue));
    }

    pub fn mark_failed(&self, job_id: &str, queue: &str) {
        self.update(JobStatusUpdate::now(job_id, JobStatus::Failed, queue));
    }

    fn fan_out(&self, update: &JobStatusUpdate) {
        // Copy the handle set out so no map guard is held during sends.
        let handles: Vec<Uuid> = match self.job_index.get(&update.job_id) {
            Some(entry) => entry.iter().copied().collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for handle in handles {
            if let Some(subscriber) = self.subscribers.get(&handle) {
                if subscriber.tx.try_send(update.clone()).is_err() {
                    warn!(handle = %handle, job_id = %update.job_id, "Subscriber not keeping up - disconnecting");
                    dead.push(handle);
                }
            }
        }
        for handle in dead {
            self.drop_handle(handle);
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a push handle. The receiver carries every update for job ids
    /// the handle subscribes to.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<JobStatusUpdate>) {
        let (tx, rx) = mpsc::channel(FANOUT_BUFFER);
        let handle = Uuid::new_v4();
        self.subscribers.insert(
            handle,
            Subscriber {
                tx,
                last_seen: Mutex::new(Instant::now()),
                jobs: Mutex::new(HashSet::new()),
            },
        );
        (handle, rx)
    }

    pub fn subscribe(&self, handle: Uuid, job_id: &str) -> bool {
        let Some(subscriber) = self.subscribers.get(&handle) else {
            return false;
        };
        subscriber.jobs.lock().insert(job_id.to_string());
        drop(subscriber);
        self.job_index
            .entry(job_id.to_string())
            .or_default()
            .insert(handle);
        true
    }

    pub fn unsubscribe(&self, handle: Uuid, job_id: &str) {
        if let Some(subscriber) = self.subscribers.get(&handle) {
            subscriber.jobs.lock().remove(job_id);
        }
        if let Some(mut entry) = self.job_index.get_mut(job_id) {
            entry.remove(&handle);
        }
    }

    /// Remove a handle and every binding it holds.
    pub fn drop_handle(&self, handle: Uuid) {
        let Some((_, subscriber)) = self.subscribers.remove(&handle) else {
            return;
        };
        let jobs = subscriber.jobs.lock().clone();
        for job_id in jobs {
            if let Some(mut entry) = self.job_index.get_mut(&job_id) {
                entry.remove(&handle);
            }
        }
    }

    /// Record subscriber liveness (pings and inbound messages).
    pub fn touch(&self, handle: Uuid) {
        if let Some(subscriber) = self.subscribers.get(&handle) {
            *subscriber.last_seen.lock() = Instant::now();
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_status(&self, job_id: &str) -> Option<JobStatusUpdate> {
        self.statuses.get(job_id).map(|entry| entry.clone())
    }

    pub fn statistics(&self) -> StatusStatistics {
        let mut by_status: HashMap<String, u64> = HashMap::new();
        let mut oldest: Option<i64> = None;
        for entry in self.statuses.iter() {
            *by_status.entry(entry.status.to_string()).or_default() += 1;
            oldest = Some(match oldest {
                Some(current) => current.min(entry.timestamp),
                None => entry.timestamp,
            });
        }
        StatusStatistics {
            total_jobs: self.statuses.len(),
            by_status,
            oldest_timestamp: oldest,
            subscribers: self.subscribers.len(),
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Drop status entries older than one hour and disconnect handles idle
    /// for more than five minutes. Returns (statuses dropped, handles
    /// disconnected).
    pub fn housekeeping(&self) -> (usize, usize) {
        let cutoff = Utc::now().timestamp_millis() - STATUS_MAX_AGE.as_millis() as i64;
        let before = self.statuses.len();
        self.statuses.retain(|_, update| update.timestamp >= cutoff);
        let dropped = before - self.statuses.len();

        let idle: Vec<Uuid> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().last_seen.lock().elapsed() > SUBSCRIBER_IDLE_MAX)
            .map(|entry| *entry.key())
            .collect();
        let disconnected = idle.len();
        for handle in idle {
            self.drop_handle(handle);
        }

        if dropped > 0 || disconnected > 0 {
            info!(
                dropped_statuses = dropped,
                disconnected_handles = disconnected,
                "Status fabric housekeeping"
            );
        }
        (dropped, disconnected)
    }
}

/// Background task running housekeeping every five minutes.
pub fn spawn_status_housekeeping(fabric: Arc<StatusFabric>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            fabric.housekeeping();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_updates_are_discarded() {
        let fabric = StatusFabric::new();
        let mut newer = JobStatusUpdate::now("j1", JobStatus::Completed, "standard");
        newer.timestamp = 2000;
        let mut older = JobStatusUpdate::now("j1", JobStatus::Processing, "standard");
        older.timestamp = 1000;

        fabric.update(newer);
        fabric.update(older);

        assert_eq!(
            fabric.get_status("j1").unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn subscribers_receive_updates_for_their_jobs_only() {
        let fabric = StatusFabric::new();
        let (handle, mut rx) = fabric.register();
        assert!(fabric.subscribe(handle, "j1"));

        fabric.mark_queued("j1", "standard");
        fabric.mark_queued("j2", "standard");

        let update = rx.recv().await.unwrap();
        assert_eq!(update.job_id, "j1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_handle_removes_every_binding() {
        let fabric = StatusFabric::new();
        let (handle, mut rx) = fabric.register();
        fabric.subscribe(handle, "j1");
        fabric.subscribe(handle, "j2");

        fabric.drop_handle(handle);
        fabric.mark_queued("j1", "standard");

        assert!(rx.recv().await.is_none());
        assert!(fabric.job_index.get("j1").map(|e| e.is_empty()).unwrap_or(true));
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected() {
        let fabric = StatusFabric::new();
        let (handle, _rx) = fabric.register();
        fabric.subscribe(handle, "j1");

        // Fill the buffer past capacity without draining.
        for _ in 0..(FANOUT_BUFFER + 2) {
            fabric.mark_queued("j1", "standard");
        }

        assert!(fabric.subscribers.get(&handle).is_none());
    }

    #[test]
    fn statistics_count_by_status() {
        let fabric = StatusFabric::new();
        fabric.mark_queued("j1", "standard");
        fabric.mark_completed("j2", "standard");
        fabric.mark_completed("j3", "standard");

        let stats = fabric.statistics();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.by_status.get("completed"), Some(&2));
        assert!(stats.oldest_timestamp.is_some());
    }

    #[test]
    fn housekeeping_drops_old_statuses() {
        let fabric = StatusFabric::new();
        let mut old = JobStatusUpdate::now("j1", JobStatus::Completed, "standard");
        old.timestamp = Utc::now().timestamp_millis() - 2 * 3600 * 1000;
        fabric.update(old);
        fabric.mark_queued("j2", "standard");

        let (dropped, _) = fabric.housekeeping();
        assert_eq!(dropped, 1);
        assert!(fabric.get_status("j1").is_none());
        assert!(fabric.get_status("j2").is_some());
    }
}
