//! BrokerQueue - in-process priority queue backing one queue definition
//!
//! Jobs are served highest-priority first, FIFO within equal priority.
//! Failed attempts come back through a delayed set with exponential backoff.
//! Pause blocks new pick-up without preempting in-flight jobs. The live
//! counts (waiting / active / delayed / paused) are what the queue router
//! reads as load.

use cg_common::Job;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use utoipa::ToSchema;

/// Live job counts for one queue. Load is the sum of all four.
#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub paused: u64,
}

impl QueueCounts {
    pub fn load(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.paused
    }
}

struct PendingJob {
    job: Job,
    priority: i32,
    seq: u64,
    /// Attempts already made (0 for a fresh job).
    attempts_made: u32,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then FIFO by sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedJob {
    run_at: Instant,
    pending: PendingJob,
}

#[derive(Default)]
struct Inner {
    waiting: BinaryHeap<PendingJob>,
    delayed: Vec<DelayedJob>,
    seq: u64,
}

/// A job handed to a worker. `attempt` is 1-based.
pub struct TakenJob {
    pub job: Job,
    pub attempt: u32,
}

/// Result of a `take()` call.
pub enum Take {
    Job(Box<TakenJob>),
    /// Queue closed; the worker loop should exit.
    Closed,
    /// Nothing available right now (paused or empty).
    Idle,
}

pub struct BrokerQueue {
    name: String,
    /// Maximum delivery attempts, bound at construction.
    attempts: u32,
    /// Base retry delay in milliseconds, bound at construction.
    retry_delay_ms: u64,
    inner: Mutex<Inner>,
    paused: AtomicBool,
    closed: AtomicBool,
    active: AtomicU32,
    notify: Notify,
}

impl BrokerQueue {
    pub fn new(name: &str, attempts: u32, retry_delay_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            attempts: attempts.max(1),
            retry_delay_ms,
            inner: Mutex::new(Inner::default()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            active: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts
    }

    /// Enqueue a fresh job with the given priority.
    pub fn enqueue(&self, job: Job, priority: i32) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(crate::GatewayError::QueueUnavailable(self.name.clone()));
        }

        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.waiting.push(PendingJob {
            job,
            priority,
            seq,
            attempts_made: 0,
        });
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }

    /// Take the next job if one is available. Promotes due delayed jobs
    /// first. Non-blocking; workers poll this behind `wait_for_work`.
    pub fn take(&self) -> Take {
        if self.closed.load(Ordering::SeqCst) {
            return Take::Closed;
        }

        self.promote_due();

        if self.paused.load(Ordering::SeqCst) {
            return Take::Idle;
        }

        let mut inner = self.inner.lock();
        match inner.waiting.pop() {
            Some(pending) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                Take::Job(Box::new(TakenJob {
                    job: pending.job,
                    attempt: pending.attempts_made + 1,
                }))
            }
            None => Take::Idle,
        }
    }

    /// Park until the queue signals new work, or a short tick elapses so
    /// delayed promotions and pause flips are observed.
    pub async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    /// Release an active slot after processing finished (either way).
    pub fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// Re-insert a job migrated from a rebuilt queue, preserving its attempt
    /// count.
    pub fn restore(&self, job: Job, attempts_made: u32, priority: i32) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(queue = %self.name, job_id = %job.id, "Dropping restore for closed queue");
            return;
        }
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.waiting.push(PendingJob {
            job,
            priority,
            seq,
            attempts_made,
        });
        drop(inner);
        self.notify.notify_one();
    }

    /// Schedule a retry with exponential backoff:
    /// `retry_delay * 2^(attempt-1)`.
    pub fn retry(&self, job: Job, attempt: u32, priority: i32) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(queue = %self.name, job_id = %job.id, "Dropping retry for closed queue");
            return;
        }

        let backoff = self
            .retry_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let run_at = Instant::now() + Duration::from_millis(backoff);

        debug!(
            queue = %self.name,
            job_id = %job.id,
            attempt = attempt,
            backoff_ms = backoff,
            "Scheduling retry"
        );

        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.delayed.push(DelayedJob {
            run_at,
            pending: PendingJob {
                job,
                priority,
                seq,
                attempts_made: attempt,
            },
        });
    }

    fn promote_due(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.delayed.is_empty() {
            return;
        }
        let mut promoted = false;
        let mut idx = 0;
        while idx < inner.delayed.len() {
            if inner.delayed[idx].run_at <= now {
                let delayed = inner.delayed.swap_remove(idx);
                inner.waiting.push(delayed.pending);
                promoted = true;
            } else {
                idx += 1;
            }
        }
        drop(inner);
        if promoted {
            self.notify.notify_one();
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Close the queue: no further enqueues or takes. In-flight jobs are the
    /// workers' responsibility to finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drain waiting and delayed jobs, e.g. to migrate them into a rebuilt
    /// queue. Closes this queue as a side effect.
    pub fn drain_pending(&self) -> Vec<(Job, u32, i32)> {
        self.close();
        let mut inner = self.inner.lock();
        let mut drained: Vec<(Job, u32, i32)> = Vec::new();

        // Preserve priority-then-FIFO order for the migration.
        while let Some(pending) = inner.waiting.pop() {
            drained.push((pending.job, pending.attempts_made, pending.priority));
        }
        for delayed in inner.delayed.drain(..) {
            drained.push((
                delayed.pending.job,
                delayed.pending.attempts_made,
                delayed.pending.priority,
            ));
        }
        drained
    }

    pub fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock();
        let queued = inner.waiting.len() as u64;
        let delayed = inner.delayed.len() as u64;
        drop(inner);

        let paused = self.paused.load(Ordering::SeqCst);
        QueueCounts {
            waiting: if paused { 0 } else { queued },
            active: self.active.load(Ordering::SeqCst) as u64,
            delayed,
            paused: if paused { queued } else { 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::make_job;

    fn take_id(queue: &BrokerQueue) -> String {
        match queue.take() {
            Take::Job(taken) => taken.job.id,
            _ => panic!("expected a job"),
        }
    }

    #[test]
    fn serves_higher_priority_first_then_fifo() {
        let queue = BrokerQueue::new("q", 3, 10);
        queue.enqueue(make_job("low-1"), 1).unwrap();
        queue.enqueue(make_job("high"), 10).unwrap();
        queue.enqueue(make_job("low-2"), 1).unwrap();

        assert_eq!(take_id(&queue), "high");
        assert_eq!(take_id(&queue), "low-1");
        assert_eq!(take_id(&queue), "low-2");
    }

    #[test]
    fn pause_blocks_pickup_and_reports_paused_count() {
        let queue = BrokerQueue::new("q", 3, 10);
        queue.enqueue(make_job("a"), 0).unwrap();
        queue.pause();

        assert!(matches!(queue.take(), Take::Idle));
        let counts = queue.counts();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.load(), 1);

        queue.resume();
        assert_eq!(take_id(&queue), "a");
    }

    #[tokio::test]
    async fn retry_promotes_after_backoff() {
        let queue = BrokerQueue::new("q", 3, 10);
        queue.retry(make_job("r"), 1, 0);

        assert_eq!(queue.counts().delayed, 1);
        assert!(matches!(queue.take(), Take::Idle));

        tokio::time::sleep(Duration::from_millis(30)).await;
        match queue.take() {
            Take::Job(taken) => {
                assert_eq!(taken.job.id, "r");
                assert_eq!(taken.attempt, 2);
            }
            _ => panic!("expected promoted retry"),
        }
    }

    #[test]
    fn counts_track_active_jobs() {
        let queue = BrokerQueue::new("q", 3, 10);
        queue.enqueue(make_job("a"), 0).unwrap();
        let _ = queue.take();
        assert_eq!(queue.counts().active, 1);
        queue.release();
        assert_eq!(queue.counts().active, 0);
    }

    #[test]
    fn closed_queue_rejects_enqueue() {
        let queue = BrokerQueue::new("q", 3, 10);
        queue.close();
        assert!(queue.enqueue(make_job("a"), 0).is_err());
        assert!(matches!(queue.take(), Take::Closed));
    }

    #[test]
    fn drain_preserves_order() {
        let queue = BrokerQueue::new("q", 3, 10);
        queue.enqueue(make_job("b"), 1).unwrap();
        queue.enqueue(make_job("a"), 5).unwrap();
        let drained = queue.drain_pending();
        assert_eq!(drained[0].0.id, "a");
        assert_eq!(drained[1].0.id, "b");
        assert!(queue.is_closed());
    }

    #[test]
    fn retry_caps_at_max_attempts() {
        let queue = BrokerQueue::new("q", 3, 10);
        assert!(queue.can_retry(1));
        assert!(queue.can_retry(2));
        assert!(!queue.can_retry(3));
    }
}
