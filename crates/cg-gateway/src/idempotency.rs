//! Idempotency service - at-most-one execution per client-supplied key
//!
//! A process-local TTL map keyed by `X-Idempotency-Key`. The first caller
//! installs a pending entry and proceeds; concurrent callers park on a watch
//! channel and are handed the stored response once it lands. Completed
//! responses are served for one hour without re-execution. Behind a trait so
//! a store-backed implementation can replace the process-local map.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How long completed responses are replayed.
const COMPLETED_TTL: Duration = Duration::from_secs(3600);
/// Upper bound on how long a concurrent caller waits for the first one.
const PENDING_WAIT: Duration = Duration::from_secs(10);

pub enum IdempotencyOutcome {
    /// First execution for this key; the caller must `complete` or `abandon`.
    New,
    /// A previous or concurrent execution already produced this response.
    Replayed(Value),
}

#[async_trait]
pub trait IdempotencyService: Send + Sync {
    /// Claim a key. Returns `New` for the first caller; everyone else gets
    /// the stored response, waiting for a concurrent first caller if needed.
    async fn begin(&self, key: &str) -> IdempotencyOutcome;

    /// Store the response for a claimed key, releasing any waiters.
    fn complete(&self, key: &str, response: Value);

    /// Release a claimed key without a response so a later caller can
    /// execute.
    fn abandon(&self, key: &str);
}

struct IdemEntry {
    tx: watch::Sender<Option<Value>>,
    rx: watch::Receiver<Option<Value>>,
    created_at: Instant,
}

#[derive(Default)]
pub struct InMemoryIdempotency {
    entries: DashMap<String, IdemEntry>,
}

impl InMemoryIdempotency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop completed/stale entries past their TTL. Returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() < COMPLETED_TTL);
        before - self.entries.len()
    }
}

#[async_trait]
impl IdempotencyService for InMemoryIdempotency {
    async fn begin(&self, key: &str) -> IdempotencyOutcome {
        let rx = {
            match self.entries.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(IdemEntry {
                        tx,
                        rx,
                        created_at: Instant::now(),
                    });
                    debug!(key = %key, "Idempotency key claimed");
                    return IdempotencyOutcome::New;
                }
                dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().rx.clone(),
            }
        };

        // A stored response replays immediately; otherwise wait for the
        // concurrent first caller, bounded so a lost writer cannot park us
        // forever.
        let mut rx = rx;
        let wait_result = tokio::time::timeout(PENDING_WAIT, rx.wait_for(|v| v.is_some()))
            .await
            .map(|inner| inner.map(|guard| guard.clone()));
        match wait_result {
            Ok(Ok(value)) => IdempotencyOutcome::Replayed(
                value.unwrap_or(Value::Null),
            ),
            Ok(Err(_)) | Err(_) => {
                // Writer abandoned or timed out; let this caller execute.
                warn!(key = %key, "Pending idempotent execution vanished - re-claiming");
                self.entries.remove(key);
                let (tx, rx) = watch::channel(None);
                self.entries.insert(
                    key.to_string(),
                    IdemEntry {
                        tx,
                        rx,
                        created_at: Instant::now(),
                    },
                );
                IdempotencyOutcome::New
            }
        }
    }

    fn complete(&self, key: &str, response: Value) {
        if let Some(entry) = self.entries.get(key) {
            let _ = entry.tx.send(Some(response));
        }
    }

    fn abandon(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Background sweep of expired idempotency entries.
pub fn spawn_idempotency_cleanup(
    service: Arc<InMemoryIdempotency>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = service.cleanup();
            if removed > 0 {
                debug!(removed = removed, "Idempotency cleanup");
            }
        }
    })
}
