//! In-memory key-value store for dev mode and tests.
//!
//! Honors TTLs lazily (expired entries are dropped on read) and fans pub/sub
//! messages out through per-channel broadcast senders.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

use crate::{KvStore, Result};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, Entry>,
    lists: DashMap<String, Mutex<VecDeque<String>>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.strings.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.strings.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let list = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        list.lock().push_front(value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        if let Some(list) = self.lists.get(key) {
            let mut guard = list.lock();
            let len = guard.len() as isize;
            let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i.min(len) };
            let start = norm(start) as usize;
            let stop = norm(stop) as usize;
            let kept: VecDeque<String> = guard
                .iter()
                .skip(start)
                .take(stop.saturating_sub(start) + 1)
                .cloned()
                .collect();
            *guard = kept;
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        if let Some(list) = self.lists.get(key) {
            let guard = list.lock();
            let len = guard.len() as isize;
            let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i.min(len) };
            let start = norm(start) as usize;
            let stop = norm(stop) as usize;
            return Ok(guard
                .iter()
                .skip(start)
                .take(stop.saturating_sub(start) + 1)
                .cloned()
                .collect());
        }
        Ok(Vec::new())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|l| l.lock().len()).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // Send fails when nobody is subscribed, which is fine.
        let _ = self.channel(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut broadcast_rx = self.channel(channel).subscribe();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Ok(msg) = broadcast_rx.recv().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> bool {
        true
    }
}
