//! Key-value store client
//!
//! The gateway persists queue configuration, job results and the rolling
//! history lists in a key-value store, and uses its pub/sub channels for
//! cross-instance config change events. [`KvStore`] is the capability trait;
//! [`RedisStore`] is the production implementation and [`MemoryStore`] backs
//! dev mode and tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod error;
mod memory;
mod redis_store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// String, list and pub/sub operations the gateway needs from its store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set with a TTL in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Push onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;

    /// Trim a list to the inclusive index range, dropping the tail.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Publish a message on a pub/sub channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to a channel. Messages arrive on the returned receiver until
    /// the subscription is dropped or the connection dies.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    /// Whether the store currently looks reachable.
    async fn ping(&self) -> bool;
}
