//! Gateway configuration: struct defaults plus environment-variable overrides.
//!
//! The gateway is configured env-first; a JSON seed file for the queue-system
//! config is honored when `QUEUE_CONFIG_PATH` points at one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod loader;

pub use loader::ConfigLoader;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub queue: QueueSettings,
    /// Unique id of this gateway instance, used to tag config change events.
    pub instance_id: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            bus: BusConfig::default(),
            store: StoreConfig::default(),
            queue: QueueSettings::default(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Message-bus (NATS) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub servers: Vec<String>,
    /// Default request-reply timeout in seconds; per-job timeouts override it.
    pub request_timeout_secs: u64,
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            request_timeout_secs: 30,
            connect_retries: 5,
            retry_delay_ms: 2000,
        }
    }
}

/// Key-value store (Redis) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl StoreConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Queue-system settings drawn from the `QUEUE_*` / `WORKER_*` environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Global interception switch. Off means every request is forwarded
    /// synchronously.
    pub enabled: bool,
    /// Path prefixes never intercepted, beyond the built-in set.
    pub exclusions: Vec<String>,
    /// Name of the default queue.
    pub default_name: String,
    /// Global job TTL in seconds.
    pub job_ttl_secs: u64,
    /// Poll endpoint long-poll budget in seconds.
    pub polling_timeout_secs: u64,
    /// Optional JSON seed file for the queue-system config.
    pub config_path: Option<String>,
    /// Storage key holding the persisted queue-system config.
    pub config_key: String,
    /// Pub/sub channel for cross-instance config change events.
    pub config_channel: String,
    /// TTL for per-job result records, in seconds (minimum 60).
    pub result_ttl_secs: u64,
    /// Bound on the rolling completed/failed history lists.
    pub result_history_limit: usize,
    /// Worker naming strategy segment ({queue}-{strategy}-{n}).
    pub worker_strategy: String,
    /// Upper bound on workers per queue.
    pub worker_max_per_queue: u32,
    /// Per-queue worker-count overrides from `QUEUE_{NAME}_WORKERS`.
    pub worker_overrides: HashMap<String, u32>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            exclusions: Vec::new(),
            default_name: "standard".to_string(),
            job_ttl_secs: 3600,
            polling_timeout_secs: 30,
            config_path: None,
            config_key: "queues:config".to_string(),
            config_channel: "queues:config:events".to_string(),
            result_ttl_secs: 86_400,
            result_history_limit: 100,
            worker_strategy: "default".to_string(),
            worker_max_per_queue: 10,
            worker_overrides: HashMap::new(),
        }
    }
}

impl QueueSettings {
    /// Result TTL clamped to its floor of 60 seconds.
    pub fn effective_result_ttl_secs(&self) -> u64 {
        self.result_ttl_secs.max(60)
    }
}
