//! Configuration loader with environment variable support

use crate::{AppConfig, ConfigError};
use cg_common::QueueSystemConfig;
use std::env;
use tracing::{info, warn};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults with environment variable overrides.
    pub fn load() -> AppConfig {
        let mut config = AppConfig::default();
        Self::apply_env_overrides(&mut config);
        config
    }

    /// Load the queue-system config seed: `QUEUE_CONFIG_PATH` JSON when
    /// present, built-in defaults otherwise. Worker-count and default-queue
    /// overrides from the environment are applied on top.
    pub fn load_queue_system_config(app: &AppConfig) -> Result<QueueSystemConfig, ConfigError> {
        let mut system = match &app.queue.config_path {
            Some(path) => {
                info!(path = %path, "Loading queue config seed from file");
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => QueueSystemConfig::default(),
        };

        system.default_queue = app.queue.default_name.clone();
        system.job_ttl_secs = app.queue.job_ttl_secs;
        system.polling_timeout_secs = app.queue.polling_timeout_secs;

        if system.get(&system.default_queue).is_none() {
            warn!(
                default_queue = %system.default_queue,
                "Default queue missing from seed config - adding it"
            );
            let def = cg_common::QueueDefinition::new(&system.default_queue.clone());
            system.queues.push(def);
        }

        for def in &mut system.queues {
            if let Some(&workers) = app.queue.worker_overrides.get(&def.name) {
                def.workers = workers.min(app.queue.worker_max_per_queue);
            }
        }

        Ok(system)
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }

        // Message bus
        if let Ok(val) = env::var("NATS_SERVERS") {
            config.bus.servers = val.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(val) = env::var("NATS_REQUEST_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.bus.request_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("NATS_CONNECT_RETRIES") {
            if let Ok(n) = val.parse() {
                config.bus.connect_retries = n;
            }
        }
        if let Ok(val) = env::var("NATS_RETRY_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                config.bus.retry_delay_ms = ms;
            }
        }

        // Key-value store
        if let Ok(val) = env::var("REDIS_HOST") {
            config.store.host = val;
        }
        if let Ok(val) = env::var("REDIS_PORT") {
            if let Ok(port) = val.parse() {
                config.store.port = port;
            }
        }
        if let Ok(val) = env::var("REDIS_PASSWORD") {
            if !val.is_empty() {
                config.store.password = Some(val);
            }
        }
        if let Ok(val) = env::var("REDIS_DB") {
            if let Ok(db) = val.parse() {
                config.store.db = db;
            }
        }

        // Queue system
        if let Ok(val) = env::var("QUEUE_ENABLED") {
            config.queue.enabled = parse_bool(&val);
        }
        if let Ok(val) = env::var("QUEUE_SYSTEM_ENABLED") {
            config.queue.enabled = parse_bool(&val);
        }
        if let Ok(val) = env::var("QUEUE_EXCLUSIONS") {
            config.queue.exclusions = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = env::var("QUEUE_DEFAULT_NAME") {
            config.queue.default_name = val;
        }
        if let Ok(val) = env::var("QUEUE_JOB_TTL") {
            if let Ok(secs) = val.parse() {
                config.queue.job_ttl_secs = secs;
            }
        }
        if let Ok(val) = env::var("QUEUE_POLLING_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.queue.polling_timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("QUEUE_CONFIG_PATH") {
            if !val.is_empty() {
                config.queue.config_path = Some(val);
            }
        }
        if let Ok(val) = env::var("QUEUE_CONFIG_KEY") {
            config.queue.config_key = val;
        }
        if let Ok(val) = env::var("QUEUE_CONFIG_CHANNEL") {
            config.queue.config_channel = val;
        }
        if let Ok(val) = env::var("QUEUE_RESULT_TTL") {
            if let Ok(secs) = val.parse() {
                config.queue.result_ttl_secs = secs;
            }
        }
        if let Ok(val) = env::var("QUEUE_RESULT_HISTORY_LIMIT") {
            if let Ok(limit) = val.parse() {
                config.queue.result_history_limit = limit;
            }
        }
        if let Ok(val) = env::var("WORKER_STRATEGY") {
            config.queue.worker_strategy = val;
        }
        if let Ok(val) = env::var("WORKER_MAX_PER_QUEUE") {
            if let Ok(n) = val.parse() {
                config.queue.worker_max_per_queue = n;
            }
        }
        if let Ok(val) = env::var("INSTANCE_ID") {
            config.instance_id = val;
        }

        // QUEUE_{NAME}_WORKERS per-queue overrides
        for (key, val) in env::vars() {
            if let Some(rest) = key.strip_prefix("QUEUE_") {
                if let Some(name) = rest.strip_suffix("_WORKERS") {
                    if name.is_empty() {
                        continue;
                    }
                    if let Ok(n) = val.parse::<u32>() {
                        config
                            .queue
                            .worker_overrides
                            .insert(name.to_lowercase(), n);
                    }
                }
            }
        }
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(
        val.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.queue.enabled);
        assert_eq!(config.queue.config_key, "queues:config");
        assert_eq!(config.queue.config_channel, "queues:config:events");
        assert_eq!(config.queue.result_ttl_secs, 86_400);
        assert_eq!(config.queue.result_history_limit, 100);
    }

    #[test]
    fn result_ttl_has_a_floor() {
        let mut settings = crate::QueueSettings::default();
        settings.result_ttl_secs = 5;
        assert_eq!(settings.effective_result_ttl_secs(), 60);
    }

    #[test]
    fn store_url_includes_password_and_db() {
        let store = crate::StoreConfig {
            host: "kv.local".to_string(),
            port: 6380,
            password: Some("secret".to_string()),
            db: 2,
        };
        assert_eq!(store.url(), "redis://:secret@kv.local:6380/2");
    }

    #[test]
    fn queue_seed_falls_back_to_defaults() {
        let app = AppConfig::default();
        let system = ConfigLoader::load_queue_system_config(&app).unwrap();
        assert!(system.get("standard").is_some());
        assert_eq!(system.default_queue, "standard");
    }

    #[test]
    fn queue_seed_reads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"queues":[{{"name":"standard"}},{{"name":"vip","priority":20,"urlPatterns":["/vip/*"]}}],"defaultQueue":"standard","jobTtlSecs":600,"pollingTimeoutSecs":10}}"#
        )
        .unwrap();

        let mut app = AppConfig::default();
        app.queue.config_path = Some(file.path().to_string_lossy().to_string());

        let system = ConfigLoader::load_queue_system_config(&app).unwrap();
        assert_eq!(system.queues.len(), 2);
        assert_eq!(system.get("vip").unwrap().priority, 20);
    }

    #[test]
    fn worker_overrides_are_capped() {
        let mut app = AppConfig::default();
        app.queue.worker_max_per_queue = 4;
        app.queue.worker_overrides.insert("standard".to_string(), 99);

        let system = ConfigLoader::load_queue_system_config(&app).unwrap();
        assert_eq!(system.get("standard").unwrap().workers, 4);
    }
}
