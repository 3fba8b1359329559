//! Message-bus client
//!
//! Wraps the NATS connection behind the [`BusClient`] trait so the job
//! processor and the synchronous fallback dispatcher stay broker-agnostic.
//! Subjects are hierarchical names owned by the downstream microservices
//! (`programs.courses.create`, `enrollments.atomic.enroll`, ...); the gateway
//! is a client only.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod error;

pub use error::BusError;

pub type Result<T> = std::result::Result<T, BusError>;

/// Publish / request-reply surface of the message bus.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<()>;

    /// Request-reply with a hard deadline. A deadline breach maps to
    /// [`BusError::Timeout`] so the caller can classify it.
    async fn request(
        &self,
        subject: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;

    /// Whether the underlying connection currently looks usable.
    fn is_connected(&self) -> bool;
}

/// NATS-backed implementation of [`BusClient`].
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the configured servers, retrying with a fixed delay.
    pub async fn connect(config: &cg_config::BusConfig) -> Result<Self> {
        let servers = config.servers.join(",");
        let mut last_error = String::new();

        for attempt in 1..=config.connect_retries.max(1) {
            debug!(
                attempt = attempt,
                servers = %servers,
                "Connecting to message bus"
            );

            match async_nats::connect(&servers).await {
                Ok(client) => {
                    if attempt > 1 {
                        info!(attempt = attempt, "Connected to message bus after retries");
                    } else {
                        info!(servers = %servers, "Connected to message bus");
                    }
                    return Ok(Self { client });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < config.connect_retries {
                        warn!(
                            attempt = attempt,
                            error = %e,
                            retry_delay_ms = config.retry_delay_ms,
                            "Bus connection failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
                    }
                }
            }
        }

        Err(BusError::Connect(last_error))
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl BusClient for NatsBus {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(&payload)?);
        self.client
            .publish(subject.to_string(), bytes)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let bytes = Bytes::from(serde_json::to_vec(&payload)?);

        let reply = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), bytes),
        )
        .await
        .map_err(|_| BusError::Timeout {
            subject: subject.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| BusError::Request(e.to_string()))?;

        let value = serde_json::from_slice(&reply.payload)?;
        Ok(value)
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
