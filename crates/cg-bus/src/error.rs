use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request to {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
