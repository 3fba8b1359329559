use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Queue already exists: {0}")]
    QueueExists(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue not initialized: {0}")]
    QueueUnavailable(String),

    #[error("Cannot remove the default queue: {0}")]
    DefaultQueueRemoval(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(#[from] cg_bus::BusError),

    #[error("Store error: {0}")]
    Store(#[from] cg_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}
