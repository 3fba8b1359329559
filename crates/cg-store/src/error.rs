use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("Subscription failed: {0}")]
    Subscribe(String),
}
