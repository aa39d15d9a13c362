use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed channel token: {0}")]
    MalformedToken(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
