//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("topic not subscribed: {0}")]
    UnknownTopic(String),

    #[error("queue closed: {0}")]
    Closed(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("provider error: {0}")]
    Provider(String),
}
