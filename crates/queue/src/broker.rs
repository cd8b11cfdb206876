//! Broker trait and the records that cross it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A raw message received from a topic-partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    /// Position in the partition; committing `offset + 1` acknowledges it.
    pub offset: i64,
    /// Raw message body (JSON string).
    pub body: String,
    /// When the message was produced.
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been delivered, when the provider knows.
    pub attempt_count: u32,
}

/// Acknowledgment of everything in a topic-partition below `offset_to_commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub topic: String,
    pub partition: i32,
    pub offset_to_commit: i64,
}

impl CommitRecord {
    /// Record acknowledging the message at `offset`.
    pub fn after(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset_to_commit: offset + 1,
        }
    }
}

/// Health status of a broker connection.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub connected: bool,
    /// Approximate number of messages waiting across all subscribed topics.
    pub approximate_backlog: Option<u64>,
    /// Provider name (e.g., "sqs", "memory").
    pub provider: String,
}

impl fmt::Display for BrokerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BrokerHealth {{ connected: {}, backlog: {:?}, provider: {} }}",
            self.connected, self.approximate_backlog, self.provider
        )
    }
}

/// Consumer side of a partitioned message broker with manual offset commit.
///
/// Implementations subscribe to a fixed topic set at construction time.
/// Delivery is at-least-once: anything not committed may be delivered again
/// to the next consumer session.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Poll up to `max_messages` across all subscribed partitions.
    ///
    /// Waits at most roughly `timeout` and returns an empty vec if nothing
    /// arrived.
    async fn poll(
        &self,
        max_messages: u32,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, QueueError>;

    /// Commit consumer offsets. Each record acknowledges every message of
    /// its topic-partition below `offset_to_commit`.
    async fn commit(&self, records: &[CommitRecord]) -> Result<(), QueueError>;

    /// Check connectivity and return health status.
    async fn health_check(&self) -> Result<BrokerHealth, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_record_points_past_offset() {
        let record = CommitRecord::after("sdxl_tasks", 2, 41);
        assert_eq!(record.topic, "sdxl_tasks");
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset_to_commit, 42);
    }

    #[test]
    fn broker_health_display() {
        let health = BrokerHealth {
            connected: true,
            approximate_backlog: Some(42),
            provider: "sqs".to_string(),
        };
        let display = format!("{}", health);
        assert!(display.contains("connected: true"));
        assert!(display.contains("42"));
    }
}
