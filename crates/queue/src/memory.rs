//! In-process partitioned log with consumer-group offsets.
//!
//! [`MemoryLog`] plays the role of the broker server: producers append to it
//! and it remembers committed offsets per consumer group. A [`MemoryBroker`]
//! is one consumer session; a fresh session resumes from the group's last
//! committed offsets, so anything delivered but not committed is delivered
//! again, exactly like a consumer restart against a real broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::{Broker, BrokerHealth, BrokerMessage, CommitRecord};
use crate::error::QueueError;

type PartitionKey = (String, i32);

#[derive(Debug, Clone)]
struct StoredMessage {
    body: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LogState {
    partitions: BTreeMap<PartitionKey, Vec<StoredMessage>>,
    /// (group, topic, partition) -> next offset to deliver to a new session.
    committed: HashMap<(String, String, i32), i64>,
}

/// Shared in-memory message log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<LogState>,
    arrivals: Notify,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a message to partition 0 of `topic`, returning its offset.
    pub fn publish(&self, topic: &str, body: impl Into<String>) -> i64 {
        self.publish_to(topic, 0, body)
    }

    /// Append a message to a specific partition, returning its offset.
    pub fn publish_to(&self, topic: &str, partition: i32, body: impl Into<String>) -> i64 {
        let offset = {
            let mut state = self.lock();
            let log = state
                .partitions
                .entry((topic.to_string(), partition))
                .or_default();
            log.push(StoredMessage {
                body: body.into(),
                timestamp: Utc::now(),
            });
            (log.len() - 1) as i64
        };
        self.arrivals.notify_waiters();
        offset
    }

    /// Next offset a new session of `group` would read, if anything was committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of messages ever published to a partition.
    pub fn len(&self, topic: &str, partition: i32) -> usize {
        self.lock()
            .partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        // A panic while holding this lock cannot leave the log half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One consumer session against a [`MemoryLog`].
pub struct MemoryBroker {
    log: Arc<MemoryLog>,
    group: String,
    topics: Vec<String>,
    /// Next offset to deliver per partition for this session.
    positions: Mutex<HashMap<PartitionKey, i64>>,
}

impl MemoryBroker {
    /// Join `group` and subscribe to `topics`, resuming from committed offsets.
    pub fn connect(log: Arc<MemoryLog>, group: impl Into<String>, topics: Vec<String>) -> Self {
        let group = group.into();
        debug!(group = %group, topics = ?topics, "memory broker session opened");
        Self {
            log,
            group,
            topics,
            positions: Mutex::new(HashMap::new()),
        }
    }

    fn take_available(&self, max_messages: usize) -> Vec<BrokerMessage> {
        let state = self.log.lock();
        let mut positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();

        for ((topic, partition), log) in &state.partitions {
            if out.len() >= max_messages {
                break;
            }
            if !self.topics.contains(topic) {
                continue;
            }
            let key = (topic.clone(), *partition);
            let position = positions.entry(key).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.group.clone(), topic.clone(), *partition))
                    .copied()
                    .unwrap_or(0)
            });
            while (*position as usize) < log.len() && out.len() < max_messages {
                let stored = &log[*position as usize];
                out.push(BrokerMessage {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: *position,
                    body: stored.body.clone(),
                    timestamp: stored.timestamp,
                    attempt_count: 1,
                });
                *position += 1;
            }
        }
        out
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn poll(
        &self,
        max_messages: u32,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, QueueError> {
        let max = max_messages as usize;
        // Register interest before checking so a publish in between is not missed.
        let arrived = self.log.arrivals.notified();
        let messages = self.take_available(max);
        if !messages.is_empty() {
            return Ok(messages);
        }
        let _ = tokio::time::timeout(timeout, arrived).await;
        Ok(self.take_available(max))
    }

    async fn commit(&self, records: &[CommitRecord]) -> Result<(), QueueError> {
        let mut state = self.log.lock();
        for record in records {
            let key = (
                self.group.clone(),
                record.topic.clone(),
                record.partition,
            );
            let entry = state.committed.entry(key).or_insert(0);
            // Offsets only move forward.
            *entry = (*entry).max(record.offset_to_commit);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<BrokerHealth, QueueError> {
        let state = self.log.lock();
        let backlog = state
            .partitions
            .iter()
            .filter(|((topic, _), _)| self.topics.contains(topic))
            .map(|((topic, partition), log)| {
                let committed = state
                    .committed
                    .get(&(self.group.clone(), topic.clone(), *partition))
                    .copied()
                    .unwrap_or(0);
                (log.len() as i64 - committed).max(0) as u64
            })
            .sum();
        Ok(BrokerHealth {
            connected: true,
            approximate_backlog: Some(backlog),
            provider: "memory".to_string(),
        })
    }
}
