//! Ingress poller: broker -> topic queues, commit channel -> broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_core::config::BrokerConfig;

use crate::broker::{Broker, BrokerMessage, CommitRecord};
use crate::error::QueueError;
use crate::parser::parse_message;
use crate::topics::{CommitReceiver, Delivery, TopicSenders};

/// Poll loop timing.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub max_messages: u32,
    pub poll_timeout: Duration,
    pub idle_sleep: Duration,
    pub error_sleep: Duration,
}

impl From<&BrokerConfig> for PollerSettings {
    fn from(cfg: &BrokerConfig) -> Self {
        Self {
            max_messages: cfg.poll_max_messages,
            poll_timeout: cfg.poll_timeout(),
            idle_sleep: cfg.idle_sleep(),
            error_sleep: cfg.error_sleep(),
        }
    }
}

/// Counters returned when the poller exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub messages: u64,
    pub poison: u64,
    pub dropped: u64,
    pub commit_batches: u64,
    pub commit_failures: u64,
}

/// Pulls messages off the broker into per-topic queues and acknowledges
/// whatever the dispatcher reports as finished.
pub struct IngressPoller {
    broker: Arc<dyn Broker>,
    queues: TopicSenders,
    commits: CommitReceiver,
    settings: PollerSettings,
    /// Highest offset to commit per topic-partition, not yet acknowledged.
    pending: BTreeMap<(String, i32), i64>,
    /// Set after a failed commit; no commit is attempted before it.
    commit_retry_at: Option<Instant>,
    stats: PollerStats,
}

impl IngressPoller {
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: TopicSenders,
        commits: CommitReceiver,
        settings: PollerSettings,
    ) -> Self {
        Self {
            broker,
            queues,
            commits,
            settings,
            pending: BTreeMap::new(),
            commit_retry_at: None,
            stats: PollerStats::default(),
        }
    }

    /// Run until `cancel` fires, then wait for the dispatcher to drop its
    /// commit sender, flush the last commits and return.
    pub async fn run(mut self, cancel: CancellationToken) -> PollerStats {
        info!(
            max_messages = self.settings.max_messages,
            poll_timeout_ms = self.settings.poll_timeout.as_millis() as u64,
            "Ingress poller started"
        );

        while !cancel.is_cancelled() {
            // A failing commit must not hold up polling.
            if self.commit_due() {
                match self.flush_commits().await {
                    Ok(()) => self.commit_retry_at = None,
                    Err(e) => {
                        warn!(
                            error = %e,
                            pending = self.pending.len(),
                            retry_in_ms = self.settings.error_sleep.as_millis() as u64,
                            "Commit failed, will retry"
                        );
                        self.commit_retry_at = Some(Instant::now() + self.settings.error_sleep);
                    }
                }
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.broker.poll(self.settings.max_messages, self.settings.poll_timeout) => res,
            };

            match polled {
                Ok(messages) if messages.is_empty() => {
                    sleep_or_cancel(self.settings.idle_sleep, &cancel).await;
                }
                Ok(messages) => {
                    debug!(count = messages.len(), "Polled messages");
                    for msg in messages {
                        if !self.route(msg, &cancel).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Broker poll failed");
                    sleep_or_cancel(self.settings.error_sleep, &cancel).await;
                }
            }
        }

        self.shutdown().await;
        self.stats
    }

    /// Parse and enqueue one message. Returns `false` if cancelled while
    /// waiting for queue space.
    async fn route(&mut self, msg: BrokerMessage, cancel: &CancellationToken) -> bool {
        self.stats.messages += 1;
        let delivery = match parse_message(&msg) {
            Ok(task) => Delivery::Task(task),
            Err(e) => {
                warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "Poison message, will be committed without execution"
                );
                self.stats.poison += 1;
                Delivery::Poison {
                    topic: msg.topic,
                    partition: msg.partition,
                    offset: msg.offset,
                    reason: e.to_string(),
                }
            }
        };

        if !self.queues.has_topic(delivery.topic()) {
            warn!(topic = %delivery.topic(), "Message for unsubscribed topic dropped");
            self.stats.dropped += 1;
            return true;
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            res = self.queues.push(delivery) => {
                if let Err(e) = res {
                    warn!(error = %e, "Failed to enqueue delivery");
                    self.stats.dropped += 1;
                }
                true
            }
        }
    }

    fn absorb(&mut self, records: Vec<CommitRecord>) {
        for record in records {
            let entry = self
                .pending
                .entry((record.topic, record.partition))
                .or_insert(record.offset_to_commit);
            *entry = (*entry).max(record.offset_to_commit);
        }
    }

    fn commit_due(&self) -> bool {
        self.commit_retry_at.map_or(true, |at| Instant::now() >= at)
    }

    /// Drain the commit channel and send one batched commit.
    /// On failure the records stay pending for the next attempt.
    async fn flush_commits(&mut self) -> Result<(), QueueError> {
        let drained = self.commits.drain();
        self.absorb(drained);
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = coalesced(&self.pending);
        self.stats.commit_batches += 1;
        match self.broker.commit(&batch).await {
            Ok(()) => {
                debug!(records = batch.len(), "Committed offsets");
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                self.stats.commit_failures += 1;
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Ingress poller stopping, waiting for dispatcher to finish");
        while let Some(record) = self.commits.recv().await {
            self.absorb(vec![record]);
        }
        if let Err(e) = self.flush_commits().await {
            warn!(error = %e, pending = self.pending.len(), "Final commit failed");
        }
        info!(
            messages = self.stats.messages,
            poison = self.stats.poison,
            "Ingress poller stopped"
        );
    }
}

/// One record per topic-partition carrying the highest offset.
fn coalesced(pending: &BTreeMap<(String, i32), i64>) -> Vec<CommitRecord> {
    pending
        .iter()
        .map(|((topic, partition), offset)| CommitRecord {
            topic: topic.clone(),
            partition: *partition,
            offset_to_commit: *offset,
        })
        .collect()
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
