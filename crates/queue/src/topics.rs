//! Per-topic bounded queues (poller -> dispatcher) and the commit channel
//! (dispatcher -> poller).

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use kiln_core::Task;

use crate::broker::CommitRecord;
use crate::error::QueueError;

/// An entry in a topic queue.
///
/// Poison messages ride the queue too so that their commit is issued in
/// dequeue order with the tasks around them.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Task(Task),
    Poison {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },
}

impl Delivery {
    pub fn topic(&self) -> &str {
        match self {
            Delivery::Task(task) => &task.topic,
            Delivery::Poison { topic, .. } => topic,
        }
    }

    /// Record acknowledging this delivery once it reached a terminal state.
    pub fn commit_record(&self) -> CommitRecord {
        match self {
            Delivery::Task(task) => {
                CommitRecord::after(task.topic.clone(), task.partition, task.broker_offset)
            }
            Delivery::Poison {
                topic,
                partition,
                offset,
                ..
            } => CommitRecord::after(topic.clone(), *partition, *offset),
        }
    }
}

/// Producer half of the topic queues, held by the poller.
#[derive(Debug, Clone)]
pub struct TopicSenders {
    senders: HashMap<String, mpsc::Sender<Delivery>>,
}

impl TopicSenders {
    /// Push onto the delivery's topic queue, waiting while it is full.
    pub async fn push(&self, delivery: Delivery) -> Result<(), QueueError> {
        let sender = self
            .senders
            .get(delivery.topic())
            .ok_or_else(|| QueueError::UnknownTopic(delivery.topic().to_string()))?;
        sender
            .send(delivery)
            .await
            .map_err(|e| QueueError::Closed(format!("topic queue {} closed", e.0.topic())))
    }

    /// Push without waiting; fails if the queue is full.
    pub fn try_push(&self, delivery: Delivery) -> Result<(), QueueError> {
        let sender = self
            .senders
            .get(delivery.topic())
            .ok_or_else(|| QueueError::UnknownTopic(delivery.topic().to_string()))?;
        sender.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(d) => {
                QueueError::Provider(format!("topic queue {} is full", d.topic()))
            }
            mpsc::error::TrySendError::Closed(d) => {
                QueueError::Closed(format!("topic queue {} closed", d.topic()))
            }
        })
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.senders.contains_key(topic)
    }
}

/// Consumer half of the topic queues, owned by the dispatcher.
#[derive(Debug)]
pub struct TopicQueues {
    receivers: HashMap<String, mpsc::Receiver<Delivery>>,
}

impl TopicQueues {
    /// Pop the oldest delivery of `topic` without waiting.
    pub fn try_pop(&mut self, topic: &str) -> Option<Delivery> {
        self.receivers.get_mut(topic)?.try_recv().ok()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.receivers.keys().map(String::as_str)
    }
}

/// Create one bounded queue per topic. Every subscribed topic has a queue
/// from the start.
pub fn topic_queues(topics: &[String], capacity: usize) -> (TopicSenders, TopicQueues) {
    let mut senders = HashMap::with_capacity(topics.len());
    let mut receivers = HashMap::with_capacity(topics.len());
    for topic in topics {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.insert(topic.clone(), tx);
        receivers.insert(topic.clone(), rx);
    }
    (TopicSenders { senders }, TopicQueues { receivers })
}

/// Dispatcher side of the commit channel. Never blocks.
#[derive(Debug, Clone)]
pub struct CommitSender {
    inner: mpsc::UnboundedSender<CommitRecord>,
}

impl CommitSender {
    pub fn send(&self, record: CommitRecord) -> Result<(), QueueError> {
        self.inner
            .send(record)
            .map_err(|_| QueueError::Closed("commit channel closed".into()))
    }
}

/// Poller side of the commit channel.
#[derive(Debug)]
pub struct CommitReceiver {
    inner: mpsc::UnboundedReceiver<CommitRecord>,
    closed: bool,
}

impl CommitReceiver {
    /// Take everything currently buffered.
    pub fn drain(&mut self) -> Vec<CommitRecord> {
        let mut out = Vec::new();
        loop {
            match self.inner.try_recv() {
                Ok(record) => out.push(record),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        out
    }

    /// Wait for the next record; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<CommitRecord> {
        let next = self.inner.recv().await;
        if next.is_none() {
            self.closed = true;
        }
        next
    }

    /// Whether every sender has been dropped (as observed by the last drain).
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub fn commit_channel() -> (CommitSender, CommitReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CommitSender { inner: tx },
        CommitReceiver {
            inner: rx,
            closed: false,
        },
    )
}
