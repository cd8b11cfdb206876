//! AWS SQS broker implementation.
//!
//! SQS has no partitions or offsets, so each topic maps to one queue and
//! partition 0. Offsets are handed out per topic in receive order and remember
//! the receipt handle of the message they stand for; committing offset `N`
//! deletes every pending message below `N`. Anything never committed becomes
//! visible again once its visibility timeout expires.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kiln_core::config::SqsConfig;

use crate::broker::{Broker, BrokerHealth, BrokerMessage, CommitRecord};
use crate::error::QueueError;

/// SQS caps a single receive at 10 messages.
const SQS_MAX_BATCH: u32 = 10;
/// SQS long polling caps at 20 seconds.
const SQS_MAX_WAIT_SECS: u64 = 20;

#[derive(Debug, Default)]
struct TopicState {
    next_offset: i64,
    /// offset -> receipt handle, for messages received but not yet deleted.
    pending: BTreeMap<i64, String>,
}

/// SQS-backed broker: one queue per topic.
pub struct SqsBroker {
    client: Client,
    /// (topic, queue url), polled in this order.
    queues: Vec<(String, String)>,
    visibility_timeout_secs: i32,
    state: Mutex<HashMap<String, TopicState>>,
}

impl SqsBroker {
    /// Create a broker subscribed to `topics`; each needs a URL in `sqs.queue_urls`.
    pub async fn new(sqs: &SqsConfig, topics: &[String]) -> Result<Self, QueueError> {
        let region = aws_sdk_sqs::config::Region::new(sqs.region.clone());

        // Build the SQS client config directly so AWS_ENDPOINT_URL in the
        // environment cannot reroute queue traffic.
        let mut sqs_config = aws_sdk_sqs::Config::builder()
            .region(region)
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&sqs.access_key_id, &sqs.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                sqs.session_token.clone(),
                None,
                "kiln-queue-static",
            );
            sqs_config = sqs_config.credentials_provider(creds);
        } else {
            let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
            match shared.credentials_provider() {
                Some(provider) => sqs_config = sqs_config.credentials_provider(provider),
                None => {
                    return Err(QueueError::Auth(
                        "no static SQS credentials and no default credentials provider".into(),
                    ))
                }
            }
        }

        if let Some(ref endpoint) = sqs.endpoint_url {
            if !endpoint.is_empty() {
                let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.clone()
                } else {
                    format!("https://{endpoint}")
                };
                sqs_config = sqs_config.endpoint_url(&url);
            }
        }

        let mut queues = Vec::with_capacity(topics.len());
        for topic in topics {
            let url = sqs
                .queue_urls
                .get(topic)
                .ok_or_else(|| QueueError::UnknownTopic(format!("{topic} has no queue url")))?;
            queues.push((topic.clone(), url.clone()));
        }

        info!(
            region = %sqs.region,
            topics = ?topics,
            "SQS broker initialized"
        );

        Ok(Self {
            client: Client::from_conf(sqs_config.build()),
            queues,
            visibility_timeout_secs: sqs.visibility_timeout_secs as i32,
            state: Mutex::new(HashMap::new()),
        })
    }

    async fn receive(
        &self,
        topic: &str,
        queue_url: &str,
        max_messages: u32,
        wait_secs: i32,
    ) -> Result<Vec<BrokerMessage>, QueueError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages.min(SQS_MAX_BATCH) as i32)
            .wait_time_seconds(wait_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive on {topic} failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        if sqs_messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let topic_state = state.entry(topic.to_string()).or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for msg in sqs_messages {
            let Some(receipt_handle) = msg.receipt_handle() else {
                warn!(topic, "SQS message without receipt handle, skipping");
                continue;
            };

            // SentTimestamp is epoch millis.
            let timestamp = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            let offset = topic_state.next_offset;
            topic_state.next_offset += 1;
            topic_state
                .pending
                .insert(offset, receipt_handle.to_string());

            messages.push(BrokerMessage {
                topic: topic.to_string(),
                partition: 0,
                offset,
                body: msg.body().unwrap_or("").to_string(),
                timestamp,
                attempt_count,
            });
        }

        debug!(topic, count = messages.len(), "Received SQS messages");
        Ok(messages)
    }

    fn queue_url(&self, topic: &str) -> Option<&str> {
        self.queues
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, url)| url.as_str())
    }
}

/// Split a poll timeout into whole seconds of SQS long polling.
fn wait_seconds(timeout: Duration) -> i32 {
    timeout.as_secs().min(SQS_MAX_WAIT_SECS) as i32
}

/// Long-poll wait for the queue at `index` in one poll. Only the first
/// queue blocks, so a poll never waits longer than its timeout.
fn queue_wait_seconds(index: usize, wait_secs: i32) -> i32 {
    if index == 0 {
        wait_secs
    } else {
        0
    }
}

#[async_trait]
impl Broker for SqsBroker {
    async fn poll(
        &self,
        max_messages: u32,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, QueueError> {
        let wait_secs = wait_seconds(timeout);
        let mut out = Vec::new();

        // Queues are polled in subscription order; priority topics come first.
        for (index, (topic, url)) in self.queues.iter().enumerate() {
            let remaining = max_messages.saturating_sub(out.len() as u32);
            if remaining == 0 {
                break;
            }
            let wait = queue_wait_seconds(index, wait_secs);
            out.extend(self.receive(topic, url, remaining, wait).await?);
        }
        Ok(out)
    }

    async fn commit(&self, records: &[CommitRecord]) -> Result<(), QueueError> {
        let mut failures = Vec::new();

        for record in records {
            let Some(url) = self.queue_url(&record.topic) else {
                return Err(QueueError::UnknownTopic(record.topic.clone()));
            };

            let handles: Vec<(i64, String)> = {
                let state = self.state.lock().await;
                state
                    .get(&record.topic)
                    .map(|s| {
                        s.pending
                            .range(..record.offset_to_commit)
                            .map(|(o, h)| (*o, h.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            };

            for (offset, handle) in handles {
                debug!(topic = %record.topic, offset, "Deleting SQS message");
                let result = self
                    .client
                    .delete_message()
                    .queue_url(url)
                    .receipt_handle(&handle)
                    .send()
                    .await;
                match result {
                    Ok(_) => {
                        let mut state = self.state.lock().await;
                        if let Some(s) = state.get_mut(&record.topic) {
                            s.pending.remove(&offset);
                        }
                    }
                    Err(e) => failures.push(format!("{}@{}: {e:?}", record.topic, offset)),
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Commit(format!(
                "SQS delete failed for {} message(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    async fn health_check(&self) -> Result<BrokerHealth, QueueError> {
        let mut backlog = 0u64;
        for (topic, url) in &self.queues {
            let resp = self
                .client
                .get_queue_attributes()
                .queue_url(url)
                .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
                .send()
                .await
                .map_err(|e| {
                    QueueError::Connection(format!("SQS health check on {topic} failed: {e:?}"))
                })?;

            backlog += resp
                .attributes()
                .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
        }

        Ok(BrokerHealth {
            connected: true,
            approximate_backlog: Some(backlog),
            provider: "sqs".to_string(),
        })
    }
}
