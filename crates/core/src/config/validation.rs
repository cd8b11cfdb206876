use std::collections::HashSet;

use super::types::{BrokerKind, KilnConfig};
use crate::error::ConfigError;

impl KilnConfig {
    /// Validate the config: topic sets, numeric bounds, broker wiring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_topics()?;
        self.validate_bounds()?;
        self.validate_sqs_queues()?;
        Ok(())
    }

    /// At least one topic; no duplicates; no topic in both classes.
    fn validate_topics(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.priority_topics.is_empty() && broker.normal_topics.is_empty() {
            return Err(ConfigError::Invalid(
                "no topics configured: set broker.priority_topics or broker.normal_topics".into(),
            ));
        }

        let mut seen = HashSet::new();
        for topic in broker.priority_topics.iter().chain(&broker.normal_topics) {
            if topic.is_empty() {
                return Err(ConfigError::Invalid("empty topic name".into()));
            }
            if !seen.insert(topic.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "topic '{topic}' is listed more than once"
                )));
            }
        }
        Ok(())
    }

    fn validate_bounds(&self) -> Result<(), ConfigError> {
        let checks: [(&str, u64); 7] = [
            ("dispatch.batch_cap", self.dispatch.batch_cap as u64),
            ("retry.max_attempts", self.retry.max_attempts as u64),
            ("retry.base_delay_secs", self.retry.base_delay_secs),
            ("retry.max_delay_secs", self.retry.max_delay_secs),
            ("broker.queue_capacity", self.broker.queue_capacity as u64),
            ("broker.poll_max_messages", self.broker.poll_max_messages as u64),
            ("broker.poll_timeout_ms", self.broker.poll_timeout_ms),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
            }
        }
        Ok(())
    }

    /// With the SQS broker every topic needs a queue URL.
    fn validate_sqs_queues(&self) -> Result<(), ConfigError> {
        if self.broker.kind != BrokerKind::Sqs {
            return Ok(());
        }
        for topic in self.broker.all_topics() {
            if !self.broker.sqs.queue_urls.contains_key(&topic) {
                return Err(ConfigError::Invalid(format!(
                    "topic '{topic}' has no entry in broker.sqs.queue_urls"
                )));
            }
        }
        Ok(())
    }
}
