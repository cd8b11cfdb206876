use std::env;
use std::path::Path;

use crate::error::ConfigError;

use super::types::{BrokerKind, KilnConfig};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_opt(key).map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

impl KilnConfig {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  broker:   kind={:?}, group={}, priority={:?}, normal={:?}",
            self.broker.kind,
            self.broker.consumer_group,
            self.broker.priority_topics,
            self.broker.normal_topics
        );
        tracing::info!(
            "  dispatch: batch_cap={}, idle_sleep_ms={}",
            self.dispatch.batch_cap,
            self.dispatch.idle_sleep_ms
        );
        tracing::info!(
            "  retry:    max_attempts={}, base={}s, max={}s",
            self.retry.max_attempts,
            self.retry.base_delay_secs,
            self.retry.max_delay_secs
        );
        tracing::info!(
            "  cache:    models={}, strict_overlays={}",
            self.cache.models.len(),
            self.cache.strict_overlays
        );
        tracing::info!("  backend:  url={}", self.backend.url);
        tracing::info!("  sink:     api_base_url={}", self.sink.api_base_url);
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `KILN_SECTION_KEY` overrides `section.key`. List values
    /// are comma separated.
    /// Examples:
    /// - `KILN_BROKER_KIND` -> `broker.kind` (`sqs` | `memory`)
    /// - `KILN_BROKER_CONSUMER_GROUP` -> `broker.consumer_group`
    /// - `KILN_BROKER_PRIORITY_TOPICS` -> `broker.priority_topics`
    /// - `KILN_BROKER_NORMAL_TOPICS` -> `broker.normal_topics`
    /// - `KILN_SQS_REGION`, `KILN_SQS_ENDPOINT_URL`, `KILN_SQS_ACCESS_KEY_ID`,
    ///   `KILN_SQS_SECRET_ACCESS_KEY`, `KILN_SQS_SESSION_TOKEN`
    /// - `KILN_DISPATCH_BATCH_CAP` -> `dispatch.batch_cap`
    /// - `KILN_RETRY_MAX_ATTEMPTS` -> `retry.max_attempts`
    /// - `KILN_BACKEND_URL` -> `backend.url`
    /// - `KILN_SINK_API_BASE_URL` -> `sink.api_base_url`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("KILN_BROKER_KIND") {
            match v.to_lowercase().as_str() {
                "sqs" => self.broker.kind = BrokerKind::Sqs,
                "memory" => self.broker.kind = BrokerKind::Memory,
                other => tracing::warn!(value = %other, "ignoring unknown KILN_BROKER_KIND"),
            }
        }
        if let Some(v) = env_opt("KILN_BROKER_CONSUMER_GROUP") {
            self.broker.consumer_group = v;
        }
        if let Some(v) = env_list("KILN_BROKER_PRIORITY_TOPICS") {
            self.broker.priority_topics = v;
        }
        if let Some(v) = env_list("KILN_BROKER_NORMAL_TOPICS") {
            self.broker.normal_topics = v;
        }
        if let Some(v) = env_parsed("KILN_BROKER_POLL_TIMEOUT_MS") {
            self.broker.poll_timeout_ms = v;
        }
        if let Some(v) = env_opt("KILN_SQS_REGION") {
            self.broker.sqs.region = v;
        }
        if let Some(v) = env_opt("KILN_SQS_ENDPOINT_URL") {
            self.broker.sqs.endpoint_url = Some(v);
        }
        if let Some(v) = env_opt("KILN_SQS_ACCESS_KEY_ID") {
            self.broker.sqs.access_key_id = Some(v);
        }
        if let Some(v) = env_opt("KILN_SQS_SECRET_ACCESS_KEY") {
            self.broker.sqs.secret_access_key = Some(v);
        }
        if let Some(v) = env_opt("KILN_SQS_SESSION_TOKEN") {
            self.broker.sqs.session_token = Some(v);
        }
        if let Some(v) = env_parsed("KILN_DISPATCH_BATCH_CAP") {
            self.dispatch.batch_cap = v;
        }
        if let Some(v) = env_parsed("KILN_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_opt("KILN_BACKEND_URL") {
            self.backend.url = v;
        }
        if let Some(v) = env_opt("KILN_SINK_API_BASE_URL") {
            self.sink.api_base_url = v;
        }
    }
}
