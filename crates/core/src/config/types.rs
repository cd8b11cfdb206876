use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a kiln worker.
///
/// Parsed from `kiln.toml` with support for environment variable overrides.
/// Every tunable of the dispatcher lives here; library code never falls back
/// to a hidden constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Broker connection, subscribed topics and poller timing.
    pub broker: BrokerConfig,

    /// Priority dispatch loop tuning.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Synthesis retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Resident resource cache and model catalog.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Compute backend endpoint.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Result sink endpoint.
    #[serde(default)]
    pub sink: SinkConfig,
}

// ── Broker ──────────────────────────────────────────────────────────

/// Which broker implementation the worker talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// AWS SQS, one queue per topic.
    Sqs,
    /// In-process log; local development and tests.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,

    /// Consumer group whose committed offsets this worker advances.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Topics drained before any normal work, in listed order.
    #[serde(default)]
    pub priority_topics: Vec<String>,

    /// Topics served round-robin.
    #[serde(default)]
    pub normal_topics: Vec<String>,

    /// Upper bound on messages returned by one poll.
    #[serde(default = "default_poll_max_messages")]
    pub poll_max_messages: u32,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Sleep after an empty poll.
    #[serde(default = "default_poller_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Sleep after a failed poll or commit.
    #[serde(default = "default_error_sleep_ms")]
    pub error_sleep_ms: u64,

    /// Capacity of each per-topic buffer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub sqs: SqsConfig,
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Sqs
}

fn default_consumer_group() -> String {
    "kiln-workers".into()
}

fn default_poll_max_messages() -> u32 {
    10
}

fn default_poll_timeout_ms() -> u64 {
    200
}

fn default_poller_idle_sleep_ms() -> u64 {
    100
}

fn default_error_sleep_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            consumer_group: default_consumer_group(),
            priority_topics: Vec::new(),
            normal_topics: Vec::new(),
            poll_max_messages: default_poll_max_messages(),
            poll_timeout_ms: default_poll_timeout_ms(),
            idle_sleep_ms: default_poller_idle_sleep_ms(),
            error_sleep_ms: default_error_sleep_ms(),
            queue_capacity: default_queue_capacity(),
            sqs: SqsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Every subscribed topic: priority topics first, then normal topics.
    pub fn all_topics(&self) -> Vec<String> {
        self.priority_topics
            .iter()
            .chain(self.normal_topics.iter())
            .cloned()
            .collect()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn error_sleep(&self) -> Duration {
        Duration::from_millis(self.error_sleep_ms)
    }
}

/// SQS connection settings. Each topic maps to its own queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqsConfig {
    #[serde(default = "default_region")]
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// How long a received message stays invisible before SQS redelivers it.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u32,
    /// Topic name -> queue URL.
    #[serde(default)]
    pub queue_urls: HashMap<String, String>,
}

fn default_region() -> String {
    "ap-southeast-1".into()
}

fn default_visibility_timeout() -> u32 {
    900
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            visibility_timeout_secs: default_visibility_timeout(),
            queue_urls: HashMap::new(),
        }
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Max tasks taken from one normal topic before rotating to the next.
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,

    /// Sleep after a pass in which every queue was empty.
    #[serde(default = "default_dispatch_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

fn default_batch_cap() -> usize {
    100
}

fn default_dispatch_idle_sleep_ms() -> u64 {
    100
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_cap: default_batch_cap(),
            idle_sleep_ms: default_dispatch_idle_sleep_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

// ── Retry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total synthesis attempts per task, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after attempt `n` is `base_delay_secs ^ n`, capped.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

// ── Cache / model catalog ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Fail the task instead of running it with fewer overlays than requested.
    #[serde(default)]
    pub strict_overlays: bool,

    /// Base resource id -> where to find it.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

/// Location of one base resource and its overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Directory holding `<overlay>.safetensors` files. `None` disables overlays.
    pub overlay_dir: Option<PathBuf>,
}

// ── Backend ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Per-request timeout. Generation can be slow.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// Where generated artifacts are written before upload. Delivered files
    /// are removed; ones whose upload failed stay for inspection.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8015".into()
}

fn default_backend_timeout() -> u64 {
    300
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/generated")
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
            output_dir: default_output_dir(),
        }
    }
}

// ── Result sink ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_sink_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle keep-alive connections kept per host.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

fn default_api_base_url() -> String {
    "http://localhost:8000".into()
}

fn default_sink_timeout() -> u64 {
    30
}

fn default_sink_connect_timeout() -> u64 {
    10
}

fn default_max_idle_connections() -> usize {
    5
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            timeout_secs: default_sink_timeout(),
            connect_timeout_secs: default_sink_connect_timeout(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}
