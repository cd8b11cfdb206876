use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

use kiln_core::KilnConfig;
use kiln_queue::{CommitSender, TopicQueues};

use crate::executor::Executor;
use crate::metrics::{DispatchMetrics, SharedMetrics};

/// Which topics the dispatcher serves and how.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Drained completely before any normal work, in this order.
    pub priority_topics: Vec<String>,
    /// Served round-robin.
    pub normal_topics: Vec<String>,
    /// Max tasks taken from one normal topic before rotating.
    pub batch_cap: usize,
    /// Sleep after a pass that found nothing to do.
    pub idle_sleep: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            priority_topics: config.broker.priority_topics.clone(),
            normal_topics: config.broker.normal_topics.clone(),
            batch_cap: config.dispatch.batch_cap.max(1),
            idle_sleep: config.dispatch.idle_sleep(),
        }
    }
}

/// The dispatch task. Sole owner of the executor, and through it of the
/// resident resource state.
pub struct Dispatcher {
    pub(super) queues: TopicQueues,
    pub(super) commits: CommitSender,
    pub(super) executor: Executor,
    pub(super) settings: DispatcherSettings,
    /// Index into `settings.normal_topics` of the next topic to serve.
    pub(super) rr_index: usize,
    pub(super) metrics: SharedMetrics,
}

impl Dispatcher {
    pub fn new(
        queues: TopicQueues,
        commits: CommitSender,
        executor: Executor,
        settings: DispatcherSettings,
    ) -> Self {
        info!(
            priority = ?settings.priority_topics,
            normal = ?settings.normal_topics,
            batch_cap = settings.batch_cap,
            "dispatcher configured"
        );
        Self {
            queues,
            commits,
            executor,
            settings,
            rr_index: 0,
            metrics: Arc::new(RwLock::new(DispatchMetrics::default())),
        }
    }

    /// Snapshot of the current metrics.
    pub fn metrics(&self) -> DispatchMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Shared handle for readers on other tasks.
    pub fn metrics_handle(&self) -> SharedMetrics {
        Arc::clone(&self.metrics)
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}
