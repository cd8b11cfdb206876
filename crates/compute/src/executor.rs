//! Runs one task end to end: warm the cache, synthesize with retry, report.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kiln_core::config::RetryConfig;
use kiln_core::{Artifact, Task};
use kiln_notify::ResultSink;

use crate::backend::Backend;
use crate::cache::{Fidelity, ResourceCache};

/// Capped exponential backoff between synthesis attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_secs: config.base_delay_secs,
            max_delay_secs: config.max_delay_secs,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `min(base^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self
            .base_delay_secs
            .checked_pow(attempt)
            .unwrap_or(u64::MAX)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Delay after each attempt, `1..=max_attempts`. The last one is never
    /// slept because no attempt follows it.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|n| self.delay_for(n)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Which stage a failed task stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Base or overlays could not be made resident.
    Warmup,
    /// Every synthesis attempt failed.
    Synthesis,
    /// The artifact was made but could not be delivered.
    Delivery,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Warmup => "warmup",
            FailureKind::Synthesis => "synthesis",
            FailureKind::Delivery => "delivery",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeResult {
    /// The artifact was delivered. Its local file has already been removed.
    Succeeded(Artifact),
    Failed { kind: FailureKind, error: String },
}

/// Terminal result of a task. Producing one makes the task's offset
/// committable.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub task_id: String,
    /// Synthesis attempts made.
    pub attempts: u32,
    /// `None` when warm-up never completed.
    pub fidelity: Option<Fidelity>,
    pub result: OutcomeResult,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, OutcomeResult::Succeeded(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.result {
            OutcomeResult::Succeeded(_) => None,
            OutcomeResult::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.fidelity, Some(Fidelity::Degraded { .. }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Shutdown arrived during a backoff wait; the task has no outcome and
    /// must not be committed.
    #[error("task {0} interrupted by shutdown")]
    Interrupted(String),
}

/// Owns the resource cache and drives the backend for one task at a time.
pub struct Executor {
    cache: ResourceCache,
    backend: Arc<dyn Backend>,
    sink: Arc<dyn ResultSink>,
    policy: RetryPolicy,
    strict_overlays: bool,
}

impl Executor {
    pub fn new(
        cache: ResourceCache,
        backend: Arc<dyn Backend>,
        sink: Arc<dyn ResultSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            backend,
            sink,
            policy,
            strict_overlays: false,
        }
    }

    /// Fail tasks whose overlays could not all be attached.
    pub fn with_strict_overlays(mut self, strict: bool) -> Self {
        self.strict_overlays = strict;
        self
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub async fn shutdown(&mut self) {
        self.cache.shutdown().await;
    }

    pub async fn execute(
        &mut self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ExecuteError> {
        let handle = match self
            .cache
            .ensure(&task.base_resource_id, &task.overlays)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                return Ok(self
                    .fail(task, 0, None, FailureKind::Warmup, e.to_string())
                    .await)
            }
        };

        if let Fidelity::Degraded { missing } = &handle.fidelity {
            warn!(
                task_id = %task.task_id,
                base_id = %handle.base_id,
                missing = ?missing,
                "running with degraded overlay set"
            );
            if self.strict_overlays {
                let msg = format!("overlays unavailable: {}", missing.join(", "));
                return Ok(self
                    .fail(task, 0, Some(handle.fidelity), FailureKind::Warmup, msg)
                    .await);
            }
        }

        let fidelity = Some(handle.fidelity);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.backend.synthesize(&task.payload).await {
                Ok(artifact) => return Ok(self.deliver(task, attempt, fidelity, artifact).await),
                Err(e) => {
                    warn!(
                        task_id = %task.task_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "synthesis attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.policy.max_attempts {
                let delay = self.policy.delay_for(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(task_id = %task.task_id, attempt, "shutdown during backoff, abandoning task");
                        return Err(ExecuteError::Interrupted(task.task_id.clone()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let attempts = self.policy.max_attempts;
        Ok(self
            .fail(task, attempts, fidelity, FailureKind::Synthesis, last_error)
            .await)
    }

    async fn deliver(
        &self,
        task: &Task,
        attempts: u32,
        fidelity: Option<Fidelity>,
        artifact: Artifact,
    ) -> Outcome {
        match self.sink.report_success(&task.task_id, &artifact).await {
            Ok(()) => {
                info!(task_id = %task.task_id, attempts, path = %artifact.path.display(), "task succeeded");
                discard_artifact(&artifact).await;
                Outcome {
                    task_id: task.task_id.clone(),
                    attempts,
                    fidelity,
                    result: OutcomeResult::Succeeded(artifact),
                }
            }
            Err(e) => {
                error!(
                    task_id = %task.task_id,
                    sink = self.sink.sink_name(),
                    error = %e,
                    "artifact made but delivery failed"
                );
                self.fail(task, attempts, fidelity, FailureKind::Delivery, e.to_string())
                    .await
            }
        }
    }

    async fn fail(
        &self,
        task: &Task,
        attempts: u32,
        fidelity: Option<Fidelity>,
        kind: FailureKind,
        error: String,
    ) -> Outcome {
        warn!(task_id = %task.task_id, %kind, error = %error, "task failed");
        if let Err(e) = self.sink.report_failure(&task.task_id, &error).await {
            error!(task_id = %task.task_id, error = %e, "failure report not delivered");
        }
        Outcome {
            task_id: task.task_id.clone(),
            attempts,
            fidelity,
            result: OutcomeResult::Failed { kind, error },
        }
    }
}

/// Remove a delivered artifact from local disk. Failures only leave a file
/// behind, so they are logged and otherwise ignored.
async fn discard_artifact(artifact: &Artifact) {
    match tokio::fs::remove_file(&artifact.path).await {
        Ok(()) => debug!(path = %artifact.path.display(), "delivered artifact removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %artifact.path.display(), error = %e, "could not remove delivered artifact"),
    }
}
