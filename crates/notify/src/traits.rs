//! Result sink trait definition and shared error types.

use kiln_core::Artifact;

/// Errors that can occur while reporting a task result.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("result endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to read artifact {path}: {source}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Destination for terminal task outcomes.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver the artifact of a successful task.
    async fn report_success(&self, task_id: &str, artifact: &Artifact) -> Result<(), SinkError>;

    /// Record that a task failed for good.
    async fn report_failure(&self, task_id: &str, error_message: &str) -> Result<(), SinkError>;

    /// Human-readable name for this sink (e.g., "http").
    fn sink_name(&self) -> &str;
}
