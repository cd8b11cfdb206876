//! HTTP result sink.
//!
//! Uploads finished artifacts as multipart form data and reports failures on
//! the same endpoint:
//!
//! - success: `POST {base}/upload_image?task_id=<id>` with an `image` part
//! - failure: `POST {base}/upload_image?task_id=<id>&error_message=<msg>`

use std::time::Duration;

use reqwest::multipart::{Form, Part};

use kiln_core::config::SinkConfig;
use kiln_core::Artifact;

use crate::traits::{ResultSink, SinkError};

const UPLOAD_PATH: &str = "/upload_image";

/// Reports task results to the job API over HTTP.
#[derive(Debug)]
pub struct HttpResultSink {
    /// Fully resolved upload endpoint.
    endpoint: String,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl HttpResultSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let base = config.api_base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(SinkError::Config("sink.api_base_url is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_connections)
            .build()?;

        Ok(Self {
            endpoint: format!("{base}{UPLOAD_PATH}"),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn check(response: reqwest::Response) -> Result<(), SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        tracing::warn!(%status, body = %body, "result endpoint returned non-2xx status");
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait::async_trait]
impl ResultSink for HttpResultSink {
    async fn report_success(&self, task_id: &str, artifact: &Artifact) -> Result<(), SinkError> {
        let bytes = tokio::fs::read(&artifact.path)
            .await
            .map_err(|source| SinkError::Artifact {
                path: artifact.path.display().to_string(),
                source,
            })?;
        let size = bytes.len();

        let part = Part::bytes(bytes)
            .file_name(artifact.file_name())
            .mime_str(&artifact.content_type)?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("task_id", task_id)])
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await?;

        tracing::debug!(task_id, bytes = size, "artifact uploaded");
        Ok(())
    }

    async fn report_failure(&self, task_id: &str, error_message: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("task_id", task_id), ("error_message", error_message)])
            .send()
            .await?;
        Self::check(response).await?;

        tracing::debug!(task_id, "failure reported");
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "http"
    }
}
