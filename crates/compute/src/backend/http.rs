//! JSON-over-HTTP adapter to a model-host process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::json;
use tracing::debug;

use kiln_core::config::BackendConfig;
use kiln_core::{Artifact, SynthesisRequest};

use super::{Backend, BackendError};

/// Talks to the model host:
///
/// | call | request |
/// |---|---|
/// | load base | `POST /models/load` `{id, path}` |
/// | unload base | `POST /models/unload` |
/// | attach overlay | `POST /overlays` `{name, path, weight}` |
/// | detach overlay | `DELETE /overlays/{name}` |
/// | reweight overlay | `PUT /overlays/{name}/weight` `{weight}` |
/// | synthesize | `POST /generate` (request JSON) -> image bytes |
/// | release memory | `POST /memory/release` |
#[derive(Debug)]
pub struct HttpBackend {
    base_url: Url,
    output_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| BackendError::Config(format!("invalid backend url {}: {e}", config.url)))?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(BackendError::Config(format!(
                "invalid backend url {}: expected an http(s) base url",
                config.url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url,
            output_dir: config.output_dir.clone(),
            client,
        })
    }

    /// Join path segments onto the base URL, percent-encoding each one.
    /// `new` only accepts base URLs, so the path is always extendable.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Send a request and turn a non-2xx status into an error message.
    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, String> {
        let url = self.url(segments);
        debug!(%method, %url, "backend call");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(format!("{status}: {text}"))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn load_base(&self, id: &str, location: &Path) -> Result<(), BackendError> {
        let body = json!({ "id": id, "path": location.to_string_lossy() });
        self.call(Method::POST, &["models", "load"], Some(body))
            .await
            .map_err(|reason| BackendError::Load {
                id: id.to_string(),
                reason,
            })?;
        Ok(())
    }

    async fn unload_base(&self) -> Result<(), BackendError> {
        self.call(Method::POST, &["models", "unload"], None)
            .await
            .map_err(BackendError::Unload)?;
        Ok(())
    }

    async fn attach_overlay(
        &self,
        name: &str,
        path: &Path,
        weight: f32,
    ) -> Result<(), BackendError> {
        let body = json!({ "name": name, "path": path.to_string_lossy(), "weight": weight });
        self.call(Method::POST, &["overlays"], Some(body))
            .await
            .map_err(|reason| BackendError::Attach {
                name: name.to_string(),
                reason,
            })?;
        Ok(())
    }

    async fn detach_overlay(&self, name: &str) -> Result<(), BackendError> {
        self.call(Method::DELETE, &["overlays", name], None)
            .await
            .map_err(|reason| BackendError::Detach {
                name: name.to_string(),
                reason,
            })?;
        Ok(())
    }

    async fn set_overlay_weight(&self, name: &str, weight: f32) -> Result<(), BackendError> {
        let body = json!({ "weight": weight });
        self.call(Method::PUT, &["overlays", name, "weight"], Some(body))
            .await
            .map_err(|reason| BackendError::Reweight {
                name: name.to_string(),
                reason,
            })?;
        Ok(())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Artifact, BackendError> {
        let body = serde_json::to_value(request)
            .map_err(|e| BackendError::Synthesize(format!("unserializable request: {e}")))?;
        let response = self
            .call(Method::POST, &["generate"], Some(body))
            .await
            .map_err(BackendError::Synthesize)?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(BackendError::Synthesize("backend returned no image".into()));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self
            .output_dir
            .join(format!("{}.png", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;

        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(Artifact::png(path))
    }

    async fn release_memory(&self) -> Result<(), BackendError> {
        self.call(Method::POST, &["memory", "release"], None)
            .await
            .map_err(BackendError::Release)?;
        Ok(())
    }
}
