//! The computational backend the worker keeps warm.
//!
//! A backend holds at most one base resource and any number of weighted
//! overlays on top of it. The resource cache decides which calls to make;
//! the executor only ever calls [`Backend::synthesize`].

mod http;

use std::path::Path;

use async_trait::async_trait;

use kiln_core::{Artifact, SynthesisRequest};

pub use http::HttpBackend;

/// Errors raised by backend calls.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to load base {id}: {reason}")]
    Load { id: String, reason: String },

    #[error("failed to unload base: {0}")]
    Unload(String),

    #[error("failed to attach overlay {name}: {reason}")]
    Attach { name: String, reason: String },

    #[error("failed to detach overlay {name}: {reason}")]
    Detach { name: String, reason: String },

    #[error("failed to set weight of overlay {name}: {reason}")]
    Reweight { name: String, reason: String },

    #[error("synthesis failed: {0}")]
    Synthesize(String),

    #[error("memory release failed: {0}")]
    Release(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Narrow interface to the model host.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Make `id` (found at `location`) the resident base.
    async fn load_base(&self, id: &str, location: &Path) -> Result<(), BackendError>;

    /// Drop the resident base and everything attached to it.
    async fn unload_base(&self) -> Result<(), BackendError>;

    async fn attach_overlay(&self, name: &str, path: &Path, weight: f32)
        -> Result<(), BackendError>;

    async fn detach_overlay(&self, name: &str) -> Result<(), BackendError>;

    async fn set_overlay_weight(&self, name: &str, weight: f32) -> Result<(), BackendError>;

    /// Run one synthesis against whatever is resident.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Artifact, BackendError>;

    /// Return cached device memory to the allocator.
    async fn release_memory(&self) -> Result<(), BackendError>;
}
