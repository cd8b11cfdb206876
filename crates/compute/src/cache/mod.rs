//! Resident-resource cache.
//!
//! Keeps the backend warm across tasks: the base resource is reloaded only
//! when a task asks for a different one, and overlays are reconciled by diff
//! (load what is missing, unload what is extra, reweight what changed).
//! The cache is owned by the dispatch task; nothing else touches the backend's
//! loaded state.

mod catalog;
mod diff;
mod resident;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use kiln_core::config::CacheConfig;
use kiln_core::Overlay;

use crate::backend::{Backend, BackendError};

pub use catalog::{ModelCatalog, OVERLAY_EXTENSION};
pub use diff::{target_set, OverlayDiff, OverlaySet};
pub use resident::ResidentState;

/// Errors that fail a warm-up.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("base resource '{0}' is not configured")]
    UnknownBase(String),

    #[error("base resource '{id}' location {} does not exist", path.display())]
    MissingLocation { id: String, path: PathBuf },

    #[error("failed to load base resource '{id}': {source}")]
    BaseLoad {
        id: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to evict resident base '{id}': {source}")]
    Evict {
        id: String,
        #[source]
        source: BackendError,
    },
}

/// Whether a warm-up achieved the full overlay set.
#[derive(Debug, Clone, PartialEq)]
pub enum Fidelity {
    Exact,
    /// Some requested overlays could not be attached.
    Degraded { missing: Vec<String> },
}

impl Fidelity {
    pub fn is_exact(&self) -> bool {
        matches!(self, Fidelity::Exact)
    }
}

/// Result of a successful [`ResourceCache::ensure`].
#[derive(Debug, Clone, PartialEq)]
pub struct WarmHandle {
    pub base_id: String,
    pub fidelity: Fidelity,
    /// True when nothing had to change on the backend.
    pub reused: bool,
}

/// Owns the backend's resident state.
pub struct ResourceCache {
    backend: Arc<dyn Backend>,
    catalog: ModelCatalog,
    state: ResidentState,
}

impl ResourceCache {
    pub fn new(backend: Arc<dyn Backend>, catalog: ModelCatalog) -> Self {
        Self {
            backend,
            catalog,
            state: ResidentState::default(),
        }
    }

    pub fn from_config(backend: Arc<dyn Backend>, config: &CacheConfig) -> Self {
        Self::new(backend, ModelCatalog::new(config.models.clone()))
    }

    pub fn resident(&self) -> &ResidentState {
        &self.state
    }

    /// Make `base_id` resident with exactly `overlays` attached (best effort
    /// for overlays). Any error clears the resident state and releases
    /// backend memory before it is returned.
    pub async fn ensure(
        &mut self,
        base_id: &str,
        overlays: &[Overlay],
    ) -> Result<WarmHandle, CacheError> {
        let target = target_set(overlays);

        if self.state.matches(base_id, &target) {
            debug!(base_id, overlays = target.len(), "resident state reused");
            return Ok(WarmHandle {
                base_id: base_id.to_string(),
                fidelity: Fidelity::Exact,
                reused: true,
            });
        }

        match self.reconcile(base_id, &target).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(base_id, error = %e, "warm-up failed, clearing resident state");
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn reconcile(
        &mut self,
        base_id: &str,
        target: &OverlaySet,
    ) -> Result<WarmHandle, CacheError> {
        if let Some(current) = self.state.loaded_base_id.clone() {
            if current != base_id {
                self.evict(&current).await?;
            }
        }

        if self.state.loaded_base_id.is_none() {
            let model = self.catalog.resolve(base_id)?;
            info!(base_id, path = %model.path.display(), "loading base resource");
            self.backend
                .load_base(base_id, &model.path)
                .await
                .map_err(|source| CacheError::BaseLoad {
                    id: base_id.to_string(),
                    source,
                })?;
            self.state.loaded_base_id = Some(base_id.to_string());
            self.state.loaded_overlays.clear();
        }

        let diff = OverlayDiff::compute(&self.state.loaded_overlays, target);
        let missing = self.apply_overlays(base_id, diff).await;

        let fidelity = if missing.is_empty() {
            Fidelity::Exact
        } else {
            Fidelity::Degraded { missing }
        };
        Ok(WarmHandle {
            base_id: base_id.to_string(),
            fidelity,
            reused: false,
        })
    }

    /// Unload the resident base and everything on it.
    async fn evict(&mut self, current: &str) -> Result<(), CacheError> {
        info!(from = current, "switching base resource");
        self.backend
            .unload_base()
            .await
            .map_err(|source| CacheError::Evict {
                id: current.to_string(),
                source,
            })?;
        self.state.clear();
        if let Err(e) = self.backend.release_memory().await {
            warn!(error = %e, "memory release after unload failed");
        }
        Ok(())
    }

    /// Apply an overlay diff. Individual failures are logged and skipped.
    /// Returns the ids of target overlays that did not end up as requested.
    async fn apply_overlays(&mut self, base_id: &str, diff: OverlayDiff) -> Vec<String> {
        let mut missing = Vec::new();

        for name in diff.to_unload {
            if let Err(e) = self.backend.detach_overlay(&name).await {
                warn!(overlay = %name, error = %e, "overlay detach failed, forgetting it anyway");
            }
            self.state.loaded_overlays.remove(&name);
        }

        for (name, weight) in diff.to_reweight {
            match self.backend.set_overlay_weight(&name, weight).await {
                Ok(()) => {
                    self.state.loaded_overlays.insert(name, weight);
                }
                Err(e) => {
                    warn!(overlay = %name, weight, error = %e, "overlay reweight failed");
                    missing.push(name);
                }
            }
        }

        if !diff.to_load.is_empty() && !self.catalog.has_overlay_dir(base_id) {
            warn!(base_id, count = diff.to_load.len(), "base has no overlay directory, skipping overlays");
            missing.extend(diff.to_load.into_iter().map(|(name, _)| name));
            return missing;
        }

        for (name, weight) in diff.to_load {
            let Some(path) = self.catalog.overlay_path(base_id, &name) else {
                missing.push(name);
                continue;
            };
            match self.backend.attach_overlay(&name, &path, weight).await {
                Ok(()) => {
                    debug!(overlay = %name, weight, "overlay attached");
                    self.state.loaded_overlays.insert(name, weight);
                }
                Err(e) => {
                    warn!(overlay = %name, path = %path.display(), error = %e, "overlay attach failed, skipping");
                    missing.push(name);
                }
            }
        }

        missing
    }

    /// Forget everything resident and ask the backend to free memory.
    /// Safe to call any number of times.
    pub async fn cleanup(&mut self) {
        self.state.clear();
        if let Err(e) = self.backend.release_memory().await {
            warn!(error = %e, "memory release during cleanup failed");
        }
    }

    /// Unload the resident base on process exit.
    pub async fn shutdown(&mut self) {
        if let Some(base_id) = self.state.loaded_base_id.clone() {
            info!(base_id = %base_id, "unloading resident base");
            if let Err(e) = self.backend.unload_base().await {
                warn!(error = %e, "unload on shutdown failed");
            }
        }
        self.cleanup().await;
    }
}
