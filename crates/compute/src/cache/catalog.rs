use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_core::config::ModelConfig;

use super::CacheError;

/// File extension of overlay weight files.
pub const OVERLAY_EXTENSION: &str = "safetensors";

/// Where each base resource and its overlays live on disk.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelConfig>,
}

impl ModelCatalog {
    pub fn new(models: HashMap<String, ModelConfig>) -> Self {
        Self { models }
    }

    /// Look up a base and check its location exists.
    pub fn resolve(&self, base_id: &str) -> Result<&ModelConfig, CacheError> {
        let model = self
            .models
            .get(base_id)
            .ok_or_else(|| CacheError::UnknownBase(base_id.to_string()))?;
        if !model.path.exists() {
            return Err(CacheError::MissingLocation {
                id: base_id.to_string(),
                path: model.path.clone(),
            });
        }
        Ok(model)
    }

    pub fn has_overlay_dir(&self, base_id: &str) -> bool {
        self.models
            .get(base_id)
            .is_some_and(|m| m.overlay_dir.is_some())
    }

    /// `<overlay_dir>/<name>.safetensors`, or `None` if the base has no overlay dir.
    pub fn overlay_path(&self, base_id: &str, name: &str) -> Option<PathBuf> {
        let dir = self.models.get(base_id)?.overlay_dir.as_deref()?;
        Some(overlay_file(dir, name))
    }
}

fn overlay_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{OVERLAY_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_checks_id_and_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut models = HashMap::new();
        models.insert(
            "present".to_string(),
            ModelConfig {
                path: dir.path().to_path_buf(),
                overlay_dir: Some(dir.path().join("loras")),
            },
        );
        models.insert(
            "gone".to_string(),
            ModelConfig {
                path: dir.path().join("nope"),
                overlay_dir: None,
            },
        );
        let catalog = ModelCatalog::new(models);

        assert!(catalog.resolve("present").is_ok());
        assert!(matches!(
            catalog.resolve("gone"),
            Err(CacheError::MissingLocation { .. })
        ));
        assert!(matches!(
            catalog.resolve("m9"),
            Err(CacheError::UnknownBase(_))
        ));

        assert_eq!(
            catalog.overlay_path("present", "A"),
            Some(dir.path().join("loras").join("A.safetensors"))
        );
        assert_eq!(catalog.overlay_path("gone", "A"), None);
        assert!(catalog.has_overlay_dir("present"));
        assert!(!catalog.has_overlay_dir("gone"));
        assert_eq!(catalog.overlay_path("m9", "A"), None);
    }
}
