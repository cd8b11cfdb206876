use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A finished synthesis output on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// MIME type of the file, e.g. `image/png`.
    pub content_type: String,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, content_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_type: content_type.into(),
        }
    }

    /// PNG image at `path`.
    pub fn png(path: impl Into<PathBuf>) -> Self {
        Self::new(path, "image/png")
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}
