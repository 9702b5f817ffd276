use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::ResolveError;
use crate::store::MODEL_FILE_NAME;
use crate::timestamp::Timestamp;

/// A committed, servable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelVersion {
    pub timestamp: Timestamp,
    pub directory: PathBuf,
    pub model_path: PathBuf,
}

impl ModelVersion {
    fn dir_name(&self) -> String {
        self.directory
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Picks the current model among the timestamped directories under `root`.
///
/// Every query re-scans the directory; nothing is cached, so a version
/// committed by a concurrent push is visible on the very next call.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    root: PathBuf,
}

impl ModelResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_model_available(&self) -> bool {
        self.best_version().is_ok()
    }

    pub fn best_model_path(&self) -> Result<PathBuf, ResolveError> {
        self.best_version().map(|version| version.model_path)
    }

    pub fn best_version(&self) -> Result<ModelVersion, ResolveError> {
        let version = self
            .versions()
            .pop()
            .ok_or_else(|| ResolveError::NotFound {
                root: self.root.clone(),
            })?;
        debug!(
            version = %version.timestamp,
            path = %version.model_path.display(),
            "Resolved current model"
        );
        Ok(version)
    }

    /// All valid versions in ascending order. Equal timestamps (`300` vs
    /// `0300`) are ordered by directory name so the choice is deterministic.
    pub fn versions(&self) -> Vec<ModelVersion> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            trace!(root = %self.root.display(), "Model root not readable");
            return Vec::new();
        };

        let mut versions: Vec<ModelVersion> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let timestamp = name.parse::<Timestamp>().ok()?;
                let directory = entry.path();
                if !directory.is_dir() {
                    return None;
                }
                let model_path = directory.join(MODEL_FILE_NAME);
                if !is_readable_file(&model_path) {
                    trace!(dir = %directory.display(), "Skipping version without model file");
                    return None;
                }
                Some(ModelVersion {
                    timestamp,
                    directory,
                    model_path,
                })
            })
            .collect();

        versions.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.dir_name().cmp(&b.dir_name()))
        });
        versions
    }
}

fn is_readable_file(path: &Path) -> bool {
    path.is_file() && File::open(path).is_ok()
}
