//! The servable model artifact and the numerical pieces it is built from.

pub mod classifier;
pub mod metrics;
pub mod preprocess;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::store::ensure_parent;

pub use classifier::{Classifier, Learner, LogisticRegression};
pub use metrics::ClassificationMetrics;
pub use preprocess::Preprocessor;

/// Preprocessor and classifier bundled with the feature columns they were
/// fitted on, so a raw uploaded table can be scored directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorModel {
    pub feature_columns: Vec<String>,
    pub preprocessor: Preprocessor,
    pub classifier: Classifier,
    pub learner: String,
    pub trained_at: DateTime<Utc>,
}

impl SensorModel {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write model file: {}", path.display()))
    }

    /// Columns the model needs that `data` does not have.
    pub fn missing_columns(&self, data: &Dataset) -> Vec<String> {
        self.feature_columns
            .iter()
            .filter(|name| data.column_index(name).is_none())
            .cloned()
            .collect()
    }

    pub fn predict(&self, data: &Dataset) -> Result<Vec<u8>> {
        let raw = data.numeric_matrix(&self.feature_columns)?;
        let features = self.preprocessor.transform(&raw)?;
        self.classifier.predict(&features)
    }
}

/// Human-readable label for a predicted class.
pub fn prediction_label(class: u8) -> &'static str {
    if class == 1 { "Yes" } else { "No" }
}
