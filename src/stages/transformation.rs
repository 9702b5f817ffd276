use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Schema, TransformationConfig};
use crate::dataset::Dataset;
use crate::error::StageError;
use crate::model::Preprocessor;
use crate::stages::{
    RunContext, Stage, StageArtifact, StageInput, StageKind, TransformationArtifact, unexpected,
};
use crate::store::ensure_parent;

/// Feature matrix plus encoded labels, as persisted between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedData {
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl TransformedData {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read transformed data: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse transformed data: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let content = serde_json::to_string(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write transformed data: {}", path.display()))
    }

    /// Rows per class, indexed by label.
    pub fn class_counts(&self) -> [usize; 2] {
        let positives = self.labels.iter().filter(|&&label| label == 1).count();
        [self.labels.len() - positives, positives]
    }
}

pub fn load_preprocessor(path: &Path) -> Result<Preprocessor> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read preprocessor: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse preprocessor: {}", path.display()))
}

/// Encodes the target, fits the preprocessor and balances the train split.
pub struct TransformationStage {
    schema: Arc<Schema>,
    config: TransformationConfig,
}

impl TransformationStage {
    pub fn new(schema: Arc<Schema>, config: TransformationConfig) -> Self {
        Self { schema, config }
    }

    fn encode_labels(&self, data: &Dataset) -> Result<Vec<u8>> {
        let target = &self.schema.target_column;
        let Some(values) = data.column(target) else {
            bail!("Target column '{target}' is missing");
        };
        values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                self.schema
                    .encode_label(value)
                    .with_context(|| format!("Row {} has unmapped target value '{value}'", idx + 1))
            })
            .collect()
    }
}

impl Stage for TransformationStage {
    fn kind(&self) -> StageKind {
        StageKind::Transformation
    }

    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError> {
        let StageArtifact::Validation(validated) = input.into_artifact(self.kind())? else {
            return Err(unexpected(self.kind(), "validation artifact"));
        };

        let train = Dataset::read_csv(&validated.valid_train_file)?;
        let test = Dataset::read_csv(&validated.valid_test_file)?;
        let feature_columns = self.schema.feature_columns();

        let train_raw = train.numeric_matrix(&feature_columns)?;
        let test_raw = test.numeric_matrix(&feature_columns)?;
        let preprocessor = Preprocessor::fit(&train_raw, 0.0)?;

        let mut train_data = TransformedData {
            features: preprocessor.transform(&train_raw)?,
            labels: self.encode_labels(&train)?,
        };
        let test_data = TransformedData {
            features: preprocessor.transform(&test_raw)?,
            labels: self.encode_labels(&test)?,
        };

        if self.config.balance_classes {
            let before = train_data.class_counts();
            oversample_minority(&mut train_data, self.config.seed);
            let after = train_data.class_counts();
            if before == after && before[0] != before[1] {
                warn!(?before, "Train split has a single class; skipping oversampling");
            } else {
                info!(?before, ?after, "Balanced train classes by oversampling");
            }
        }

        let run = ctx.run();
        let preprocessor_file = run.preprocessor_file();
        let transformed_train_file = run.transformed_train_file();
        let transformed_test_file = run.transformed_test_file();

        ensure_parent(&preprocessor_file)?;
        fs::write(
            &preprocessor_file,
            serde_json::to_string_pretty(&preprocessor).context("Failed to encode preprocessor")?,
        )
        .with_context(|| format!("Failed to write preprocessor: {}", preprocessor_file.display()))?;
        train_data.save(&transformed_train_file)?;
        test_data.save(&transformed_test_file)?;
        info!(
            features = feature_columns.len(),
            train_rows = train_data.labels.len(),
            test_rows = test_data.labels.len(),
            "Persisted transformed arrays"
        );

        Ok(StageArtifact::Transformation(TransformationArtifact {
            validation_status: validated.validation_status,
            preprocessor_file,
            transformed_train_file,
            transformed_test_file,
            valid_test_file: validated.valid_test_file,
            feature_columns,
        }))
    }
}

/// Duplicate random minority rows until both classes have equal counts.
/// A split with only one class is left unchanged.
fn oversample_minority(data: &mut TransformedData, seed: u64) {
    let counts = data.class_counts();
    if counts[0] == 0 || counts[1] == 0 || counts[0] == counts[1] {
        return;
    }
    let minority: u8 = if counts[1] < counts[0] { 1 } else { 0 };
    let pool: Vec<usize> = data
        .labels
        .iter()
        .enumerate()
        .filter(|(_, label)| **label == minority)
        .map(|(idx, _)| idx)
        .collect();
    let needed = counts[0].abs_diff(counts[1]);

    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..needed {
        let idx = pool[rng.gen_range(0..pool.len())];
        let row = data.features[idx].clone();
        data.features.push(row);
        data.labels.push(minority);
    }
}
