use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{EvaluationConfig, Schema};
use crate::dataset::Dataset;
use crate::error::{ResolveError, StageError};
use crate::model::{ClassificationMetrics, SensorModel};
use crate::resolver::ModelResolver;
use crate::stages::{
    EvaluationArtifact, RunContext, Stage, StageArtifact, StageInput, StageKind, unexpected,
};
use crate::store::ensure_parent;

/// Compares the trained model with the currently served one on the test split.
pub struct EvaluationStage {
    schema: Arc<Schema>,
    resolver: ModelResolver,
    config: EvaluationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub is_model_accepted: bool,
    pub improved_f1: f64,
    pub change_threshold: f64,
    pub trained_model_file: PathBuf,
    pub trained_metrics: ClassificationMetrics,
    pub best_model_file: Option<PathBuf>,
    pub best_metrics: Option<ClassificationMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_model_error: Option<String>,
}

impl EvaluationStage {
    pub fn new(schema: Arc<Schema>, resolver: ModelResolver, config: EvaluationConfig) -> Self {
        Self {
            schema,
            resolver,
            config,
        }
    }

    fn labels(&self, data: &Dataset) -> Result<Vec<u8>> {
        let target = &self.schema.target_column;
        let Some(values) = data.column(target) else {
            bail!("Target column '{target}' is missing from the test split");
        };
        values
            .into_iter()
            .map(|value| {
                self.schema
                    .encode_label(value)
                    .with_context(|| format!("Unmapped target value '{value}'"))
            })
            .collect()
    }
}

fn score_model(path: &Path, data: &Dataset, labels: &[u8]) -> Result<ClassificationMetrics> {
    let model = SensorModel::load(path)?;
    let predictions = model.predict(data)?;
    Ok(ClassificationMetrics::score(labels, &predictions))
}

impl Stage for EvaluationStage {
    fn kind(&self) -> StageKind {
        StageKind::Evaluation
    }

    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError> {
        let StageArtifact::Training(trained) = input.into_artifact(self.kind())? else {
            return Err(unexpected(self.kind(), "training artifact"));
        };

        let test = Dataset::read_csv(&trained.valid_test_file)?;
        let labels = self.labels(&test)?;
        let trained_metrics = score_model(&trained.trained_model_file, &test, &labels)
            .context("Failed to score the trained model")?;

        let mut best_model_error = None;
        let best = match self.resolver.best_model_path() {
            Ok(path) => match score_model(&path, &test, &labels) {
                Ok(metrics) => Some((path, metrics)),
                Err(err) => {
                    // Unscoreable incumbent counts as absent.
                    warn!(
                        model = %path.display(),
                        error = %format!("{err:#}"),
                        "Current model could not be scored; treating it as absent"
                    );
                    best_model_error = Some(format!("{err:#}"));
                    None
                }
            },
            Err(ResolveError::NotFound { .. }) => None,
        };

        let (improved_f1, is_model_accepted) = match &best {
            None => (trained_metrics.f1_score, true),
            Some((_, best_metrics)) => {
                let improved = trained_metrics.f1_score - best_metrics.f1_score;
                (improved, improved > self.config.change_threshold)
            }
        };

        let report = EvaluationReport {
            is_model_accepted,
            improved_f1,
            change_threshold: self.config.change_threshold,
            trained_model_file: trained.trained_model_file.clone(),
            trained_metrics,
            best_model_file: best.as_ref().map(|(path, _)| path.clone()),
            best_metrics: best.as_ref().map(|(_, metrics)| *metrics),
            best_model_error,
        };
        let report_file = ctx.run().evaluation_report_file();
        ensure_parent(&report_file)?;
        fs::write(
            &report_file,
            serde_yaml::to_string(&report).context("Failed to encode evaluation report")?,
        )
        .with_context(|| format!("Failed to write evaluation report: {}", report_file.display()))?;

        info!(
            accepted = is_model_accepted,
            improved_f1,
            trained_f1 = trained_metrics.f1_score,
            best_f1 = report.best_metrics.map(|m| m.f1_score),
            "Evaluated trained model"
        );

        Ok(StageArtifact::Evaluation(EvaluationArtifact {
            is_model_accepted,
            improved_f1,
            trained_model_file: trained.trained_model_file,
            best_model_file: report.best_model_file,
            report_file,
        }))
    }
}
