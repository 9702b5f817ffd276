//! The six training stages and the registry the orchestrator pulls them from.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, Schema};
use crate::error::{PipelineError, StageError};
use crate::model::{ClassificationMetrics, Learner, LogisticRegression};
use crate::store::{ArtifactStore, RunDirectory};
use crate::timestamp::Timestamp;

pub mod evaluation;
pub mod ingestion;
pub mod push;
pub mod training;
pub mod transformation;
pub mod validation;

pub use evaluation::EvaluationStage;
pub use ingestion::IngestionStage;
pub use push::PushStage;
pub use training::TrainingStage;
pub use transformation::TransformationStage;
pub use validation::ValidationStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ingestion,
    Validation,
    Transformation,
    Training,
    Evaluation,
    Push,
}

impl StageKind {
    /// Execution order of a run.
    pub const ALL: [StageKind; 6] = [
        StageKind::Ingestion,
        StageKind::Validation,
        StageKind::Transformation,
        StageKind::Training,
        StageKind::Evaluation,
        StageKind::Push,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Ingestion => "ingestion",
            StageKind::Validation => "validation",
            StageKind::Transformation => "transformation",
            StageKind::Training => "training",
            StageKind::Evaluation => "evaluation",
            StageKind::Push => "push",
        }
    }

    /// Subdirectory of the run directory the stage writes into.
    pub fn dir_name(self) -> &'static str {
        match self {
            StageKind::Ingestion => "data_ingestion",
            StageKind::Validation => "data_validation",
            StageKind::Transformation => "data_transformation",
            StageKind::Training => "model_trainer",
            StageKind::Evaluation => "model_evaluation",
            StageKind::Push => "model_pusher",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionArtifact {
    pub feature_store_file: PathBuf,
    pub train_file: PathBuf,
    pub test_file: PathBuf,
    pub records: usize,
    pub train_rows: usize,
    pub test_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationArtifact {
    pub validation_status: bool,
    pub valid_train_file: PathBuf,
    pub valid_test_file: PathBuf,
    pub drift_report_file: PathBuf,
    pub drifted_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformationArtifact {
    pub validation_status: bool,
    pub preprocessor_file: PathBuf,
    pub transformed_train_file: PathBuf,
    pub transformed_test_file: PathBuf,
    /// Untransformed test split, kept so evaluation can score any model on it.
    pub valid_test_file: PathBuf,
    pub feature_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub trained_model_file: PathBuf,
    pub train_metrics: ClassificationMetrics,
    pub test_metrics: ClassificationMetrics,
    pub valid_test_file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationArtifact {
    pub is_model_accepted: bool,
    pub improved_f1: f64,
    pub trained_model_file: PathBuf,
    pub best_model_file: Option<PathBuf>,
    pub report_file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushArtifact {
    pub pushed_model_file: PathBuf,
    pub saved_model_file: PathBuf,
}

/// Output of one stage, handed by value to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "artifact", rename_all = "snake_case")]
pub enum StageArtifact {
    Ingestion(IngestionArtifact),
    Validation(ValidationArtifact),
    Transformation(TransformationArtifact),
    Training(TrainingArtifact),
    Evaluation(EvaluationArtifact),
    Push(PushArtifact),
}

impl StageArtifact {
    pub fn kind(&self) -> StageKind {
        match self {
            StageArtifact::Ingestion(_) => StageKind::Ingestion,
            StageArtifact::Validation(_) => StageKind::Validation,
            StageArtifact::Transformation(_) => StageKind::Transformation,
            StageArtifact::Training(_) => StageKind::Training,
            StageArtifact::Evaluation(_) => StageKind::Evaluation,
            StageArtifact::Push(_) => StageKind::Push,
        }
    }

    /// JSON view of the artifact body, recorded in the run manifest.
    pub fn summary(&self) -> Value {
        let body = match self {
            StageArtifact::Ingestion(a) => serde_json::to_value(a),
            StageArtifact::Validation(a) => serde_json::to_value(a),
            StageArtifact::Transformation(a) => serde_json::to_value(a),
            StageArtifact::Training(a) => serde_json::to_value(a),
            StageArtifact::Evaluation(a) => serde_json::to_value(a),
            StageArtifact::Push(a) => serde_json::to_value(a),
        };
        body.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub enum StageInput {
    /// Ingestion starts from configuration alone.
    Config,
    Artifact(StageArtifact),
}

impl StageInput {
    pub fn into_artifact(self, stage: StageKind) -> Result<StageArtifact, StageError> {
        match self {
            StageInput::Artifact(artifact) => Ok(artifact),
            StageInput::Config => Err(StageError::UnexpectedInput {
                stage,
                expected: "a previous stage artifact",
            }),
        }
    }
}

/// Per-run state shared with every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    run: RunDirectory,
}

impl RunContext {
    pub fn new(run: RunDirectory) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &RunDirectory {
        &self.run
    }

    pub fn timestamp(&self) -> Timestamp {
        self.run.timestamp()
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;
    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError>;
}

#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Box<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage` under its own kind, replacing any earlier registration.
    pub fn register(&mut self, stage: Box<dyn Stage>) {
        self.stages.insert(stage.kind(), stage);
    }

    /// Remove the stages in execution order; fails if any kind is unregistered.
    pub fn into_sequence(mut self) -> Result<Vec<Box<dyn Stage>>, PipelineError> {
        StageKind::ALL
            .iter()
            .map(|kind| {
                self.stages
                    .remove(kind)
                    .ok_or(PipelineError::MissingStage(*kind))
            })
            .collect()
    }
}

/// Register the production implementation of every stage.
pub fn register_defaults(registry: &mut StageRegistry, config: &Config) -> Result<()> {
    let learner: Arc<dyn Learner> = Arc::new(LogisticRegression::from_config(&config.training));
    register_defaults_with_learner(registry, config, learner)
}

pub fn register_defaults_with_learner(
    registry: &mut StageRegistry,
    config: &Config,
    learner: Arc<dyn Learner>,
) -> Result<()> {
    let schema: Arc<Schema> = Arc::new(config.load_schema()?);
    let store = ArtifactStore::from_config(config);

    registry.register(Box::new(IngestionStage::new(
        config.database_url.clone(),
        schema.clone(),
        config.ingestion.clone(),
    )));
    registry.register(Box::new(ValidationStage::new(
        schema.clone(),
        config.validation.clone(),
    )));
    registry.register(Box::new(TransformationStage::new(
        schema.clone(),
        config.transformation.clone(),
    )));
    registry.register(Box::new(TrainingStage::new(
        learner,
        config.training.clone(),
    )));
    registry.register(Box::new(EvaluationStage::new(
        schema,
        store.resolver(),
        config.evaluation.clone(),
    )));
    registry.register(Box::new(PushStage::new(store)));
    Ok(())
}

/// Error for a stage handed an artifact of the wrong kind.
pub(crate) fn unexpected(stage: StageKind, expected: &'static str) -> StageError {
    StageError::UnexpectedInput { stage, expected }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(StageKind);

    impl Stage for Noop {
        fn kind(&self) -> StageKind {
            self.0
        }

        fn run(&self, _input: StageInput, _ctx: &RunContext) -> Result<StageArtifact, StageError> {
            Ok(StageArtifact::Push(PushArtifact::default()))
        }
    }

    #[test]
    fn sequence_follows_execution_order() {
        let mut registry = StageRegistry::new();
        for kind in StageKind::ALL.iter().rev() {
            registry.register(Box::new(Noop(*kind)));
        }
        let kinds: Vec<_> = registry
            .into_sequence()
            .unwrap()
            .iter()
            .map(|s| s.kind())
            .collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
    }

    #[test]
    fn sequence_reports_missing_stage() {
        let mut registry = StageRegistry::new();
        registry.register(Box::new(Noop(StageKind::Ingestion)));
        let err = registry.into_sequence().err().unwrap();
        assert!(matches!(err, PipelineError::MissingStage(StageKind::Validation)));
    }

    #[test]
    fn config_input_is_rejected_by_downstream_stages() {
        let err = StageInput::Config
            .into_artifact(StageKind::Training)
            .unwrap_err();
        assert!(err.to_string().contains("training stage received unexpected input"));
    }

    #[test]
    fn summary_serialises_the_artifact_body() {
        let artifact = StageArtifact::Ingestion(IngestionArtifact {
            records: 12,
            ..Default::default()
        });
        assert_eq!(artifact.kind(), StageKind::Ingestion);
        assert_eq!(artifact.summary()["records"], 12);
    }
}
