use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::TrainingConfig;
use crate::error::StageError;
use crate::model::{ClassificationMetrics, Learner, SensorModel};
use crate::stages::transformation::{TransformedData, load_preprocessor};
use crate::stages::{
    RunContext, Stage, StageArtifact, StageInput, StageKind, TrainingArtifact, unexpected,
};

/// Fits the classifier and enforces the score and overfitting gates.
pub struct TrainingStage {
    learner: Arc<dyn Learner>,
    config: TrainingConfig,
}

impl TrainingStage {
    pub fn new(learner: Arc<dyn Learner>, config: TrainingConfig) -> Self {
        Self { learner, config }
    }
}

impl Stage for TrainingStage {
    fn kind(&self) -> StageKind {
        StageKind::Training
    }

    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError> {
        let StageArtifact::Transformation(transformed) = input.into_artifact(self.kind())? else {
            return Err(unexpected(self.kind(), "transformation artifact"));
        };
        if !transformed.validation_status {
            return Err(StageError::precondition(
                "Data validation detected drift; refusing to train on invalid data",
            ));
        }

        let train = TransformedData::load(&transformed.transformed_train_file)?;
        let test = TransformedData::load(&transformed.transformed_test_file)?;
        let preprocessor = load_preprocessor(&transformed.preprocessor_file)?;

        let classifier = self.learner.fit(&train.features, &train.labels)?;
        let train_metrics =
            ClassificationMetrics::score(&train.labels, &classifier.predict(&train.features)?);
        let test_metrics =
            ClassificationMetrics::score(&test.labels, &classifier.predict(&test.features)?);
        info!(
            learner = self.learner.name(),
            train_f1 = train_metrics.f1_score,
            test_f1 = test_metrics.f1_score,
            "Fitted classifier"
        );

        if train_metrics.f1_score < self.config.expected_score {
            return Err(StageError::precondition(format!(
                "Trained model is not good enough: train f1 {:.4} is below the expected {:.4}",
                train_metrics.f1_score, self.config.expected_score
            )));
        }
        let gap = (train_metrics.f1_score - test_metrics.f1_score).abs();
        if gap > self.config.overfitting_threshold {
            return Err(StageError::precondition(format!(
                "Train/test f1 gap {gap:.4} exceeds the overfitting threshold {:.4}",
                self.config.overfitting_threshold
            )));
        }

        let model = SensorModel {
            feature_columns: transformed.feature_columns,
            preprocessor,
            classifier,
            learner: self.learner.name().to_string(),
            trained_at: Utc::now(),
        };
        let trained_model_file = ctx.run().trained_model_file();
        model.save(&trained_model_file)?;
        info!(file = %trained_model_file.display(), "Saved trained model");

        Ok(StageArtifact::Training(TrainingArtifact {
            trained_model_file,
            train_metrics,
            test_metrics,
            valid_test_file: transformed.valid_test_file,
        }))
    }
}
