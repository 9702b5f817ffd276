use std::fs;

use anyhow::Context;
use tracing::info;

use crate::error::StageError;
use crate::stages::{PushArtifact, RunContext, Stage, StageArtifact, StageInput, StageKind, unexpected};
use crate::store::{ArtifactStore, ensure_parent};

/// Commits an accepted model as a new servable version.
pub struct PushStage {
    store: ArtifactStore,
}

impl PushStage {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }
}

impl Stage for PushStage {
    fn kind(&self) -> StageKind {
        StageKind::Push
    }

    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError> {
        let StageArtifact::Evaluation(evaluated) = input.into_artifact(self.kind())? else {
            return Err(unexpected(self.kind(), "evaluation artifact"));
        };
        if !evaluated.is_model_accepted {
            return Err(StageError::precondition(format!(
                "Trained model was not accepted: f1 improvement {:.4} over the current model is too small",
                evaluated.improved_f1
            )));
        }

        let pushed_model_file = ctx.run().pushed_model_file();
        ensure_parent(&pushed_model_file)?;
        fs::copy(&evaluated.trained_model_file, &pushed_model_file).with_context(|| {
            format!(
                "Failed to copy trained model to {}",
                pushed_model_file.display()
            )
        })?;

        let saved_model_file = self
            .store
            .publish_model(ctx.timestamp(), &pushed_model_file)?;
        info!(
            timestamp = %ctx.timestamp(),
            model = %saved_model_file.display(),
            "Published model version"
        );

        Ok(StageArtifact::Push(PushArtifact {
            pushed_model_file,
            saved_model_file,
        }))
    }
}
