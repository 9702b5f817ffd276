use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::{IngestionConfig, Schema};
use crate::error::StageError;
use crate::source;
use crate::stages::{IngestionArtifact, RunContext, Stage, StageArtifact, StageInput, StageKind};

/// Exports the raw records to the feature store and splits them into train/test.
pub struct IngestionStage {
    database_url: String,
    schema: Arc<Schema>,
    config: IngestionConfig,
}

impl IngestionStage {
    pub fn new(database_url: String, schema: Arc<Schema>, config: IngestionConfig) -> Self {
        Self {
            database_url,
            schema,
            config,
        }
    }
}

impl Stage for IngestionStage {
    fn kind(&self) -> StageKind {
        StageKind::Ingestion
    }

    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError> {
        if !matches!(input, StageInput::Config) {
            return Err(crate::stages::unexpected(self.kind(), "configuration"));
        }

        let source = source::connect(&self.database_url)
            .context("Failed to connect to the record source")?;
        let mut records = source
            .fetch()
            .with_context(|| format!("Failed to export records from {}", source.describe()))?;
        if records.is_empty() {
            return Err(StageError::precondition(format!(
                "Record source {} returned no records",
                source.describe()
            )));
        }

        let run = ctx.run();
        let feature_store_file = run.feature_store_file();
        records.write_csv(&feature_store_file)?;
        info!(
            source = %source.describe(),
            records = records.len(),
            file = %feature_store_file.display(),
            "Exported records to feature store"
        );

        records.drop_columns(&self.schema.drop_columns);
        let (train, test) =
            records.train_test_split(self.config.test_split_ratio, self.config.seed);

        let train_file = run.ingested_train_file();
        let test_file = run.ingested_test_file();
        train.write_csv(&train_file)?;
        test.write_csv(&test_file)?;
        info!(
            train_rows = train.len(),
            test_rows = test.len(),
            "Split records into train and test sets"
        );

        Ok(StageArtifact::Ingestion(IngestionArtifact {
            feature_store_file,
            train_file,
            test_file,
            records: records.len(),
            train_rows: train.len(),
            test_rows: test.len(),
        }))
    }
}
