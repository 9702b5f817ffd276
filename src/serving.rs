use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::error::ServeError;
use crate::model::{SensorModel, prediction_label};
use crate::resolver::ModelResolver;

pub const PREDICTION_COLUMN: &str = "prediction";

/// Scores uploaded CSV tables with the current best model.
#[derive(Debug, Clone)]
pub struct Predictor {
    resolver: ModelResolver,
}

impl Predictor {
    pub fn new(resolver: ModelResolver) -> Self {
        Self { resolver }
    }

    /// Parse `body` as CSV, append a `prediction` column and render it back.
    pub fn predict_csv(&self, body: &[u8]) -> Result<Vec<u8>, ServeError> {
        let text = std::str::from_utf8(body)
            .map_err(|err| ServeError::bad_input(format!("Upload is not valid UTF-8: {err}")))?;
        let data = Dataset::from_csv_str(text)
            .map_err(|err| ServeError::bad_input(format!("Upload is not a valid CSV table: {err}")))?;
        let scored = self.predict_dataset(data)?;
        Ok(scored.to_csv_string().into_bytes())
    }

    pub fn predict_dataset(&self, mut data: Dataset) -> Result<Dataset, ServeError> {
        if data.is_empty() {
            return Err(ServeError::bad_input("Upload contains no data rows"));
        }

        let version = self.resolver.best_version()?;
        debug!(model = %version.model_path.display(), "Loading model for prediction");
        let model = SensorModel::load(&version.model_path).map_err(ServeError::Internal)?;

        let missing = model.missing_columns(&data);
        if !missing.is_empty() {
            return Err(ServeError::bad_input(format!(
                "Upload is missing required columns: {}",
                missing.join(", ")
            )));
        }
        if data.column_index(PREDICTION_COLUMN).is_some() {
            return Err(ServeError::bad_input(format!(
                "Upload already has a '{PREDICTION_COLUMN}' column"
            )));
        }

        if let Some((column, row, cell)) = data.first_non_numeric(&model.feature_columns) {
            return Err(ServeError::bad_input(format!(
                "Column '{column}' has a non-numeric value '{cell}' in row {row}"
            )));
        }

        let predictions = model.predict(&data).map_err(ServeError::Internal)?;
        let labels = predictions
            .iter()
            .map(|&class| prediction_label(class).to_string())
            .collect();
        data.push_column(PREDICTION_COLUMN, labels)
            .map_err(ServeError::Internal)?;

        info!(
            rows = data.len(),
            model_version = %version.timestamp,
            "Scored uploaded records"
        );
        Ok(data)
    }
}
