use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.yaml";

pub const ENV_DATABASE_URL: &str = "SENSOR_DATABASE_URL";
pub const ENV_ARTIFACT_DIR: &str = "SENSOR_ARTIFACT_DIR";
pub const ENV_SAVED_MODEL_DIR: &str = "SENSOR_SAVED_MODEL_DIR";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_saved_model_dir")]
    pub saved_model_dir: PathBuf,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_schema_file")]
    pub schema_file: PathBuf,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub transformation: TransformationConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            artifact_dir: default_artifact_dir(),
            saved_model_dir: default_saved_model_dir(),
            database_url: String::new(),
            schema_file: default_schema_file(),
            ingestion: IngestionConfig::default(),
            validation: ValidationConfig::default(),
            transformation: TransformationConfig::default(),
            training: TrainingConfig::default(),
            evaluation: EvaluationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Read the YAML file at `path` and apply `SENSOR_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            self.database_url = url;
        }
        if let Some(dir) = lookup(ENV_ARTIFACT_DIR).filter(|v| !v.trim().is_empty()) {
            self.artifact_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_SAVED_MODEL_DIR).filter(|v| !v.trim().is_empty()) {
            self.saved_model_dir = PathBuf::from(dir);
        }
    }

    pub fn load_schema(&self) -> Result<Schema> {
        Schema::load(&self.schema_file)
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if self.version != 1 {
            report
                .errors
                .push(format!("Unsupported config version: {}", self.version));
        }
        if self.artifact_dir.as_os_str().is_empty() {
            report
                .errors
                .push("Artifact directory cannot be empty".into());
        }
        if self.saved_model_dir.as_os_str().is_empty() {
            report
                .errors
                .push("Saved model directory cannot be empty".into());
        }
        if self.artifact_dir == self.saved_model_dir {
            report.errors.push(format!(
                "artifact_dir and saved_model_dir are both {}; Push would collide with run directories",
                self.artifact_dir.display()
            ));
        }
        if self.database_url.trim().is_empty() {
            report.errors.push(format!(
                "database_url is empty; set it in the config or via {ENV_DATABASE_URL}"
            ));
        }

        let ratio = self.ingestion.test_split_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            report.errors.push(format!(
                "ingestion.test_split_ratio must be between 0 and 1 (exclusive), got {ratio}"
            ));
        }
        let drift = self.validation.drift_threshold;
        if !(drift > 0.0 && drift < 1.0) {
            report.errors.push(format!(
                "validation.drift_threshold must be between 0 and 1 (exclusive), got {drift}"
            ));
        }
        if !(0.0..=1.0).contains(&self.training.expected_score) {
            report.errors.push(format!(
                "training.expected_score must be within [0, 1], got {}",
                self.training.expected_score
            ));
        }
        if self.training.overfitting_threshold < 0.0 {
            report.errors.push(format!(
                "training.overfitting_threshold cannot be negative, got {}",
                self.training.overfitting_threshold
            ));
        }
        if self.training.epochs == 0 {
            report
                .errors
                .push("training.epochs must be greater than zero".into());
        }
        if self.training.learning_rate <= 0.0 {
            report.errors.push(format!(
                "training.learning_rate must be positive, got {}",
                self.training.learning_rate
            ));
        }
        if self.server.max_upload_bytes == 0 {
            report
                .errors
                .push("server.max_upload_bytes must be greater than zero".into());
        }
        if !(0.0..1.0).contains(&self.evaluation.change_threshold) {
            report.errors.push(format!(
                "evaluation.change_threshold must be within [0, 1), got {}",
                self.evaluation.change_threshold
            ));
        }

        match self.load_schema() {
            Ok(schema) => report.merge(schema.validate()),
            Err(err) => report.errors.push(format!("{err:#}")),
        }

        report
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    #[serde(default = "default_test_split_ratio")]
    pub test_split_ratio: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            test_split_ratio: default_test_split_ratio(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationConfig {
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformationConfig {
    #[serde(default = "default_true")]
    pub balance_classes: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            balance_classes: true,
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    #[serde(default = "default_expected_score")]
    pub expected_score: f64,
    #[serde(default = "default_overfitting_threshold")]
    pub overfitting_threshold: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub l2: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            expected_score: default_expected_score(),
            overfitting_threshold: default_overfitting_threshold(),
            learning_rate: default_learning_rate(),
            epochs: default_epochs(),
            l2: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            change_threshold: default_change_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Expected shape of the raw sensor records.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Schema {
    #[serde(default = "default_target_column")]
    pub target_column: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub numerical_columns: Vec<String>,
    #[serde(default)]
    pub drop_columns: Vec<String>,
    #[serde(default = "default_target_mapping")]
    pub target_mapping: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub kind: String,
}

impl Schema {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
        let schema: Schema = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse schema YAML: {}", path.display()))?;
        Ok(schema)
    }

    /// Columns a dataset must carry once `drop_columns` have been removed.
    pub fn expected_columns(&self) -> Vec<&str> {
        let dropped: BTreeSet<&str> = self.drop_columns.iter().map(String::as_str).collect();
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|name| !dropped.contains(name))
            .collect()
    }

    /// Model inputs: expected columns without the target.
    pub fn feature_columns(&self) -> Vec<String> {
        self.expected_columns()
            .into_iter()
            .filter(|name| *name != self.target_column)
            .map(str::to_string)
            .collect()
    }

    pub fn encode_label(&self, label: &str) -> Option<u8> {
        self.target_mapping.get(label.trim()).copied()
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        let names: BTreeSet<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();

        if self.columns.is_empty() {
            report
                .errors
                .push("Schema must declare at least one column".into());
        }
        if names.len() != self.columns.len() {
            report
                .errors
                .push("Schema declares duplicate column names".into());
        }
        if !names.contains(self.target_column.as_str()) {
            report.errors.push(format!(
                "Target column '{}' is not declared in the schema columns",
                self.target_column
            ));
        }
        if self.drop_columns.contains(&self.target_column) {
            report
                .errors
                .push("Target column cannot be listed in drop_columns".into());
        }
        for column in &self.numerical_columns {
            if !names.contains(column.as_str()) {
                report.errors.push(format!(
                    "Numerical column '{column}' is not declared in the schema columns"
                ));
            }
        }
        for column in &self.drop_columns {
            if !names.contains(column.as_str()) {
                report.warnings.push(format!(
                    "Drop column '{column}' is not declared in the schema columns"
                ));
            }
        }
        let classes: BTreeSet<u8> = self.target_mapping.values().copied().collect();
        if classes != BTreeSet::from([0, 1]) {
            report.errors.push(format!(
                "target_mapping must map onto exactly the classes 0 and 1, got {classes:?}"
            ));
        }

        report
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ConfigReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

fn default_version() -> u32 {
    1
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifact")
}

fn default_saved_model_dir() -> PathBuf {
    PathBuf::from("saved_models")
}

fn default_schema_file() -> PathBuf {
    PathBuf::from("config/schema.yaml")
}

fn default_test_split_ratio() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_drift_threshold() -> f64 {
    0.05
}

fn default_true() -> bool {
    true
}

fn default_expected_score() -> f64 {
    0.6
}

fn default_overfitting_threshold() -> f64 {
    0.05
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    300
}

fn default_change_threshold() -> f64 {
    0.02
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_target_column() -> String {
    "class".to_string()
}

fn default_column_type() -> String {
    "float".to_string()
}

fn default_target_mapping() -> BTreeMap<String, u8> {
    BTreeMap::from([("neg".to_string(), 0), ("pos".to_string(), 1)])
}
