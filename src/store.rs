//! On-disk layout of pipeline runs and committed models.
//!
//! ```text
//! <artifact_root>/<timestamp>/<stage dir>/...   one directory per run
//! <saved_model_root>/<timestamp>/model.json     committed model versions
//! ```

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::config::Config;
use crate::resolver::ModelResolver;
use crate::stages::StageKind;
use crate::timestamp::Timestamp;

pub const MODEL_FILE_NAME: &str = "model.json";
pub const MANIFEST_FILE_NAME: &str = "run_manifest.yaml";
pub const FEATURE_STORE_FILE_NAME: &str = "sensor.csv";
pub const TRAIN_FILE_NAME: &str = "train.csv";
pub const TEST_FILE_NAME: &str = "test.csv";
pub const TRANSFORMED_TRAIN_FILE_NAME: &str = "train.json";
pub const TRANSFORMED_TEST_FILE_NAME: &str = "test.json";
pub const PREPROCESSOR_FILE_NAME: &str = "preprocessing.json";
pub const REPORT_FILE_NAME: &str = "report.yaml";

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    artifact_root: PathBuf,
    saved_model_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(artifact_root: impl Into<PathBuf>, saved_model_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
            saved_model_root: saved_model_root.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.artifact_dir, &config.saved_model_dir)
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    pub fn saved_model_root(&self) -> &Path {
        &self.saved_model_root
    }

    pub fn resolver(&self) -> ModelResolver {
        ModelResolver::new(&self.saved_model_root)
    }

    /// Existing run directories, oldest first. Names that are not timestamps
    /// are skipped.
    pub fn runs(&self) -> Vec<RunDirectory> {
        let Ok(entries) = fs::read_dir(&self.artifact_root) else {
            return Vec::new();
        };
        let mut runs: Vec<RunDirectory> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let timestamp = entry.file_name().to_str()?.parse::<Timestamp>().ok()?;
                Some(RunDirectory {
                    timestamp,
                    path: entry.path(),
                })
            })
            .collect();
        runs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));
        runs
    }

    /// Claim a fresh run directory.
    ///
    /// The directory is created with `create_dir`, so two allocators can never
    /// end up sharing a timestamp; on collision the next integer is tried.
    pub fn allocate_run(&self) -> Result<RunDirectory> {
        fs::create_dir_all(&self.artifact_root).with_context(|| {
            format!(
                "Failed to create artifact directory: {}",
                self.artifact_root.display()
            )
        })?;

        let mut candidate = Timestamp::now();
        loop {
            let name = candidate.to_string();
            if self.saved_model_root.join(&name).exists() {
                candidate = candidate.next();
                continue;
            }
            let path = self.artifact_root.join(&name);
            match fs::create_dir(&path) {
                Ok(()) => {
                    debug!(run = %candidate, path = %path.display(), "Run directory allocated");
                    return Ok(RunDirectory {
                        timestamp: candidate,
                        path,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = candidate.next();
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Failed to create run directory: {}", path.display())
                    });
                }
            }
        }
    }

    /// Commit `model_file` as the model version `timestamp`.
    ///
    /// The file is written into a staging directory whose name never parses as a
    /// timestamp, flushed, and only then renamed into place, so readers observe
    /// either no version or a complete one.
    pub fn publish_model(&self, timestamp: Timestamp, model_file: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.saved_model_root).with_context(|| {
            format!(
                "Failed to create saved model directory: {}",
                self.saved_model_root.display()
            )
        })?;

        let staging = self
            .saved_model_root
            .join(format!("{STAGING_PREFIX}{timestamp}"));
        let target = self.saved_model_root.join(timestamp.to_string());

        let result = commit_via_staging(model_file, &staging, &target);
        if result.is_err() && staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(
                    staging = %staging.display(),
                    error = %err,
                    "Failed to clean up model staging directory"
                );
            }
        }
        result
    }
}

fn commit_via_staging(model_file: &Path, staging: &Path, target: &Path) -> Result<PathBuf> {
    if target.exists() {
        bail!("Model version already exists: {}", target.display());
    }
    if staging.exists() {
        fs::remove_dir_all(staging).with_context(|| {
            format!(
                "Failed to remove stale staging directory: {}",
                staging.display()
            )
        })?;
    }
    fs::create_dir(staging)
        .with_context(|| format!("Failed to create staging directory: {}", staging.display()))?;

    let staged_model = staging.join(MODEL_FILE_NAME);
    fs::copy(model_file, &staged_model).with_context(|| {
        format!(
            "Failed to copy model '{}' into '{}'",
            model_file.display(),
            staged_model.display()
        )
    })?;
    File::open(&staged_model)
        .and_then(|file| file.sync_all())
        .with_context(|| format!("Failed to flush staged model: {}", staged_model.display()))?;

    fs::rename(staging, target).with_context(|| {
        format!(
            "Failed to commit model version '{}' to '{}'",
            staging.display(),
            target.display()
        )
    })?;

    Ok(target.join(MODEL_FILE_NAME))
}

/// One run's directory. Stages only ever append to it.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    timestamp: Timestamp,
    path: PathBuf,
}

impl RunDirectory {
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stage_dir(&self, kind: StageKind) -> PathBuf {
        self.path.join(kind.dir_name())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE_NAME)
    }

    pub fn feature_store_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Ingestion)
            .join("feature_store")
            .join(FEATURE_STORE_FILE_NAME)
    }

    pub fn ingested_train_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Ingestion)
            .join("ingested")
            .join(TRAIN_FILE_NAME)
    }

    pub fn ingested_test_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Ingestion)
            .join("ingested")
            .join(TEST_FILE_NAME)
    }

    pub fn valid_train_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Validation)
            .join("valid")
            .join(TRAIN_FILE_NAME)
    }

    pub fn valid_test_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Validation)
            .join("valid")
            .join(TEST_FILE_NAME)
    }

    pub fn drift_report_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Validation)
            .join("drift_report")
            .join(REPORT_FILE_NAME)
    }

    pub fn transformed_train_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Transformation)
            .join("transformed")
            .join(TRANSFORMED_TRAIN_FILE_NAME)
    }

    pub fn transformed_test_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Transformation)
            .join("transformed")
            .join(TRANSFORMED_TEST_FILE_NAME)
    }

    pub fn preprocessor_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Transformation)
            .join("transformed_object")
            .join(PREPROCESSOR_FILE_NAME)
    }

    pub fn trained_model_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Training)
            .join("trained_model")
            .join(MODEL_FILE_NAME)
    }

    pub fn evaluation_report_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Evaluation).join(REPORT_FILE_NAME)
    }

    pub fn pushed_model_file(&self) -> PathBuf {
        self.stage_dir(StageKind::Push).join(MODEL_FILE_NAME)
    }
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_run_never_reuses_a_timestamp() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::new(temp.path().join("artifact"), temp.path().join("saved"));

        let first = store.allocate_run().unwrap();
        let second = store.allocate_run().unwrap();
        let third = store.allocate_run().unwrap();

        assert!(first.timestamp() < second.timestamp());
        assert!(second.timestamp() < third.timestamp());
        assert!(first.path().is_dir());
        assert!(third.path().is_dir());
    }

    #[test]
    fn allocate_run_skips_timestamps_already_committed_as_models() {
        let temp = tempdir().unwrap();
        let saved = temp.path().join("saved");
        let now = Timestamp::now();
        for offset in 0..3 {
            fs::create_dir_all(saved.join(Timestamp::new(now.value() + offset).to_string()))
                .unwrap();
        }
        let store = ArtifactStore::new(temp.path().join("artifact"), &saved);

        let run = store.allocate_run().unwrap();
        assert!(run.timestamp().value() >= now.value() + 3);
    }

    #[test]
    fn publish_model_commits_and_leaves_no_staging() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::new(temp.path().join("artifact"), temp.path().join("saved"));
        let model = temp.path().join("model.json");
        fs::write(&model, b"{}").unwrap();

        let committed = store.publish_model(Timestamp::new(500), &model).unwrap();

        assert_eq!(committed, temp.path().join("saved/500/model.json"));
        assert!(committed.is_file());
        let names: Vec<_> = fs::read_dir(store.saved_model_root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["500".to_string()]);
    }

    #[test]
    fn publish_model_failure_cleans_staging_and_keeps_existing_version() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::new(temp.path().join("artifact"), temp.path().join("saved"));
        let model = temp.path().join("model.json");
        fs::write(&model, b"{}").unwrap();
        store.publish_model(Timestamp::new(100), &model).unwrap();

        let missing = temp.path().join("does-not-exist.json");
        assert!(store.publish_model(Timestamp::new(200), &missing).is_err());

        assert!(!store.saved_model_root().join(".staging-200").exists());
        assert!(!store.saved_model_root().join("200").exists());
        assert_eq!(
            store.resolver().best_model_path().unwrap(),
            store.saved_model_root().join("100").join(MODEL_FILE_NAME)
        );
    }

    #[test]
    fn runs_lists_timestamped_directories_in_order() {
        let temp = tempdir().unwrap();
        let store = ArtifactStore::new(temp.path().join("artifact"), temp.path().join("saved"));
        assert!(store.runs().is_empty());

        for name in ["30", "4", "notes", ".staging-9"] {
            fs::create_dir_all(store.artifact_root().join(name)).unwrap();
        }
        fs::write(store.artifact_root().join("12"), b"file").unwrap();

        let stamps: Vec<u64> = store.runs().iter().map(|r| r.timestamp().value()).collect();
        assert_eq!(stamps, vec![4, 30]);
    }

    #[test]
    fn run_directory_paths_follow_stage_layout() {
        let run = RunDirectory {
            timestamp: Timestamp::new(7),
            path: PathBuf::from("artifact/7"),
        };
        assert_eq!(
            run.ingested_train_file(),
            PathBuf::from("artifact/7/data_ingestion/ingested/train.csv")
        );
        assert_eq!(
            run.drift_report_file(),
            PathBuf::from("artifact/7/data_validation/drift_report/report.yaml")
        );
        assert_eq!(
            run.pushed_model_file(),
            PathBuf::from("artifact/7/model_pusher/model.json")
        );
        assert_eq!(run.manifest_path(), PathBuf::from("artifact/7/run_manifest.yaml"));
    }
}
