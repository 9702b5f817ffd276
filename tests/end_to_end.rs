use std::fs;
use std::path::Path;
use std::sync::Arc;

use sensor_pipeline::config::{Config, TrainingConfig};
use sensor_pipeline::manifest::{RunOutcome, read_manifest};
use sensor_pipeline::pipeline::{PipelineOrchestrator, RunStatus};
use sensor_pipeline::run_state::RunState;
use sensor_pipeline::serving::Predictor;
use sensor_pipeline::stages::{StageKind, StageRegistry, register_defaults};
use sensor_pipeline::store::ArtifactStore;
use tempfile::tempdir;

const SCHEMA: &str = "\
target_column: class
columns:
  - { name: class, type: category }
  - { name: aa_000, type: float }
  - { name: ab_000, type: float }
  - { name: ac_000, type: float }
  - { name: ad_000, type: float }
numerical_columns: [aa_000, ab_000, ac_000, ad_000]
drop_columns: [ab_000]
";

/// Rows where `aa_000` alone separates the classes by a wide margin.
fn write_records(dir: &Path) {
    let mut csv = String::from("class,aa_000,ab_000,ac_000,ad_000\n");
    for i in 0..180u32 {
        let positive = i % 3 == 0;
        let aa = if positive { 1000 + i % 100 } else { i % 11 };
        let ac = if i % 13 == 0 {
            "na".to_string()
        } else {
            (i * 37 % 17).to_string()
        };
        csv.push_str(&format!(
            "{},{aa},{},{ac},{}\n",
            if positive { "pos" } else { "neg" },
            i % 4,
            i * 7 % 5
        ));
    }
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("sensors.csv"), csv).unwrap();
}

fn config(root: &Path) -> Config {
    write_records(&root.join("data"));
    let schema_file = root.join("schema.yaml");
    fs::write(&schema_file, SCHEMA).unwrap();

    Config {
        artifact_dir: root.join("artifact"),
        saved_model_dir: root.join("saved_models"),
        database_url: format!("file://{}/data/*.csv", root.display()),
        schema_file,
        training: TrainingConfig {
            learning_rate: 0.5,
            epochs: 500,
            ..TrainingConfig::default()
        },
        ..Config::default()
    }
}

fn orchestrator(config: &Config) -> PipelineOrchestrator {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry, config).unwrap();
    PipelineOrchestrator::new(
        registry,
        ArtifactStore::from_config(config),
        Arc::new(RunState::new()),
    )
    .unwrap()
}

#[test]
fn full_pipeline_trains_publishes_and_serves_a_model() {
    let temp = tempdir().unwrap();
    let config = config(temp.path());
    assert!(config.validate().is_ok(), "{:?}", config.validate().errors);
    let orchestrator = orchestrator(&config);

    let status = orchestrator.run().unwrap();
    let RunStatus::Completed(report) = status else {
        panic!("expected a completed run, got {status:?}");
    };

    let run = &report.run_dir;
    for file in [
        "data_ingestion/feature_store/sensor.csv",
        "data_ingestion/ingested/train.csv",
        "data_ingestion/ingested/test.csv",
        "data_validation/valid/train.csv",
        "data_validation/drift_report/report.yaml",
        "data_transformation/transformed/train.json",
        "data_transformation/transformed_object/preprocessing.json",
        "model_trainer/trained_model/model.json",
        "model_evaluation/report.yaml",
        "model_pusher/model.json",
        "run_manifest.yaml",
    ] {
        assert!(run.join(file).is_file(), "missing {file}");
    }
    let ingested = fs::read_to_string(run.join("data_ingestion/ingested/train.csv")).unwrap();
    assert!(!ingested.lines().next().unwrap().contains("ab_000"));

    let expected_model = config
        .saved_model_dir
        .join(report.timestamp.to_string())
        .join("model.json");
    assert_eq!(report.model_path, expected_model);
    let manifest = read_manifest(&run.join("run_manifest.yaml")).unwrap();
    assert_eq!(manifest.status, RunOutcome::Succeeded);
    assert_eq!(manifest.stages.len(), 6);
    assert_eq!(manifest.model.unwrap().sha256.len(), 64);

    let predictor = Predictor::new(ArtifactStore::from_config(&config).resolver());
    let scored = predictor
        .predict_csv(b"aa_000,ac_000,ad_000,note\n5,3,1,low\n1050,na,2,high\n")
        .unwrap();
    let scored = String::from_utf8(scored).unwrap();
    let lines: Vec<&str> = scored.lines().collect();
    assert_eq!(lines[0], "aa_000,ac_000,ad_000,note,prediction");
    assert!(lines[1].ends_with(",No"), "{scored}");
    assert!(lines[2].ends_with(",Yes"), "{scored}");
}

#[test]
fn rerun_without_improvement_is_rejected_and_keeps_the_current_model() {
    let temp = tempdir().unwrap();
    let config = config(temp.path());
    let orchestrator = orchestrator(&config);

    let RunStatus::Completed(first) = orchestrator.run().unwrap() else {
        panic!("first run should complete");
    };

    let err = orchestrator.run().unwrap_err();
    assert_eq!(err.failed_stage(), Some(StageKind::Push));
    assert!(err.to_string().contains("not accepted"), "{err}");

    let resolver = ArtifactStore::from_config(&config).resolver();
    assert_eq!(resolver.versions().len(), 1);
    assert_eq!(resolver.best_model_path().unwrap(), first.model_path);
    assert!(!orchestrator.is_running());
}

#[test]
fn missing_record_source_fails_ingestion() {
    let temp = tempdir().unwrap();
    let mut config = config(temp.path());
    config.database_url = format!("file://{}/nowhere/*.csv", temp.path().display());
    let orchestrator = orchestrator(&config);

    let err = orchestrator.run().unwrap_err();
    assert_eq!(err.failed_stage(), Some(StageKind::Ingestion));
    assert!(!ArtifactStore::from_config(&config).resolver().is_model_available());
}

#[test]
fn unsupported_connection_scheme_fails_ingestion() {
    let temp = tempdir().unwrap();
    let mut config = config(temp.path());
    config.database_url = "mongodb+srv://cluster0.example.net/sensor".into();
    let orchestrator = orchestrator(&config);

    let err = orchestrator.run().unwrap_err();
    assert_eq!(err.failed_stage(), Some(StageKind::Ingestion));
    assert!(format!("{err}").contains("Unsupported record source scheme"), "{err}");
}

const NOISE_COLUMNS: usize = 40;

/// One separating column next to many columns whose values do not depend on
/// the class, so every train/test difference in them is sampling noise.
fn write_wide_inputs(root: &Path) -> Config {
    let noise: Vec<String> = (0..NOISE_COLUMNS).map(|c| format!("n_{c:03}")).collect();
    let mut schema = String::from("columns:\n  - { name: class, type: category }\n  - { name: aa_000, type: float }\n");
    for name in &noise {
        schema.push_str(&format!("  - {{ name: {name}, type: float }}\n"));
    }
    schema.push_str(&format!("numerical_columns: [aa_000, {}]\n", noise.join(", ")));
    let schema_file = root.join("schema.yaml");
    fs::write(&schema_file, schema).unwrap();

    let mut csv = format!("class,aa_000,{}\n", noise.join(","));
    for i in 0..600u64 {
        let positive = i % 4 == 0;
        let aa = if positive { 2000 + i % 50 } else { i % 20 };
        let cells: Vec<String> = (0..NOISE_COLUMNS as u64)
            .map(|c| ((i * 7919 + c * 104_729 + i * c * 31) % 1000).to_string())
            .collect();
        csv.push_str(&format!(
            "{},{aa},{}\n",
            if positive { "pos" } else { "neg" },
            cells.join(",")
        ));
    }
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("data/sensors.csv"), csv).unwrap();

    Config {
        artifact_dir: root.join("artifact"),
        saved_model_dir: root.join("saved_models"),
        database_url: format!("file://{}/data/*.csv", root.display()),
        schema_file,
        training: TrainingConfig {
            learning_rate: 0.5,
            epochs: 500,
            ..TrainingConfig::default()
        },
        ..Config::default()
    }
}

#[test]
fn wide_schema_trains_at_the_default_drift_threshold() {
    let temp = tempdir().unwrap();
    let config = write_wide_inputs(temp.path());
    assert_eq!(config.validation.drift_threshold, 0.05);
    let orchestrator = orchestrator(&config);

    let status = orchestrator.run().unwrap();
    let RunStatus::Completed(report) = status else {
        panic!("expected a completed run, got {status:?}");
    };
    assert!(report.model_path.is_file());

    let drift = fs::read_to_string(report.run_dir.join("data_validation/drift_report/report.yaml"))
        .unwrap();
    assert!(drift.contains("corrected_threshold"));
    assert!(drift.contains("n_039"));
}
