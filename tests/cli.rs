use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::tempdir;

const SCHEMA: &str = "\
columns:
  - { name: class, type: category }
  - { name: aa_000, type: float }
numerical_columns: [aa_000]
";

const MODEL: &str = r#"{
  "feature_columns": ["aa_000"],
  "preprocessor": { "fill_value": 0.0, "centers": [0.0], "scales": [1.0] },
  "classifier": { "weights": [1.0], "bias": -5.0, "threshold": 0.5 },
  "learner": "fixed",
  "trained_at": "2024-01-01T00:00:00Z"
}"#;

fn write_config(root: &Path, extra: &str) -> PathBuf {
    fs::write(root.join("schema.yaml"), SCHEMA).unwrap();
    let config = format!(
        "version: 1\n\
         artifact_dir: {root}/artifact\n\
         saved_model_dir: {root}/saved_models\n\
         database_url: \"file://{root}/data/*.csv\"\n\
         schema_file: {root}/schema.yaml\n\
         {extra}",
        root = root.display()
    );
    let path = root.join("pipeline.yaml");
    fs::write(&path, config).unwrap();
    path
}

fn commit_model(root: &Path, version: &str) {
    let dir = root.join("saved_models").join(version);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("model.json"), MODEL).unwrap();
}

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("sensor-pipeline").expect("binary present");
    cmd.env("RUST_LOG", "warn")
        .env_remove("SENSOR_DATABASE_URL")
        .env_remove("SENSOR_ARTIFACT_DIR")
        .env_remove("SENSOR_SAVED_MODEL_DIR");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

#[test]
fn check_accepts_a_valid_config() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "");

    let out = stdout_of(cli().arg("check").arg("--config").arg(&config));
    assert!(out.contains("Configuration OK"));
}

#[test]
fn check_rejects_out_of_range_settings() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "ingestion:\n  test_split_ratio: 1.5\n");

    cli()
        .arg("check")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure();
}

#[test]
fn explicit_missing_config_is_an_error() {
    let temp = tempdir().unwrap();
    cli()
        .args(["models", "list", "--config"])
        .arg(temp.path().join("absent.yaml"))
        .assert()
        .failure();
}

#[test]
fn models_list_and_current() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "");

    let out = stdout_of(cli().args(["models", "list", "--config"]).arg(&config));
    assert!(out.starts_with("No models under"));
    cli()
        .args(["models", "current", "--config"])
        .arg(&config)
        .assert()
        .failure();

    commit_model(temp.path(), "100");
    commit_model(temp.path(), "300");
    fs::create_dir_all(temp.path().join("saved_models/abc")).unwrap();

    let out = stdout_of(cli().args(["models", "list", "--config"]).arg(&config));
    let stamps: Vec<&str> = out
        .lines()
        .map(|line| line.split('\t').next().unwrap())
        .collect();
    assert_eq!(stamps, vec!["100", "300"]);

    let out = stdout_of(cli().args(["models", "current", "--config"]).arg(&config));
    assert!(out.trim().ends_with("saved_models/300/model.json"), "{out}");

    let out = stdout_of(
        cli()
            .args(["models", "list", "--json", "--config"])
            .arg(&config),
    );
    let versions: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(versions.as_array().unwrap().len(), 2);
    assert_eq!(versions[1]["timestamp"], 300);
}

#[test]
fn predict_writes_scored_csv() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "");
    commit_model(temp.path(), "100");
    let input = temp.path().join("upload.csv");
    fs::write(&input, "aa_000\n9\n2\n").unwrap();
    let output = temp.path().join("out/predictions.csv");

    cli()
        .arg("predict")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "aa_000,prediction\n9,Yes\n2,No\n"
    );
}

#[test]
fn predict_without_model_fails() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "");
    let input = temp.path().join("upload.csv");
    fs::write(&input, "aa_000\n9\n").unwrap();

    cli()
        .arg("predict")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .assert()
        .failure();
}

#[test]
fn failed_train_is_recorded_in_runs_list() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "");

    cli()
        .arg("train")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure();

    let out = stdout_of(cli().args(["runs", "list", "--config"]).arg(&config));
    let line = out.lines().next().unwrap();
    assert!(line.contains("\tfailed: ingestion stage failed"), "{out}");
}

#[test]
fn environment_overrides_the_saved_model_dir() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path(), "");
    let other = temp.path().join("elsewhere");
    fs::create_dir_all(other.join("500")).unwrap();
    fs::write(other.join("500/model.json"), MODEL).unwrap();

    let out = stdout_of(
        cli()
            .env("SENSOR_SAVED_MODEL_DIR", &other)
            .args(["models", "current", "--config"])
            .arg(&config),
    );
    assert!(out.trim().ends_with("elsewhere/500/model.json"), "{out}");
}

#[test]
fn completions_are_generated() {
    let out = stdout_of(cli().args(["completions", "bash"]));
    assert!(out.contains("sensor-pipeline"));
}
