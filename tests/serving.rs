use std::path::Path;

use chrono::Utc;
use sensor_pipeline::error::ServeError;
use sensor_pipeline::model::{Classifier, Preprocessor, SensorModel};
use sensor_pipeline::resolver::ModelResolver;
use sensor_pipeline::serving::Predictor;
use sensor_pipeline::store::MODEL_FILE_NAME;
use tempfile::tempdir;

/// Predicts positive when `aa_000 > 10`.
fn save_threshold_model(root: &Path, version: &str) {
    let model = SensorModel {
        feature_columns: vec!["aa_000".into()],
        preprocessor: Preprocessor {
            fill_value: 0.0,
            centers: vec![10.0],
            scales: vec![1.0],
        },
        classifier: Classifier {
            weights: vec![4.0],
            bias: 0.0,
            threshold: 0.5,
        },
        learner: "fixed".into(),
        trained_at: Utc::now(),
    };
    model.save(&root.join(version).join(MODEL_FILE_NAME)).unwrap();
}

#[test]
fn zero_row_upload_is_bad_input() {
    let temp = tempdir().unwrap();
    save_threshold_model(temp.path(), "100");
    let predictor = Predictor::new(ModelResolver::new(temp.path()));

    let err = predictor.predict_csv(b"aa_000,ab_000\n").unwrap_err();
    assert!(matches!(err, ServeError::BadInput(_)));
    assert_eq!(err.status_code(), 400);
}

#[test]
fn no_model_is_not_found() {
    let temp = tempdir().unwrap();
    let predictor = Predictor::new(ModelResolver::new(temp.path()));

    let err = predictor.predict_csv(b"aa_000\n1\n").unwrap_err();
    assert!(matches!(err, ServeError::ModelNotAvailable));
    assert_eq!(err.status_code(), 404);
    assert_eq!(err.to_string(), "Model is not available");
}

#[test]
fn upload_missing_a_feature_column_is_bad_input() {
    let temp = tempdir().unwrap();
    save_threshold_model(temp.path(), "100");
    let predictor = Predictor::new(ModelResolver::new(temp.path()));

    let err = predictor.predict_csv(b"zz_999\n1\n").unwrap_err();
    assert!(matches!(err, ServeError::BadInput(ref msg) if msg.contains("aa_000")));
}

#[test]
fn corrupt_model_file_is_an_internal_error() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("100");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(MODEL_FILE_NAME), b"not json").unwrap();
    let predictor = Predictor::new(ModelResolver::new(temp.path()));

    let err = predictor.predict_csv(b"aa_000\n1\n").unwrap_err();
    assert!(matches!(err, ServeError::Internal(_)));
    assert_eq!(err.status_code(), 500);
}

#[test]
fn predictions_are_appended_as_yes_no_column() {
    let temp = tempdir().unwrap();
    save_threshold_model(temp.path(), "100");
    let predictor = Predictor::new(ModelResolver::new(temp.path()));

    let out = predictor
        .predict_csv(b"id,aa_000\nr1,50\nr2,2\nr3,na\n")
        .unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "id,aa_000,prediction\nr1,50,Yes\nr2,2,No\nr3,na,No\n"
    );
}

#[test]
fn newest_model_is_used_for_each_request() {
    let temp = tempdir().unwrap();
    let predictor = Predictor::new(ModelResolver::new(temp.path()));
    save_threshold_model(temp.path(), "100");
    assert!(predictor.predict_csv(b"aa_000\n50\n").is_ok());

    let newer = temp.path().join("200");
    std::fs::create_dir_all(&newer).unwrap();
    std::fs::write(newer.join(MODEL_FILE_NAME), b"broken").unwrap();
    let err = predictor.predict_csv(b"aa_000\n50\n").unwrap_err();
    assert!(matches!(err, ServeError::Internal(_)));
}

#[test]
fn non_numeric_feature_cell_is_bad_input() {
    let temp = tempdir().unwrap();
    save_threshold_model(temp.path(), "100");
    let predictor = Predictor::new(ModelResolver::new(temp.path()));

    let err = predictor
        .predict_csv(b"id,aa_000\nr1,50\nr2,abc\n")
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    let message = err.to_string();
    assert!(message.contains("aa_000") && message.contains("row 2"), "{message}");
}
