use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Schema, ValidationConfig};
use crate::dataset::Dataset;
use crate::error::StageError;
use crate::stages::{
    RunContext, Stage, StageArtifact, StageInput, StageKind, ValidationArtifact, unexpected,
};
use crate::store::ensure_parent;

/// Checks the split against the schema and tests numerical columns for drift.
pub struct ValidationStage {
    schema: Arc<Schema>,
    config: ValidationConfig,
}

impl ValidationStage {
    pub fn new(schema: Arc<Schema>, config: ValidationConfig) -> Self {
        Self { schema, config }
    }

    fn check_shape(&self, label: &str, data: &Dataset, errors: &mut Vec<String>) {
        let expected: BTreeSet<&str> = self.schema.expected_columns().into_iter().collect();
        let actual: BTreeSet<&str> = data.headers().iter().map(String::as_str).collect();

        let missing: Vec<&str> = expected.difference(&actual).copied().collect();
        if !missing.is_empty() {
            errors.push(format!(
                "{label} set is missing columns: {}",
                missing.join(", ")
            ));
        }
        let extra: Vec<&str> = actual.difference(&expected).copied().collect();
        if !extra.is_empty() {
            errors.push(format!(
                "{label} set has unexpected columns: {}",
                extra.join(", ")
            ));
        }
        if let Some(targets) = data.column(&self.schema.target_column) {
            let unknown: BTreeSet<&str> = targets
                .into_iter()
                .filter(|value| self.schema.encode_label(value).is_none())
                .collect();
            if !unknown.is_empty() {
                let shown: Vec<&str> = unknown.iter().take(5).copied().collect();
                errors.push(format!(
                    "{label} set has unmapped target values: {}",
                    shown.join(", ")
                ));
            }
        }
    }

    /// Per-column KS tests. A column drifts when its p-value falls below the
    /// Bonferroni-corrected threshold `drift_threshold / tested columns`.
    fn detect_drift(&self, base: &Dataset, current: &Dataset) -> DriftReport {
        let expected: BTreeSet<&str> = self.schema.expected_columns().into_iter().collect();
        let mut tests = Vec::new();

        for name in &self.schema.numerical_columns {
            if !expected.contains(name.as_str()) {
                continue;
            }
            let (Some(base_values), Some(current_values)) =
                (base.numeric_column(name), current.numeric_column(name))
            else {
                continue;
            };
            let base_values: Vec<f64> = base_values.into_iter().filter(|v| v.is_finite()).collect();
            let current_values: Vec<f64> =
                current_values.into_iter().filter(|v| v.is_finite()).collect();

            let Some(test) = ks_two_sample(&base_values, &current_values) else {
                warn!(column = %name, "Skipping drift test for column without values");
                continue;
            };
            tests.push((name.clone(), test));
        }

        let threshold = self.config.drift_threshold;
        let corrected_threshold = threshold / tests.len().max(1) as f64;
        let columns = tests
            .into_iter()
            .map(|(name, test)| {
                let drift = ColumnDrift {
                    statistic: test.statistic,
                    p_value: test.p_value,
                    drift_status: test.p_value < corrected_threshold,
                };
                (name, drift)
            })
            .collect();

        DriftReport {
            threshold,
            corrected_threshold,
            columns,
        }
    }
}

impl Stage for ValidationStage {
    fn kind(&self) -> StageKind {
        StageKind::Validation
    }

    fn run(&self, input: StageInput, ctx: &RunContext) -> Result<StageArtifact, StageError> {
        let StageArtifact::Ingestion(ingested) = input.into_artifact(self.kind())? else {
            return Err(unexpected(self.kind(), "ingestion artifact"));
        };

        let train = Dataset::read_csv(&ingested.train_file)?;
        let test = Dataset::read_csv(&ingested.test_file)?;

        let mut errors = Vec::new();
        self.check_shape("Train", &train, &mut errors);
        self.check_shape("Test", &test, &mut errors);
        if !errors.is_empty() {
            return Err(StageError::precondition(errors.join("; ")));
        }

        let run = ctx.run();
        let report = self.detect_drift(&train, &test);
        let drift_report_file = run.drift_report_file();
        report.write(&drift_report_file)?;

        let drifted_columns = report.drifted_columns();
        if drifted_columns.is_empty() {
            info!(
                columns = report.columns.len(),
                "No drift detected between train and test sets"
            );
        } else {
            warn!(
                drifted = %drifted_columns.join(", "),
                "Drift detected between train and test sets"
            );
        }

        let valid_train_file = run.valid_train_file();
        let valid_test_file = run.valid_test_file();
        copy_file(&ingested.train_file, &valid_train_file)?;
        copy_file(&ingested.test_file, &valid_test_file)?;

        Ok(StageArtifact::Validation(ValidationArtifact {
            validation_status: drifted_columns.is_empty(),
            valid_train_file,
            valid_test_file,
            drift_report_file,
            drifted_columns,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub threshold: f64,
    pub corrected_threshold: f64,
    pub columns: BTreeMap<String, ColumnDrift>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDrift {
    pub statistic: f64,
    pub p_value: f64,
    pub drift_status: bool,
}

impl DriftReport {
    pub fn drifted_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|(_, drift)| drift.drift_status)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        ensure_parent(path)?;
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write drift report: {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsTest {
    pub statistic: f64,
    pub p_value: f64,
}

/// Two-sample Kolmogorov-Smirnov test with the asymptotic p-value.
/// Returns `None` when either sample is empty.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> Option<KsTest> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut statistic: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        statistic = statistic.max((i as f64 / n1 - j as f64 / n2).abs());
    }

    let en = (n1 * n2 / (n1 + n2)).sqrt();
    let p_value = kolmogorov_survival((en + 0.12 + 0.11 / en) * statistic);
    Some(KsTest { statistic, p_value })
}

/// Q_KS(λ) = 2 Σ (-1)^(j-1) exp(-2 j² λ²); reported as 1 when the series
/// does not converge, which only happens for tiny λ.
fn kolmogorov_survival(lambda: f64) -> f64 {
    let a2 = -2.0 * lambda * lambda;
    let mut sign = 2.0;
    let mut sum = 0.0;
    let mut previous: f64 = 0.0;
    for j in 1..=100 {
        let j = j as f64;
        let term = sign * (a2 * j * j).exp();
        sum += term;
        if term.abs() <= 0.001 * previous || term.abs() <= 1e-8 * sum {
            return sum.clamp(0.0, 1.0);
        }
        sign = -sign;
        previous = term.abs();
    }
    1.0
}

fn copy_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    ensure_parent(to)?;
    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnSpec;

    fn schema() -> Schema {
        Schema {
            target_column: "class".into(),
            columns: ["class", "aa_000", "ab_000", "br_000"]
                .iter()
                .map(|name| ColumnSpec {
                    name: name.to_string(),
                    kind: "float".into(),
                })
                .collect(),
            numerical_columns: vec!["aa_000".into(), "ab_000".into(), "br_000".into()],
            drop_columns: vec!["br_000".into()],
            target_mapping: [("neg".to_string(), 0), ("pos".to_string(), 1)]
                .into_iter()
                .collect(),
        }
    }

    fn stage() -> ValidationStage {
        ValidationStage::new(Arc::new(schema()), ValidationConfig::default())
    }

    #[test]
    fn identical_samples_do_not_drift() {
        let sample: Vec<f64> = (0..50).map(f64::from).collect();
        let test = ks_two_sample(&sample, &sample).unwrap();
        assert_eq!(test.statistic, 0.0);
        assert_eq!(test.p_value, 1.0);
    }

    #[test]
    fn disjoint_samples_drift() {
        let a: Vec<f64> = (0..50).map(f64::from).collect();
        let b: Vec<f64> = (100..150).map(f64::from).collect();
        let test = ks_two_sample(&a, &b).unwrap();
        assert_eq!(test.statistic, 1.0);
        assert!(test.p_value < 1e-6, "p = {}", test.p_value);
    }

    #[test]
    fn statistic_handles_ties() {
        let test = ks_two_sample(&[1.0, 1.0, 2.0, 2.0], &[1.0, 2.0]).unwrap();
        assert_eq!(test.statistic, 0.0);
        assert!(ks_two_sample(&[], &[1.0]).is_none());
    }

    #[test]
    fn shape_check_aggregates_every_violation() {
        let data =
            Dataset::from_csv_str("class,aa_000,extra\nneg,1,x\nmaybe,2,y\n").unwrap();
        let mut errors = Vec::new();
        stage().check_shape("Train", &data, &mut errors);

        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors[0].contains("missing columns: ab_000"));
        assert!(errors[1].contains("unexpected columns: extra"));
        assert!(errors[2].contains("unmapped target values: maybe"));
    }

    #[test]
    fn drift_report_skips_dropped_columns() {
        let base = Dataset::from_csv_str("class,aa_000,ab_000\nneg,1,5\npos,2,6\nneg,3,7\n")
            .unwrap();
        let current =
            Dataset::from_csv_str("class,aa_000,ab_000\nneg,1,500\npos,2,600\nneg,3,700\n")
                .unwrap();
        let report = stage().detect_drift(&base, &current);
        assert_eq!(report.columns.len(), 2);
        assert!(!report.columns["aa_000"].drift_status);
        assert_eq!(report.columns["ab_000"].statistic, 1.0);
        assert_eq!(report.corrected_threshold, report.threshold / 2.0);
    }

    fn wide_stage(noise_columns: usize) -> (ValidationStage, Vec<String>) {
        let mut names = vec!["shift".to_string()];
        names.extend((0..noise_columns).map(|i| format!("n_{i:03}")));
        let schema = Schema {
            target_column: "class".into(),
            columns: std::iter::once("class".to_string())
                .chain(names.iter().cloned())
                .map(|name| ColumnSpec {
                    name,
                    kind: "float".into(),
                })
                .collect(),
            numerical_columns: names.clone(),
            drop_columns: Vec::new(),
            target_mapping: [("neg".to_string(), 0), ("pos".to_string(), 1)]
                .into_iter()
                .collect(),
        };
        (
            ValidationStage::new(Arc::new(schema), ValidationConfig::default()),
            names,
        )
    }

    fn noisy_split(names: &[String], rows: usize, offset: f64, seed: u64) -> Dataset {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let mut headers = vec!["class".to_string()];
        headers.extend(names.iter().cloned());
        let data = (0..rows)
            .map(|_| {
                let mut row = vec!["neg".to_string()];
                row.push((rng.gen_range(0.0..1.0) + offset).to_string());
                row.extend((1..names.len()).map(|_| rng.gen_range(0.0..1.0).to_string()));
                row
            })
            .collect();
        Dataset::new(headers, data).unwrap()
    }

    fn two_column_split(ab_offset: usize) -> Dataset {
        let rows = (0..50)
            .map(|i| vec!["neg".to_string(), i.to_string(), (i + ab_offset).to_string()])
            .collect();
        Dataset::new(vec!["class".into(), "aa_000".into(), "ab_000".into()], rows).unwrap()
    }

    #[test]
    fn drift_decision_is_corrected_for_the_number_of_columns() {
        let report = stage().detect_drift(&two_column_split(0), &two_column_split(14));
        let ab = &report.columns["ab_000"];

        // Significant on its own, but not once two columns are tested.
        assert!(ab.p_value < report.threshold, "p = {}", ab.p_value);
        assert!(ab.p_value > report.corrected_threshold, "p = {}", ab.p_value);
        assert!(!ab.drift_status);
        assert!(report.drifted_columns().is_empty());
    }

    #[test]
    fn shifted_column_still_drifts_among_many() {
        let (stage, names) = wide_stage(60);
        let train = noisy_split(&names, 480, 0.0, 1);
        let test = noisy_split(&names, 120, 5.0, 2);

        let report = stage.detect_drift(&train, &test);
        assert!(report.columns["shift"].drift_status);
        assert!(report.columns["shift"].p_value < report.corrected_threshold);
    }
}
