use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Constant imputation followed by robust scaling (centre on the median,
/// divide by the interquartile range).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    pub fill_value: f64,
    pub centers: Vec<f64>,
    pub scales: Vec<f64>,
}

impl Preprocessor {
    pub fn fit(features: &[Vec<f64>], fill_value: f64) -> Result<Self> {
        let Some(first) = features.first() else {
            bail!("Cannot fit preprocessor on an empty feature matrix");
        };
        let width = first.len();
        if features.iter().any(|row| row.len() != width) {
            bail!("Feature rows have inconsistent widths");
        }

        let mut centers = Vec::with_capacity(width);
        let mut scales = Vec::with_capacity(width);
        for col in 0..width {
            let mut values: Vec<f64> = features
                .iter()
                .map(|row| impute(row[col], fill_value))
                .collect();
            values.sort_by(f64::total_cmp);
            let median = quantile(&values, 0.5);
            let iqr = quantile(&values, 0.75) - quantile(&values, 0.25);
            centers.push(median);
            scales.push(if iqr.abs() > f64::EPSILON { iqr } else { 1.0 });
        }

        Ok(Self {
            fill_value,
            centers,
            scales,
        })
    }

    pub fn width(&self) -> usize {
        self.centers.len()
    }

    pub fn transform(&self, features: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        features
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                if row.len() != self.width() {
                    bail!(
                        "Row {} has {} features but the preprocessor expects {}",
                        idx + 1,
                        row.len(),
                        self.width()
                    );
                }
                Ok(row
                    .iter()
                    .zip(self.centers.iter().zip(&self.scales))
                    .map(|(&value, (&center, &scale))| {
                        (impute(value, self.fill_value) - center) / scale
                    })
                    .collect())
            })
            .collect()
    }
}

fn impute(value: f64, fill_value: f64) -> f64 {
    if value.is_finite() { value } else { fill_value }
}

/// Linear-interpolated quantile of an already sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let pos = q * (len - 1) as f64;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let frac = pos - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_interpolate_like_numpy() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&values, 0.5), 2.5);
        assert_eq!(quantile(&values, 0.25), 1.75);
        assert_eq!(quantile(&values, 0.75), 3.25);
    }

    #[test]
    fn fit_imputes_before_computing_statistics() {
        let features = vec![
            vec![1.0, f64::NAN],
            vec![2.0, 4.0],
            vec![3.0, 4.0],
            vec![4.0, 4.0],
            vec![5.0, f64::NAN],
        ];
        let pre = Preprocessor::fit(&features, 0.0).unwrap();
        assert_eq!(pre.centers, vec![3.0, 4.0]);
        assert_eq!(pre.scales[0], 2.0);
        // Column two becomes [0, 4, 4, 4, 0]: IQR of 4.
        assert_eq!(pre.scales[1], 4.0);

        let out = pre.transform(&[vec![f64::NAN, 8.0]]).unwrap();
        assert_eq!(out, vec![vec![-1.5, 1.0]]);
    }

    #[test]
    fn constant_columns_keep_unit_scale() {
        let features = vec![vec![7.0], vec![7.0], vec![7.0]];
        let pre = Preprocessor::fit(&features, 0.0).unwrap();
        assert_eq!(pre.scales, vec![1.0]);
        assert_eq!(pre.transform(&[vec![9.0]]).unwrap(), vec![vec![2.0]]);
    }

    #[test]
    fn rejects_empty_and_mismatched_input() {
        assert!(Preprocessor::fit(&[], 0.0).is_err());
        let pre = Preprocessor::fit(&[vec![1.0, 2.0]], 0.0).unwrap();
        assert!(pre.transform(&[vec![1.0]]).is_err());
    }
}
