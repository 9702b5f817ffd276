use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;

/// The fitting capability used by the training stage.
pub trait Learner: Send + Sync {
    fn name(&self) -> &'static str;
    fn fit(&self, features: &[Vec<f64>], labels: &[u8]) -> Result<Classifier>;
}

/// Linear decision function `sigmoid(w·x + b) >= threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classifier {
    pub weights: Vec<f64>,
    pub bias: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.5
}

impl Classifier {
    pub fn probability(&self, row: &[f64]) -> f64 {
        sigmoid(dot(&self.weights, row) + self.bias)
    }

    pub fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<u8>> {
        features
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                if row.len() != self.weights.len() {
                    bail!(
                        "Row {} has {} features but the classifier expects {}",
                        idx + 1,
                        row.len(),
                        self.weights.len()
                    );
                }
                Ok(u8::from(self.probability(row) >= self.threshold))
            })
            .collect()
    }
}

/// Full-batch gradient descent on the L2-regularised log loss.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl LogisticRegression {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            epochs: config.epochs,
            l2: config.l2,
        }
    }
}

impl Learner for LogisticRegression {
    fn name(&self) -> &'static str {
        "logistic_regression"
    }

    fn fit(&self, features: &[Vec<f64>], labels: &[u8]) -> Result<Classifier> {
        if features.is_empty() {
            bail!("Cannot fit a classifier without training rows");
        }
        if features.len() != labels.len() {
            bail!(
                "Feature rows ({}) and labels ({}) differ in length",
                features.len(),
                labels.len()
            );
        }
        let width = features[0].len();
        if features.iter().any(|row| row.len() != width) {
            bail!("Feature rows have inconsistent widths");
        }
        if features.iter().flatten().any(|v| !v.is_finite()) {
            bail!("Feature matrix contains non-finite values");
        }

        let n = features.len() as f64;
        let mut weights = vec![0.0; width];
        let mut bias = 0.0;
        let mut grad = vec![0.0; width];

        for _ in 0..self.epochs {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_bias = 0.0;
            for (row, &label) in features.iter().zip(labels) {
                let error = sigmoid(dot(&weights, row) + bias) - f64::from(label);
                for (g, x) in grad.iter_mut().zip(row) {
                    *g += error * x;
                }
                grad_bias += error;
            }
            for (w, g) in weights.iter_mut().zip(&grad) {
                *w -= self.learning_rate * (g / n + self.l2 * *w);
            }
            bias -= self.learning_rate * grad_bias / n;
        }

        if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() {
            bail!("Logistic regression diverged; lower the learning rate");
        }

        Ok(Classifier {
            weights,
            bias,
            threshold: default_threshold(),
        })
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
