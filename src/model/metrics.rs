use serde::{Deserialize, Serialize};

/// Binary classification scores for the positive class (label `1`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub f1_score: f64,
    pub precision_score: f64,
    pub recall_score: f64,
    pub accuracy: f64,
}

impl ClassificationMetrics {
    /// Undefined ratios (no predicted or no actual positives) score as zero.
    pub fn score(y_true: &[u8], y_pred: &[u8]) -> Self {
        let (mut tp, mut fp, mut fneg, mut correct) = (0usize, 0usize, 0usize, 0usize);
        for (&truth, &pred) in y_true.iter().zip(y_pred) {
            match (truth == 1, pred == 1) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fneg += 1,
                (false, false) => {}
            }
            if truth == pred {
                correct += 1;
            }
        }

        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fneg);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let total = y_true.len().min(y_pred.len());

        Self {
            f1_score: f1,
            precision_score: precision,
            recall_score: recall,
            accuracy: ratio(correct, total),
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_mixed_predictions() {
        let truth = [1, 1, 1, 0, 0, 0];
        let pred = [1, 1, 0, 1, 0, 0];
        let m = ClassificationMetrics::score(&truth, &pred);
        assert!((m.precision_score - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.recall_score - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.f1_score - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.accuracy - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn no_positive_predictions_scores_zero() {
        let m = ClassificationMetrics::score(&[1, 0], &[0, 0]);
        assert_eq!(m.precision_score, 0.0);
        assert_eq!(m.recall_score, 0.0);
        assert_eq!(m.f1_score, 0.0);
        assert_eq!(m.accuracy, 0.5);
    }
}
