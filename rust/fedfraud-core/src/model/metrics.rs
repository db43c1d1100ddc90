//! Training metrics: binary accuracy, area under the precision-recall curve and loss.

use std::cmp::Ordering;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// The probability above which a training prediction counts as fraud.
pub const ACCURACY_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
/// The metrics of one round over the aggregate client work.
pub struct RoundMetrics {
    pub accuracy: f64,
    pub pr_auc: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, Default)]
/// Collects per-batch results of any number of clients.
pub struct MetricAccumulator {
    examples: u64,
    correct: u64,
    weighted_loss: f64,
    scores: Vec<(f32, bool)>,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the predictions and the mean loss of one batch.
    pub fn record_batch(&mut self, probabilities: ArrayView1<f32>, labels: ArrayView1<f32>, loss: f32) {
        let rows = probabilities.len() as u64;
        self.examples += rows;
        self.weighted_loss += f64::from(loss) * rows as f64;
        for (&p, &y) in probabilities.iter().zip(labels.iter()) {
            let positive = y >= 0.5;
            if (p > ACCURACY_THRESHOLD) == positive {
                self.correct += 1;
            }
            self.scores.push((p, positive));
        }
    }

    /// Merges the results of another accumulator into this one.
    pub fn merge(&mut self, other: MetricAccumulator) {
        self.examples += other.examples;
        self.correct += other.correct;
        self.weighted_loss += other.weighted_loss;
        self.scores.extend(other.scores);
    }

    pub fn examples(&self) -> u64 {
        self.examples
    }

    /// Computes the metrics of everything recorded so far.
    pub fn finish(&self) -> RoundMetrics {
        if self.examples == 0 {
            return RoundMetrics::default();
        }
        RoundMetrics {
            accuracy: self.correct as f64 / self.examples as f64,
            pr_auc: pr_auc(&self.scores),
            loss: self.weighted_loss / self.examples as f64,
        }
    }
}

/// Computes the area under the precision-recall curve as the recall-weighted sum of precisions
/// (average precision). Tied scores are treated as one operating point.
///
/// Returns `0` if there are no positive examples.
pub fn pr_auc(scores: &[(f32, bool)]) -> f64 {
    let positives = scores.iter().filter(|(_, positive)| *positive).count();
    if positives == 0 {
        return 0.0;
    }

    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut area = 0.0;
    let mut true_positives = 0_usize;
    let mut seen = 0_usize;
    let mut previous_recall = 0.0;
    let mut index = 0;
    while index < sorted.len() {
        let score = sorted[index].0;
        while index < sorted.len() && sorted[index].0 == score {
            if sorted[index].1 {
                true_positives += 1;
            }
            seen += 1;
            index += 1;
        }
        let recall = true_positives as f64 / positives as f64;
        let precision = true_positives as f64 / seen as f64;
        area += (recall - previous_recall) * precision;
        previous_recall = recall;
    }
    area
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_pr_auc_perfect_and_degenerate() {
        let perfect = [(0.9, true), (0.8, true), (0.2, false), (0.1, false)];
        assert!((pr_auc(&perfect) - 1.0).abs() < 1e-12);

        let no_positives = [(0.9, false), (0.1, false)];
        assert_eq!(pr_auc(&no_positives), 0.0);

        // a single tie group degenerates to the positive rate
        let tied = [(0.5, true), (0.5, false), (0.5, false), (0.5, false)];
        assert!((pr_auc(&tied) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_pr_auc_mixed_ranking() {
        // ranks: +, -, +, -  => 1/2 * 1 + 1/2 * 2/3
        let scores = [(0.9, true), (0.7, false), (0.6, true), (0.1, false)];
        assert!((pr_auc(&scores) - (0.5 + 1.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_accumulator_weights_by_examples() {
        let mut first = MetricAccumulator::new();
        first.record_batch(array![0.9_f32, 0.2].view(), array![1.0_f32, 0.0].view(), 0.2);
        let mut second = MetricAccumulator::new();
        second.record_batch(
            array![0.6_f32, 0.7, 0.1, 0.4].view(),
            array![0.0_f32, 1.0, 0.0, 1.0].view(),
            0.5,
        );

        first.merge(second);
        let metrics = first.finish();

        assert_eq!(first.examples(), 6);
        assert!((metrics.accuracy - 4.0 / 6.0).abs() < 1e-12);
        assert!((metrics.loss - (0.2 * 2.0 + 0.5 * 4.0) / 6.0).abs() < 1e-6);
        assert!(metrics.pr_auc > 0.0 && metrics.pr_auc <= 1.0);
        assert_eq!(MetricAccumulator::new().finish(), RoundMetrics::default());
    }
}
