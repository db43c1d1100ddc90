//! Selection of the decision threshold from held-out predictions.
//!
//! Two estimates are combined: the threshold maximizing F1 on the precision-recall curve and the
//! threshold maximizing Youden's J on the ROC curve. The calibrated threshold is their midpoint.
//! A prediction is positive if its probability is at least the threshold.

use std::cmp::Ordering;

/// The threshold used if an estimate cannot be computed.
pub const NEUTRAL_THRESHOLD: f64 = 0.5;

const F1_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
/// How the decision threshold of an evaluation is chosen.
pub enum ThresholdMode {
    /// Calibrate on the evaluated cases.
    Auto,
    /// Use a fixed threshold.
    Manual(f64),
}

impl ThresholdMode {
    /// Resolves the threshold for the given predictions.
    pub fn resolve(&self, probabilities: &[f32], labels: &[f32]) -> f64 {
        match self {
            ThresholdMode::Auto => calibrate(probabilities, labels),
            ThresholdMode::Manual(threshold) => *threshold,
        }
    }
}

/// Computes the calibrated threshold, clamped to `[0, 1]`.
///
/// Each estimate that is undefined for the given labels falls back to [`NEUTRAL_THRESHOLD`], so
/// a single-class batch never fails.
pub fn calibrate(probabilities: &[f32], labels: &[f32]) -> f64 {
    let curve = OperatingPoints::new(probabilities, labels);
    let pr = curve.best_f1().unwrap_or(NEUTRAL_THRESHOLD);
    let roc = curve.best_youden().unwrap_or(NEUTRAL_THRESHOLD);
    ((pr + roc) / 2.0).clamp(0.0, 1.0)
}

/// Computes the threshold maximizing F1. Undefined without positive labels.
pub fn pr_threshold(probabilities: &[f32], labels: &[f32]) -> Option<f64> {
    OperatingPoints::new(probabilities, labels).best_f1()
}

/// Computes the threshold maximizing the true positive rate minus the false positive rate.
/// Undefined unless both classes are present.
pub fn roc_threshold(probabilities: &[f32], labels: &[f32]) -> Option<f64> {
    OperatingPoints::new(probabilities, labels).best_youden()
}

#[derive(Debug, Clone, Copy)]
struct OperatingPoint {
    threshold: f64,
    true_positives: usize,
    false_positives: usize,
}

/// The confusion counts at every candidate threshold in ascending order.
///
/// The candidates are the lowest distinct score and the midpoints between adjacent distinct
/// scores, so every candidate separates the scores at a distinct value.
struct OperatingPoints {
    points: Vec<OperatingPoint>,
    positives: usize,
    negatives: usize,
}

impl OperatingPoints {
    fn new(probabilities: &[f32], labels: &[f32]) -> Self {
        let mut scores: Vec<(f64, bool)> = probabilities
            .iter()
            .zip(labels)
            .filter(|(p, _)| p.is_finite())
            .map(|(&p, &y)| (f64::from(p), y >= 0.5))
            .collect();
        scores.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        let positives = scores.iter().filter(|(_, positive)| *positive).count();
        let negatives = scores.len() - positives;

        // walk the distinct scores downwards, counting everything at or above each score
        let mut groups = Vec::new();
        let (mut true_positives, mut false_positives) = (0, 0);
        let mut index = 0;
        while index < scores.len() {
            let score = scores[index].0;
            while index < scores.len() && scores[index].0 == score {
                if scores[index].1 {
                    true_positives += 1;
                } else {
                    false_positives += 1;
                }
                index += 1;
            }
            groups.push((score, true_positives, false_positives));
        }
        groups.reverse();

        let points = groups
            .iter()
            .enumerate()
            .map(|(i, &(score, true_positives, false_positives))| OperatingPoint {
                threshold: if i == 0 {
                    score
                } else {
                    (groups[i - 1].0 + score) / 2.0
                },
                true_positives,
                false_positives,
            })
            .collect();

        Self {
            points,
            positives,
            negatives,
        }
    }

    fn best_f1(&self) -> Option<f64> {
        if self.positives == 0 {
            return None;
        }
        let mut best: Option<(f64, f64)> = None;
        for point in &self.points {
            // 2PR / (P + R) reduced to counts, so equal scores compare equal
            let predicted = point.true_positives + point.false_positives;
            let f1 = (2 * point.true_positives) as f64
                / ((predicted + self.positives) as f64).max(F1_EPSILON);
            if best.map_or(true, |(score, _)| f1 > score) {
                best = Some((f1, point.threshold));
            }
        }
        best.map(|(_, threshold)| threshold)
    }

    fn best_youden(&self) -> Option<f64> {
        if self.positives == 0 || self.negatives == 0 {
            return None;
        }
        let mut best: Option<(f64, f64)> = None;
        let scale = (self.positives * self.negatives) as f64;
        for point in self.points.iter().rev() {
            // tpr - fpr over the common denominator
            let j = ((point.true_positives * self.negatives) as f64
                - (point.false_positives * self.positives) as f64)
                / scale;
            if best.map_or(true, |(score, _)| j > score) {
                best = Some((j, point.threshold));
            }
        }
        best.map(|(_, threshold)| threshold)
    }
}
