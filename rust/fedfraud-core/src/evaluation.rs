//! Scoring of held-out cases with an exported global model.
//!
//! Every case is a single raw record of a holder together with its expected label. Cases are
//! harmonized one at a time, exactly as a live transaction would be, then scored, and the
//! decision threshold is resolved over all cases of the holder.

use std::{fs, io, path::Path};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{
    calibration::ThresholdMode,
    harmonize::harmonize,
    model::{DimensionMismatch, Model},
    schema::FeatureSchema,
    table::{parse_label, RawTable, RawValue, DEFAULT_LABEL_COLUMN, DEFAULT_NON_FEATURE_COLUMNS},
};

/// Errors related to evaluating cases.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("failed to read the case file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid case file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("case {case}: `{value}` is not a binary label")]
    InvalidLabel { case: usize, value: String },
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The held-out cases of one holder.
pub struct CaseFile {
    pub holder: String,
    pub cases: Vec<Case>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A raw record and its expected label.
pub struct Case {
    pub record: Map<String, Value>,
    pub label: Value,
}

impl CaseFile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EvaluationError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, EvaluationError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// The prediction for a single case.
pub struct CaseOutcome {
    pub predicted: u8,
    pub probability: f32,
    pub expected: u8,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The outcome of all cases of one holder.
pub struct HolderReport {
    pub holder: String,
    pub threshold: f64,
    pub cases: Vec<CaseOutcome>,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The accuracy of one holder within a summary.
pub struct HolderAccuracy {
    pub holder: String,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Per-holder and overall accuracy over several holders.
pub struct EvaluationSummary {
    pub holders: Vec<HolderAccuracy>,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

/// Scores the cases of one holder.
///
/// # Errors
/// Fails if the schema width differs from the model's input width or a case label is not
/// binary.
pub fn evaluate_cases(
    model: &dyn Model,
    schema: &FeatureSchema,
    cases: &CaseFile,
    mode: ThresholdMode,
) -> Result<HolderReport, EvaluationError> {
    if schema.feature_dim() != model.input_dim() {
        return Err(DimensionMismatch::InputWidth {
            expected: model.input_dim(),
            found: schema.feature_dim(),
        }
        .into());
    }

    let mut features = Array2::zeros((cases.cases.len(), schema.feature_dim()));
    let mut labels = Vec::with_capacity(cases.cases.len());
    for (index, case) in cases.cases.iter().enumerate() {
        let label = parse_label(&RawValue::from_json(&case.label)).ok_or_else(|| {
            EvaluationError::InvalidLabel {
                case: index,
                value: case.label.to_string(),
            }
        })?;
        labels.push(label);

        let mut table = RawTable::from_records(std::iter::once(&case.record));
        table.drop_columns(&DEFAULT_NON_FEATURE_COLUMNS);
        table.drop_columns(&[DEFAULT_LABEL_COLUMN]);
        features.row_mut(index).assign(&harmonize(&table, schema).row(0));
    }

    let probabilities = model.predict(features.view()).to_vec();
    let threshold = mode.resolve(&probabilities, &labels);
    debug!(holder = %cases.holder, threshold, "resolved decision threshold");

    let outcomes: Vec<CaseOutcome> = probabilities
        .iter()
        .zip(&labels)
        .map(|(&probability, &label)| {
            let predicted = u8::from(f64::from(probability) >= threshold);
            let expected = u8::from(label >= 0.5);
            CaseOutcome {
                predicted,
                probability,
                expected,
                correct: predicted == expected,
            }
        })
        .collect();
    let correct = outcomes.iter().filter(|outcome| outcome.correct).count();
    let total = outcomes.len();

    Ok(HolderReport {
        holder: cases.holder.clone(),
        threshold,
        cases: outcomes,
        correct,
        total,
        accuracy: ratio(correct, total),
    })
}

impl EvaluationSummary {
    pub fn from_reports(reports: &[HolderReport]) -> Self {
        let holders: Vec<HolderAccuracy> = reports
            .iter()
            .map(|report| HolderAccuracy {
                holder: report.holder.clone(),
                correct: report.correct,
                total: report.total,
                accuracy: report.accuracy,
            })
            .collect();
        let correct = holders.iter().map(|holder| holder.correct).sum();
        let total = holders.iter().map(|holder| holder.total).sum();
        Self {
            holders,
            correct,
            total,
            accuracy: ratio(correct, total),
        }
    }
}

fn ratio(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, ArrayView1, ArrayView2};

    use super::*;
    use crate::model::{ForwardPass, WeightSet};

    /// Predicts the first feature as the probability.
    struct Passthrough {
        input_dim: usize,
    }

    impl Model for Passthrough {
        fn input_dim(&self) -> usize {
            self.input_dim
        }

        fn predict(&self, features: ArrayView2<f32>) -> Array1<f32> {
            features.column(0).to_owned()
        }

        fn loss_and_gradients(&self, _: ArrayView2<f32>, _: ArrayView1<f32>) -> ForwardPass {
            unimplemented!()
        }

        fn apply_update(&mut self, _: &WeightSet) {}

        fn weights(&self) -> WeightSet {
            WeightSet::default()
        }

        fn into_weights(self: Box<Self>) -> WeightSet {
            WeightSet::default()
        }
    }

    const CASES: &str = r#"{
        "holder": "bank_a",
        "cases": [
            {"record": {"risk": 0.95, "channel": "web", "transaction_id": "t1"}, "label": 1},
            {"record": {"risk": 0.9, "channel": "atm"}, "label": true},
            {"record": {"risk": 0.1, "channel": "web"}, "label": 0},
            {"record": {"risk": 0.05}, "label": "0"}
        ]
    }"#;

    fn schema() -> FeatureSchema {
        FeatureSchema::from_json_str(r#"["risk", "channel_web", "channel_atm"]"#).unwrap()
    }

    #[test]
    fn test_auto_threshold_separates_cases() {
        let cases = CaseFile::from_json_str(CASES).unwrap();
        let report =
            evaluate_cases(&Passthrough { input_dim: 3 }, &schema(), &cases, ThresholdMode::Auto)
                .unwrap();

        assert_eq!(report.holder, "bank_a");
        assert!(report.threshold > 0.1 && report.threshold < 0.9);
        assert_eq!(report.correct, 4);
        assert_eq!(report.total, 4);
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(
            report.cases.iter().map(|case| case.expected).collect::<Vec<_>>(),
            vec![1, 1, 0, 0]
        );
    }

    #[test]
    fn test_manual_threshold() {
        let cases = CaseFile::from_json_str(CASES).unwrap();
        let report = evaluate_cases(
            &Passthrough { input_dim: 3 },
            &schema(),
            &cases,
            ThresholdMode::Manual(0.92),
        )
        .unwrap();

        assert_eq!(report.threshold, 0.92);
        assert_eq!(
            report.cases.iter().map(|case| case.predicted).collect::<Vec<_>>(),
            vec![1, 0, 0, 0]
        );
        assert_eq!(report.correct, 3);
        assert_eq!(report.accuracy, 0.75);
    }

    #[test]
    fn test_width_and_label_errors() {
        let cases = CaseFile::from_json_str(CASES).unwrap();
        assert!(matches!(
            evaluate_cases(&Passthrough { input_dim: 5 }, &schema(), &cases, ThresholdMode::Auto),
            Err(EvaluationError::DimensionMismatch(DimensionMismatch::InputWidth {
                expected: 5,
                found: 3
            }))
        ));

        let invalid = CaseFile::from_json_str(
            r#"{"holder": "x", "cases": [{"record": {"risk": 1}, "label": "maybe"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            evaluate_cases(&Passthrough { input_dim: 3 }, &schema(), &invalid, ThresholdMode::Auto),
            Err(EvaluationError::InvalidLabel { case: 0, .. })
        ));
    }

    #[test]
    fn test_summary() {
        let report = |holder: &str, correct, total| HolderReport {
            holder: holder.to_string(),
            threshold: 0.5,
            cases: Vec::new(),
            correct,
            total,
            accuracy: ratio(correct, total),
        };
        let summary = EvaluationSummary::from_reports(&[report("a", 3, 4), report("b", 1, 4)]);

        assert_eq!(summary.holders[0].accuracy, 0.75);
        assert_eq!(summary.correct, 4);
        assert_eq!(summary.total, 8);
        assert_eq!(summary.accuracy, 0.5);
        assert_eq!(EvaluationSummary::from_reports(&[]).accuracy, 0.0);
    }
}
