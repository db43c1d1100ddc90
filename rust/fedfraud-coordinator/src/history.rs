//! The metric history of a run.

use fedfraud_core::model::RoundMetrics;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// The metrics of one completed round.
pub struct RoundRecord {
    /// The 1-based round number.
    pub round: u64,
    #[serde(rename = "acc", alias = "accuracy")]
    pub accuracy: f64,
    pub pr_auc: f64,
    pub loss: f64,
}

impl RoundRecord {
    pub fn new(round: u64, metrics: RoundMetrics) -> Self {
        Self {
            round,
            accuracy: metrics.accuracy,
            pr_auc: metrics.pr_auc,
            loss: metrics.loss,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
/// The records of all completed rounds in round order.
///
/// The history has one record per completed round and is never truncated, so its length is the
/// number of completed rounds.
pub struct MetricHistory(Vec<RoundRecord>);

impl MetricHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the record of the next round and returns it.
    pub fn push(&mut self, metrics: RoundMetrics) -> RoundRecord {
        let record = RoundRecord::new(self.completed_rounds() + 1, metrics);
        self.0.push(record);
        record
    }

    /// Gets the number of completed rounds.
    pub fn completed_rounds(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.0.last()
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.0
    }

    /// Drops the records of all rounds after `rounds`.
    pub fn truncate(&mut self, rounds: u64) {
        self.0.truncate(rounds as usize);
    }

    /// Checks that the records are numbered `1..=n` without gaps.
    pub fn is_consistent(&self) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(index, record)| record.round == index as u64 + 1)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl From<Vec<RoundRecord>> for MetricHistory {
    fn from(records: Vec<RoundRecord>) -> Self {
        Self(records)
    }
}
