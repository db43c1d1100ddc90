//! The coordinator state of a run.

use std::sync::Arc;

use fedfraud_core::model::{Adam, AdamState, WeightSet};

use crate::{history::MetricHistory, settings::EarlyStoppingSettings, storage::Checkpoint};

#[derive(Debug, Clone, PartialEq)]
/// The fixed parameters of a run.
pub struct RunParams {
    /// The data holder the run belongs to.
    pub holder: String,
    /// The total number of rounds, including rounds restored from a checkpoint.
    pub rounds: u64,
    /// The learning rate of the server optimizer.
    pub lr_server: f32,
    pub early_stopping: EarlyStoppingSettings,
}

#[derive(Debug, Clone, PartialEq)]
/// The coordinator state.
pub struct CoordinatorState {
    /// The ID of the current or last round. `0` before the first round.
    pub round_id: u64,
    /// The global weights after the last completed round.
    pub weights: Arc<WeightSet>,
    /// The moment estimates of the server optimizer.
    pub server: AdamState,
    /// One record per completed round.
    pub history: MetricHistory,
    pub params: RunParams,
}

impl CoordinatorState {
    /// Creates the state of a run that has not completed any round.
    pub fn new(params: RunParams, weights: WeightSet) -> Self {
        let server = AdamState::new(&weights.shapes());
        Self {
            round_id: 0,
            weights: Arc::new(weights),
            server,
            history: MetricHistory::new(),
            params,
        }
    }

    /// Restores the state of a run from a checkpoint.
    pub fn restore(params: RunParams, checkpoint: Checkpoint) -> Self {
        Self {
            round_id: checkpoint.round(),
            weights: Arc::new(checkpoint.weights),
            server: checkpoint.server,
            history: checkpoint.history,
            params,
        }
    }

    /// Gets the number of completed rounds.
    pub fn completed_rounds(&self) -> u64 {
        self.history.completed_rounds()
    }

    /// Applies the averaged client delta through the server optimizer.
    ///
    /// The negated delta is the pseudo-gradient of the server step.
    pub fn apply_server_step(&mut self, delta: &WeightSet) {
        let gradients: WeightSet = delta.iter().map(|tensor| -tensor).collect();
        let update = Adam::new(self.params.lr_server).step(&mut self.server, &gradients);
        Arc::make_mut(&mut self.weights).scaled_add(1.0, &update);
    }

    /// Creates a checkpoint of the current state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            weights: self.weights.as_ref().clone(),
            server: self.server.clone(),
            history: self.history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use fedfraud_core::model::RoundMetrics;
    use ndarray::{array, ArrayD};

    use super::*;

    fn params() -> RunParams {
        RunParams {
            holder: "bank_m".to_string(),
            rounds: 10,
            lr_server: 0.1,
            early_stopping: EarlyStoppingSettings::default(),
        }
    }

    #[test]
    fn test_server_step_follows_the_delta() {
        let weights: WeightSet = vec![ArrayD::zeros(vec![2])].into();
        let mut state = CoordinatorState::new(params(), weights);
        let delta: WeightSet = vec![array![1.0f32, -2.0].into_dyn()].into();

        state.apply_server_step(&delta);

        // the first adam step moves every parameter by the learning rate
        let weights = &state.weights[0];
        assert!((weights[[0]] - 0.1).abs() < 1e-4);
        assert!((weights[[1]] + 0.1).abs() < 1e-4);
        assert_eq!(state.server.step, 1);
    }

    #[test]
    fn test_checkpoint_restore() {
        let weights: WeightSet = vec![ArrayD::from_elem(vec![2, 2], 0.5f32)].into();
        let mut state = CoordinatorState::new(params(), weights);
        state.history.push(RoundMetrics::default());
        state.round_id = 1;

        let checkpoint = state.checkpoint();
        assert_eq!(checkpoint.round(), 1);
        assert!(checkpoint.is_consistent());
        assert_eq!(CoordinatorState::restore(params(), checkpoint), state);
    }
}
