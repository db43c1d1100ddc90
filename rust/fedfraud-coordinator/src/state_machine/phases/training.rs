use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    history::RoundRecord,
    state_machine::{
        events::{MetricsUpdate, ModelUpdate},
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared, StopReason, Stopped},
        StateMachine,
    },
    storage::Storage,
};

/// The training state.
///
/// Runs one round: the clients train on the global weights, their deltas are averaged and
/// applied through the server optimizer, and the new state is checkpointed.
#[derive(Debug)]
pub struct Training {
    /// The record of the round, once it completed.
    record: Option<RoundRecord>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Training, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Training;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.state.completed_rounds() + 1;
        self.shared.set_round_id(round);
        info!(round, rounds = self.shared.state.params.rounds, "starting round");

        let global = self.shared.state.weights.clone();
        let outcome = self.shared.trainer.run_round(round, global).await?;
        debug!(examples = outcome.examples, "clients trained");

        self.shared.state.apply_server_step(&outcome.delta);
        let record = self.shared.state.history.push(outcome.metrics);
        info!(
            round,
            accuracy = record.accuracy,
            pr_auc = record.pr_auc,
            loss = record.loss,
            "round completed"
        );

        let checkpoint = self.shared.state.checkpoint();
        self.shared
            .store
            .save_checkpoint(&checkpoint)
            .await
            .map_err(PhaseError::Checkpoint)?;
        self.private.record = Some(record);
        Ok(())
    }

    fn broadcast(&mut self) {
        if let Some(record) = self.private.record {
            info!("broadcasting round metrics");
            self.shared
                .events
                .broadcast_metrics(MetricsUpdate::New(record));
        }
        info!("broadcasting the new global model");
        let model = self.shared.state.weights.clone();
        self.shared.events.broadcast_model(ModelUpdate::New(model));
    }

    async fn next(self) -> StateMachine<T> {
        match self.stop_reason() {
            Some(reason) => PhaseState::<Stopped, _>::new(self.shared, reason).into(),
            None => PhaseState::<Training, _>::new(self.shared).into(),
        }
    }
}

impl<T> PhaseState<Training, T> {
    /// Creates a new training state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Training { record: None },
            shared,
        }
    }

    /// Checks whether the run stops after the completed round.
    ///
    /// Convergence is checked first, then the round budget, then a pending stop request.
    fn stop_reason(&self) -> Option<StopReason> {
        let state = &self.shared.state;
        if let [.., previous, last] = state.history.records() {
            if state
                .params
                .early_stopping
                .should_stop(last.round, last.accuracy, previous.accuracy)
            {
                info!(round = last.round, "accuracy converged");
                return Some(StopReason::EarlyStop);
            }
        }
        if state.completed_rounds() >= state.params.rounds {
            return Some(StopReason::RoundsExhausted);
        }
        if self.shared.stop_rx.is_stop_requested() {
            return Some(StopReason::Cancelled);
        }
        None
    }
}
