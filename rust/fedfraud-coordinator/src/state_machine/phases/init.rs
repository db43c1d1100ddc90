use async_trait::async_trait;
use tracing::info;

use crate::{
    state_machine::{
        events::ModelUpdate,
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared, StopReason, Stopped, Training},
        StateMachine,
    },
    storage::Storage,
};

/// The init state.
///
/// Checks the store and decides whether any round is left to train.
#[derive(Debug)]
pub struct Init;

#[async_trait]
impl<T> Phase<T> for PhaseState<Init, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Init;

    async fn process(&mut self) -> Result<(), PhaseError> {
        <T as Storage>::is_ready(&mut self.shared.store)
            .await
            .map_err(PhaseError::StoreNotReady)?;
        info!(
            holder = %self.shared.state.params.holder,
            completed = self.shared.state.completed_rounds(),
            rounds = self.shared.state.params.rounds,
            clients = self.shared.trainer.clients().len(),
            examples = self.shared.trainer.examples(),
            "run initialized"
        );
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the initial global model");
        let model = self.shared.state.weights.clone();
        self.shared.events.broadcast_model(ModelUpdate::New(model));
    }

    async fn next(self) -> StateMachine<T> {
        let state = &self.shared.state;
        if state.completed_rounds() >= state.params.rounds {
            PhaseState::<Stopped, _>::new(self.shared, StopReason::RoundsExhausted).into()
        } else if self.shared.stop_rx.is_stop_requested() {
            PhaseState::<Stopped, _>::new(self.shared, StopReason::Cancelled).into()
        } else {
            PhaseState::<Training, _>::new(self.shared).into()
        }
    }
}

impl<T> PhaseState<Init, T> {
    /// Creates a new init state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Init,
            shared,
        }
    }
}
