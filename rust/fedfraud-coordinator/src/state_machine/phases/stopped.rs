use async_trait::async_trait;
use derive_more::Display;
use tracing::info;

use crate::{
    state_machine::{
        phases::{Finalized, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::Storage,
};

/// Why a run stopped training.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum StopReason {
    /// The round accuracy stabilized.
    #[display(fmt = "early stop")]
    EarlyStop,
    /// All configured rounds completed.
    #[display(fmt = "rounds exhausted")]
    RoundsExhausted,
    /// A stop was requested.
    #[display(fmt = "cancelled")]
    Cancelled,
}

/// The stopped state.
#[derive(Debug)]
pub struct Stopped {
    reason: StopReason,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Stopped, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Stopped;

    async fn process(&mut self) -> Result<(), PhaseError> {
        info!(
            reason = %self.private.reason,
            completed = self.shared.state.completed_rounds(),
            "training stopped"
        );
        Ok(())
    }

    async fn next(self) -> StateMachine<T> {
        PhaseState::<Finalized, _>::new(self.shared, self.private.reason).into()
    }
}

impl<T> PhaseState<Stopped, T> {
    /// Creates a new stopped state.
    pub fn new(shared: Shared<T>, reason: StopReason) -> Self {
        Self {
            private: Stopped { reason },
            shared,
        }
    }
}
