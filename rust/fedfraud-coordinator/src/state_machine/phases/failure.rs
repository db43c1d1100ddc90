use thiserror::Error;
use tracing::{error, error_span, info};

use crate::{
    state_machine::{
        events::{MetricsUpdate, ModelUpdate},
        phases::{PhaseName, PhaseState, Shared},
        RunError,
    },
    storage::StorageError,
    trainer::TrainingError,
};

/// Errors which can occur during the execution of the [`StateMachine`].
///
/// [`StateMachine`]: crate::state_machine::StateMachine
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("store not ready: {0}")]
    StoreNotReady(StorageError),
    #[error("saving the checkpoint failed: {0}")]
    Checkpoint(StorageError),
    #[error("exporting the run artifacts failed: {0}")]
    Export(StorageError),
    #[error("training round failed: {0}")]
    Training(#[from] TrainingError),
}

/// The failure state.
///
/// A failed run is not retried: the last checkpoint stays in place and the run can be resumed.
#[derive(Debug)]
pub struct Failure {
    error: PhaseError,
}

impl<T> PhaseState<Failure, T> {
    /// Creates a new failure phase.
    pub fn new(shared: Shared<T>, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }

    /// Invalidates the published round data and ends the run with the phase error.
    pub fn finish(mut self) -> RunError {
        let _span = error_span!("run_phase", phase = %PhaseName::Failure).entered();
        self.shared.events.broadcast_phase(PhaseName::Failure);
        error!("phase state error: {}", self.private.error);

        info!("broadcasting invalidation of the round data");
        self.shared
            .events
            .broadcast_metrics(MetricsUpdate::Invalidate);
        self.shared.events.broadcast_model(ModelUpdate::Invalidate);

        RunError {
            completed_rounds: self.shared.state.completed_rounds(),
            error: self.private.error,
        }
    }
}
