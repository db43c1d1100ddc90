use chrono::Utc;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    state_machine::{
        phases::{Failure, PhaseError, PhaseName, PhaseState, Shared, StopReason},
        RunError,
        RunSummary,
    },
    storage::{ExportBundle, Storage},
};

/// The finalized state.
///
/// Exports the final global model with the metric history and the schema.
#[derive(Debug)]
pub struct Finalized {
    reason: StopReason,
}

impl<T> PhaseState<Finalized, T> {
    /// Creates a new finalized state.
    pub fn new(shared: Shared<T>, reason: StopReason) -> Self {
        Self {
            private: Finalized { reason },
            shared,
        }
    }
}

impl<T> PhaseState<Finalized, T>
where
    T: Storage,
{
    /// Exports the run artifacts and ends the run.
    ///
    /// # Errors
    /// Fails if the export fails. The checkpoint is kept in that case.
    pub async fn finish(mut self) -> Result<RunSummary, RunError> {
        let span = error_span!("run_phase", phase = %PhaseName::Finalized);
        let exported = async {
            info!("starting phase");
            self.shared.events.broadcast_phase(PhaseName::Finalized);

            let state = &self.shared.state;
            let bundle = ExportBundle {
                holder: state.params.holder.clone(),
                weights: state.weights.as_ref().clone(),
                history: state.history.clone(),
                schema: self.shared.schema.clone(),
                timestamp: Utc::now(),
            };
            self.shared.store.export(&bundle).await
        }
        .instrument(span)
        .await;

        match exported {
            Ok(artifacts) => {
                let state = &self.shared.state;
                info!(
                    reason = %self.private.reason,
                    completed = state.completed_rounds(),
                    "run finalized"
                );
                Ok(RunSummary {
                    reason: self.private.reason,
                    completed_rounds: state.completed_rounds(),
                    history: state.history.clone(),
                    weights: state.weights.clone(),
                    artifacts,
                })
            }
            Err(err) => {
                warn!("failed to export the run artifacts");
                Err(PhaseState::<Failure, _>::new(self.shared, PhaseError::Export(err)).finish())
            }
        }
    }
}
