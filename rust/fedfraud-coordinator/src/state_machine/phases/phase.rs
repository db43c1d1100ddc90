use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    state_machine::{
        coordinator::CoordinatorState,
        events::EventPublisher,
        phases::{Failure, PhaseError},
        requests::StopReceiver,
        StateMachine,
    },
    storage::Storage,
    trainer::Trainer,
};
use fedfraud_core::FeatureSchema;

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Init")]
    Init,
    #[display(fmt = "Training")]
    Training,
    #[display(fmt = "Stopped")]
    Stopped,
    #[display(fmt = "Finalized")]
    Finalized,
    #[display(fmt = "Failure")]
    Failure,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase<T>
where
    T: Storage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    async fn next(self) -> StateMachine<T>;
}

/// A struct that contains the coordinator state and the I/O interfaces that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared<T> {
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The client side of the rounds.
    pub(in crate::state_machine) trainer: Trainer,
    /// The schema the run trains against.
    pub(in crate::state_machine) schema: FeatureSchema,
    /// The stop request receiver.
    pub(in crate::state_machine) stop_rx: StopReceiver,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The store for checkpoints and exported artifacts.
    pub(in crate::state_machine) store: T,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("trainer", &self.trainer)
            .field("schema", &self.schema)
            .field("stop_rx", &self.stop_rx)
            .field("events", &self.events)
            .finish()
    }
}

impl<T> Shared<T> {
    /// Creates a new shared state.
    pub fn new(
        state: CoordinatorState,
        trainer: Trainer,
        schema: FeatureSchema,
        publisher: EventPublisher,
        stop_rx: StopReceiver,
        store: T,
    ) -> Self {
        Self {
            state,
            trainer,
            schema,
            stop_rx,
            events: publisher,
            store,
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: u64) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }
}

/// The state corresponding to a phase of a run.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<T>,
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
    Self: Phase<T>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> StateMachine<T> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return self.into_failure_state(err);
            }
            info!("phase ran successfully");

            self.broadcast();

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }
}

impl<S, T> PhaseState<S, T> {
    pub(in crate::state_machine) fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        PhaseState::<Failure, _>::new(self.shared, err).into()
    }
}
