//! The state machine that controls the execution of a training run.
//!
//! # Overview
//!
//! ```text
//! Init --> Training --> Stopped --> Finalized
//!   |        |  ^                      |
//!   |        +--+                      |
//!   +--> Stopped      any phase --> Failure
//! ```
//!
//! The [`StateMachine`] runs the rounds of one data holder: it hands the global weights to the
//! clients, averages their updates, applies the average through the server optimizer and
//! checkpoints the result after every round. It publishes the phase, the round metrics and the
//! global model as events.
//!
//! The [`StateMachine`] as well as the run parameters can be configured in the config file.
//! See [here][settings] for more details.
//!
//! # Phase states
//!
//! **Init**
//!
//! Publishes [`PhaseName::Init`], checks that the store is ready and publishes the initial
//! global model. Moves to **Stopped** if no round is left or a stop is already requested.
//!
//! **Training**
//!
//! Publishes [`PhaseName::Training`] and runs one round. The round ID is the number of completed
//! rounds plus one. After the round the new global model and the round metrics are published
//! and the state is checkpointed. Training repeats until the accuracy converges, the rounds are
//! exhausted or a stop is requested, checked in this order.
//!
//! **Stopped**
//!
//! Publishes [`PhaseName::Stopped`] and logs the [`StopReason`].
//!
//! **Finalized**
//!
//! Publishes [`PhaseName::Finalized`], exports the run artifacts and ends the run with a
//! [`RunSummary`].
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`], invalidates the published metrics and model and ends the
//! run with a [`RunError`]. The last checkpoint is left untouched, so a failed run can be
//! resumed.
//!
//! # Requests
//!
//! A [`StopHandle`] is returned by [`StateMachineInitializer::init()`]. A stop request lets the
//! current round complete and finalizes the run afterwards.
//!
//! # Events
//!
//! Everyone who is interested in the events can subscribe to them via the [`EventSubscriber`]
//! that is created together with the [`StateMachine`].
//!
//! See [here][events] for more details.
//!
//! [settings]: crate::settings
//! [events]: crate::state_machine::events
//! [`StopReason`]: crate::state_machine::phases::StopReason
//! [`StopHandle`]: crate::state_machine::requests::StopHandle
//! [`EventSubscriber`]: crate::state_machine::events::EventSubscriber

pub mod coordinator;
pub mod events;
pub mod initializer;
pub mod phases;
pub mod requests;

#[cfg(test)]
pub(crate) mod tests;

use std::{path::PathBuf, sync::Arc};

use derive_more::From;
use fedfraud_core::WeightSet;
use thiserror::Error;

pub use self::initializer::{StateMachineInitializationError, StateMachineInitializer};
use self::phases::{
    Failure,
    Finalized,
    Init,
    PhaseError,
    PhaseName,
    PhaseState,
    StopReason,
    Stopped,
    Training,
};
use crate::{history::MetricHistory, storage::Storage};

/// The outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: StopReason,
    /// The number of completed rounds, including rounds restored from a checkpoint.
    pub completed_rounds: u64,
    pub history: MetricHistory,
    /// The final global weights.
    pub weights: Arc<WeightSet>,
    /// The exported artifacts.
    pub artifacts: Vec<PathBuf>,
}

/// The error of a failed run.
#[derive(Debug, Error)]
#[error("run failed after {completed_rounds} completed rounds: {error}")]
pub struct RunError {
    /// The number of rounds completed and checkpointed before the failure.
    pub completed_rounds: u64,
    #[source]
    pub error: PhaseError,
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T> {
    Init(PhaseState<Init, T>),
    Training(PhaseState<Training, T>),
    Stopped(PhaseState<Stopped, T>),
    Finalized(PhaseState<Finalized, T>),
    Failure(PhaseState<Failure, T>),
}

impl<T> StateMachine<T>
where
    T: Storage,
{
    /// Gets the name of the current state.
    pub fn phase(&self) -> PhaseName {
        match self {
            StateMachine::Init(_) => PhaseName::Init,
            StateMachine::Training(_) => PhaseName::Training,
            StateMachine::Stopped(_) => PhaseName::Stopped,
            StateMachine::Finalized(_) => PhaseName::Finalized,
            StateMachine::Failure(_) => PhaseName::Failure,
        }
    }

    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached a final state.
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Init(state) => Some(state.run_phase().await),
            StateMachine::Training(state) => Some(state.run_phase().await),
            StateMachine::Stopped(state) => Some(state.run_phase().await),
            StateMachine::Finalized(_) | StateMachine::Failure(_) => None,
        }
    }

    /// Runs the state machine until the run is finalized or fails.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        loop {
            self = match self {
                StateMachine::Init(state) => state.run_phase().await,
                StateMachine::Training(state) => state.run_phase().await,
                StateMachine::Stopped(state) => state.run_phase().await,
                StateMachine::Finalized(state) => return state.finish().await,
                StateMachine::Failure(state) => return Err(state.finish()),
            };
        }
    }
}
