//! This module provides the phases of a run.

mod failure;
mod finalized;
mod init;
mod phase;
mod stopped;
mod training;

pub use self::{
    failure::{Failure, PhaseError},
    finalized::Finalized,
    init::Init,
    phase::{Phase, PhaseName, PhaseState, Shared},
    stopped::{StopReason, Stopped},
    training::Training,
};
