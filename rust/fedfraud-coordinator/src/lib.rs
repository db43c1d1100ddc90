//! `fedfraud-coordinator` runs federated training rounds for one data holder.
//!
//! The holder's harmonized rows are split into simulated clients. Every round, each client
//! trains a copy of the global model on its own rows, the coordinator averages the client
//! updates weighted by their example counts and applies the average through a server-side
//! optimizer. After every round the global weights, the server optimizer state and the metric
//! history are checkpointed, so an interrupted run can be resumed. Training stops early once the
//! round accuracy stabilizes.
//!
//! The crate is organized like this:
//!
//! - [`settings`]: loading and validation of the run configuration.
//! - [`state_machine`]: the phases of a run and the events they publish.
//! - [`trainer`]: the per-round client work on a dedicated thread pool.
//! - [`storage`]: checkpoints and exported artifacts.
//! - [`history`]: the per-round metric history.

pub mod history;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod trainer;
