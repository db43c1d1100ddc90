//! Requests sent to a running state machine.
//!
//! The only request is to stop the run. A stop never interrupts a round: the round in progress
//! is completed and checkpointed, then the run is finalized.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
/// A handle to request a graceful stop of the run.
pub struct StopHandle(Arc<watch::Sender<bool>>);

#[derive(Debug, Clone)]
/// The state machine side of a [`StopHandle`].
pub struct StopReceiver(watch::Receiver<bool>);

impl StopHandle {
    /// Creates a new stop handle and its receiver.
    pub fn new() -> (Self, StopReceiver) {
        let (tx, rx) = watch::channel(false);
        (Self(Arc::new(tx)), StopReceiver(rx))
    }

    /// Requests the run to stop after the current round.
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

impl StopReceiver {
    /// Checks whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        *self.0.borrow()
    }
}
