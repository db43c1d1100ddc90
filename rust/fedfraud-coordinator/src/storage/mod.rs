//! Storage backends of a training run.
//!
//! A run needs two kinds of storage: a [`CheckpointStorage`] that holds the state after the last
//! completed round and an [`ExportStorage`] that receives the final artifacts. The [`Store`]
//! combines both behind the [`Storage`] trait the state machine is generic over.

pub mod checkpoint;
pub mod export;
pub mod store;
pub mod traits;

pub use self::{
    checkpoint::{FsCheckpointStore, LockPolicy},
    export::FsExporter,
    store::Store,
    traits::{
        Checkpoint,
        CheckpointStorage,
        ExportBundle,
        ExportStorage,
        Storage,
        StorageError,
        StorageResult,
    },
};

#[cfg(test)]
pub(crate) mod tests;
