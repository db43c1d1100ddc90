//! Storage API.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedfraud_core::{
    model::{AdamState, WeightSet},
    FeatureSchema,
};

use crate::history::MetricHistory;

/// The error type for storage operations. These are mostly IO and decoding errors of the
/// underlying files.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq)]
/// The state needed to continue a run after its last completed round.
pub struct Checkpoint {
    /// The global weights after the last completed round.
    pub weights: WeightSet,
    /// The moment estimates of the server optimizer.
    pub server: AdamState,
    /// One record per completed round.
    pub history: MetricHistory,
}

impl Checkpoint {
    /// Gets the number of completed rounds.
    pub fn round(&self) -> u64 {
        self.history.completed_rounds()
    }

    /// Checks that the optimizer state fits the weights and the history is numbered without
    /// gaps.
    pub fn is_consistent(&self) -> bool {
        let shapes = self.weights.shapes();
        self.history.is_consistent()
            && self.server.m.shapes() == shapes
            && self.server.v.shapes() == shapes
            && self.server.step <= self.round()
    }
}

#[derive(Debug, Clone)]
/// The artifacts published at the end of a run.
pub struct ExportBundle {
    /// The data holder the run belongs to.
    pub holder: String,
    /// The final global weights.
    pub weights: WeightSet,
    pub history: MetricHistory,
    /// The schema the weights were trained against.
    pub schema: FeatureSchema,
    /// The time of the export. It names the timestamped weight archive.
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
/// An abstract checkpoint storage.
pub trait CheckpointStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Persists a [`Checkpoint`].
    ///
    /// # Behavior
    ///
    /// - If no checkpoint has been saved yet, save it and return `StorageResult::Ok(())`.
    /// - If a checkpoint already exists, replace it and return `StorageResult::Ok(())`. A reader
    ///   never observes a partially replaced checkpoint.
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()>;

    /// Returns the last saved [`Checkpoint`].
    ///
    /// # Behavior
    ///
    /// - If no checkpoint has been saved yet, return `StorageResult::Ok(Option::None)`.
    /// - If a checkpoint exists, return `StorageResult::Ok(Some(Checkpoint))`.
    /// - If a checkpoint exists but can't be decoded, return `StorageResult::Err(error)`.
    async fn load_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>>;

    /// Deletes the saved [`Checkpoint`].
    ///
    /// # Behavior
    ///
    /// Return `StorageResult::Ok(())` whether or not a checkpoint existed.
    async fn clear_checkpoint(&mut self) -> StorageResult<()>;

    /// Checks if the checkpoint storage is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the storage is ready, return `StorageResult::Ok(())`. Otherwise, for example if its
    /// directory can't be created, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[async_trait]
/// An abstract storage of the final run artifacts.
pub trait ExportStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Publishes an [`ExportBundle`] and returns the locations of the written artifacts.
    ///
    /// # Behavior
    ///
    /// - The latest-model artifacts are replaced.
    /// - The timestamped artifacts are added.
    /// - The accuracy log is appended to.
    async fn export(&mut self, bundle: &ExportBundle) -> StorageResult<Vec<PathBuf>>;

    /// Checks if the export storage is ready to process requests.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[async_trait]
pub trait Storage: CheckpointStorage + ExportStorage {
    /// Checks if the [`CheckpointStorage`] and the [`ExportStorage`] are ready to process
    /// requests.
    ///
    /// # Behavior
    ///
    /// If all inner services are ready to process requests, return `StorageResult::Ok(())`.
    /// If any inner service cannot process requests, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
