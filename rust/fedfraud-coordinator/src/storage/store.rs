//! A generic store.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::storage::{
    Checkpoint,
    CheckpointStorage,
    ExportBundle,
    ExportStorage,
    Storage,
    StorageResult,
};

#[derive(Clone)]
/// A generic store.
pub struct Store<C, E>
where
    C: CheckpointStorage,
    E: ExportStorage,
{
    /// A checkpoint store.
    checkpoint: C,
    /// An export store.
    export: E,
}

impl<C, E> Store<C, E>
where
    C: CheckpointStorage,
    E: ExportStorage,
{
    /// Creates a new [`Store`].
    pub fn new(checkpoint: C, export: E) -> Self {
        Self { checkpoint, export }
    }
}

#[async_trait]
impl<C, E> CheckpointStorage for Store<C, E>
where
    C: CheckpointStorage,
    E: ExportStorage,
{
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        self.checkpoint.save_checkpoint(checkpoint).await
    }

    async fn load_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        self.checkpoint.load_checkpoint().await
    }

    async fn clear_checkpoint(&mut self) -> StorageResult<()> {
        self.checkpoint.clear_checkpoint().await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        CheckpointStorage::is_ready(&mut self.checkpoint).await
    }
}

#[async_trait]
impl<C, E> ExportStorage for Store<C, E>
where
    C: CheckpointStorage,
    E: ExportStorage,
{
    async fn export(&mut self, bundle: &ExportBundle) -> StorageResult<Vec<PathBuf>> {
        self.export.export(bundle).await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        ExportStorage::is_ready(&mut self.export).await
    }
}

#[async_trait]
impl<C, E> Storage for Store<C, E>
where
    C: CheckpointStorage,
    E: ExportStorage,
{
    async fn is_ready(&mut self) -> StorageResult<()> {
        tokio::try_join!(
            CheckpointStorage::is_ready(&mut self.checkpoint),
            ExportStorage::is_ready(&mut self.export)
        )
        .map(|_| ())
    }
}
