//! In-memory storage backends for tests.

use std::{path::PathBuf, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::storage::{
    Checkpoint,
    CheckpointStorage,
    ExportBundle,
    ExportStorage,
    Store,
    StorageResult,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Arc<Mutex<Option<Checkpoint>>>,
    saves: Arc<Mutex<u64>>,
}

impl MemoryCheckpointStore {
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: Arc::new(Mutex::new(Some(checkpoint))),
            saves: Arc::default(),
        }
    }

    pub async fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.lock().await.clone()
    }

    /// Gets the number of saved checkpoints.
    pub async fn saves(&self) -> u64 {
        *self.saves.lock().await
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStore {
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        *self.checkpoint.lock().await = Some(checkpoint.clone());
        *self.saves.lock().await += 1;
        Ok(())
    }

    async fn load_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        Ok(self.checkpoint.lock().await.clone())
    }

    async fn clear_checkpoint(&mut self) -> StorageResult<()> {
        *self.checkpoint.lock().await = None;
        Ok(())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

/// A checkpoint store whose checkpoint can never be decoded.
#[derive(Debug, Clone, Default)]
pub struct CorruptCheckpointStore;

#[async_trait]
impl CheckpointStorage for CorruptCheckpointStore {
    async fn save_checkpoint(&mut self, _checkpoint: &Checkpoint) -> StorageResult<()> {
        Ok(())
    }

    async fn load_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        Err(anyhow!("archive corrupt"))
    }

    async fn clear_checkpoint(&mut self) -> StorageResult<()> {
        Ok(())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    bundles: Arc<Mutex<Vec<ExportBundle>>>,
}

impl MemoryExporter {
    pub async fn bundles(&self) -> Vec<ExportBundle> {
        self.bundles.lock().await.clone()
    }
}

#[async_trait]
impl ExportStorage for MemoryExporter {
    async fn export(&mut self, bundle: &ExportBundle) -> StorageResult<Vec<PathBuf>> {
        self.bundles.lock().await.push(bundle.clone());
        Ok(Vec::new())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

pub type MemoryStore = Store<MemoryCheckpointStore, MemoryExporter>;

/// Creates an empty in-memory store and returns handles to its parts.
pub fn init_memory_store() -> (MemoryStore, MemoryCheckpointStore, MemoryExporter) {
    let checkpoint = MemoryCheckpointStore::default();
    let exporter = MemoryExporter::default();
    (
        Store::new(checkpoint.clone(), exporter.clone()),
        checkpoint,
        exporter,
    )
}
