//! Publishing of the final run artifacts on the local file system.

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::SecondsFormat;
use fedfraud_core::archive::{self, write_file_atomic, ArchiveWriter, NUMPY_PREFIX};
use tracing::info;

use crate::storage::{ExportBundle, ExportStorage, StorageResult};

/// The latest global model, replaced by every export.
pub const MODEL_FILE: &str = "global_model.npz";
pub const SCHEMA_FILE: &str = "feature_schema.json";
/// The tab separated accuracy log, appended to by every export.
pub const ACCURACY_LOG_FILE: &str = "accuracy_history.txt";

const ACCURACY_LOG_HEADER: [&str; 6] = ["holder", "round", "accuracy", "pr_auc", "loss", "timestamp"];

#[derive(Debug, Clone)]
/// An export store that writes into a directory.
///
/// An export writes:
/// - `global_model.npz`: the weights under `w_<i>` keys.
/// - `weights_<YYYYmmdd_HHMMSS>.npz`: the weights under the positional `arr_<i>` keys.
/// - `history_<holder>.json`: the metric history.
/// - `feature_schema.json`: the schema in its canonical form.
/// - `accuracy_history.txt`: one line per history record, after a header line written once.
pub struct FsExporter {
    dir: PathBuf,
}

impl FsExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ExportStorage for FsExporter {
    async fn export(&mut self, bundle: &ExportBundle) -> StorageResult<Vec<PathBuf>> {
        let dir = self.dir.clone();
        let bundle = bundle.clone();
        tokio::task::spawn_blocking(move || export(&dir, &bundle)).await?
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("cannot create export directory {}", self.dir.display()))
    }
}

fn export(dir: &Path, bundle: &ExportBundle) -> StorageResult<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;

    let model = dir.join(MODEL_FILE);
    archive::save(&model, &bundle.weights)?;

    let snapshot = dir.join(format!(
        "weights_{}.npz",
        bundle.timestamp.format("%Y%m%d_%H%M%S")
    ));
    ArchiveWriter::new()
        .with_group(NUMPY_PREFIX, bundle.weights.iter())
        .write(&snapshot)?;

    let history = dir.join(format!("history_{}.json", bundle.holder));
    write_file_atomic(&history, bundle.history.to_json()?.as_bytes())?;

    let schema = dir.join(SCHEMA_FILE);
    write_file_atomic(&schema, bundle.schema.to_json()?.as_bytes())?;

    let log = dir.join(ACCURACY_LOG_FILE);
    append_accuracy_log(&log, bundle)?;

    info!(dir = %dir.display(), "exported run artifacts");
    Ok(vec![model, snapshot, history, schema, log])
}

fn append_accuracy_log(path: &Path, bundle: &ExportBundle) -> StorageResult<()> {
    let is_new = fs::metadata(path).map_or(true, |metadata| metadata.len() == 0);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);

    if is_new {
        writer.write_record(ACCURACY_LOG_HEADER)?;
    }
    let timestamp = bundle.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    for record in bundle.history.records() {
        writer.write_record([
            bundle.holder.clone(),
            record.round.to_string(),
            format!("{:.6}", record.accuracy),
            format!("{:.6}", record.pr_auc),
            format!("{:.6}", record.loss),
            timestamp.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
