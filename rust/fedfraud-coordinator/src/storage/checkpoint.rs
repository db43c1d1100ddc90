//! A checkpoint store on the local file system.
//!
//! A checkpoint directory holds two files:
//!
//! - `server_state.npz`: the global weights (`w_<i>`), the server optimizer moments (`m_<i>`,
//!   `v_<i>`) and the scalars `round` and `step`.
//! - `history.json`: the metric history.
//!
//! Both files are replaced atomically. The history is written first, so after a crash between
//! the two writes the history is at most one record ahead of the archive. Such a record is
//! dropped on load, the archive's round is authoritative.

use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, SystemTime},
};

use anyhow::{bail, ensure, Context};
use async_trait::async_trait;
use fedfraud_core::{
    archive::{write_file_atomic, ArchiveReader, ArchiveWriter, WEIGHTS_PREFIX},
    model::{AdamState, WeightSet},
};
use tracing::{debug, warn};

use crate::{
    history::MetricHistory,
    storage::{Checkpoint, CheckpointStorage, StorageResult},
};

pub const STATE_FILE: &str = "server_state.npz";
pub const HISTORY_FILE: &str = "history.json";
const LOCK_FILE: &str = ".lock";

const FIRST_MOMENT_PREFIX: &str = "m";
const SECOND_MOMENT_PREFIX: &str = "v";
const ROUND_KEY: &str = "round";
const STEP_KEY: &str = "step";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a writer waits for the lock of a checkpoint directory.
pub struct LockPolicy {
    /// The number of acquisition attempts before giving up.
    pub attempts: u32,
    /// The wait after the first failed attempt. It grows linearly with every attempt.
    pub backoff: Duration,
    /// The age after which a lock is considered abandoned.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            backoff: Duration::from_millis(50),
            stale_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
/// A checkpoint store that keeps the last checkpoint in a directory.
pub struct FsCheckpointStore {
    dir: PathBuf,
    lock: LockPolicy,
}

impl FsCheckpointStore {
    /// Creates a store for the checkpoint directory `dir`. The directory is created on the first
    /// save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CheckpointStorage for FsCheckpointStore {
    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let (dir, lock) = (self.dir.clone(), self.lock);
        let checkpoint = checkpoint.clone();
        tokio::task::spawn_blocking(move || save(&dir, lock, &checkpoint)).await?
    }

    async fn load_checkpoint(&mut self) -> StorageResult<Option<Checkpoint>> {
        let (dir, lock) = (self.dir.clone(), self.lock);
        tokio::task::spawn_blocking(move || load(&dir, lock)).await?
    }

    async fn clear_checkpoint(&mut self) -> StorageResult<()> {
        let (dir, lock) = (self.dir.clone(), self.lock);
        tokio::task::spawn_blocking(move || clear(&dir, lock)).await?
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("cannot create checkpoint directory {}", self.dir.display()))
    }
}

fn save(dir: &Path, lock: LockPolicy, checkpoint: &Checkpoint) -> StorageResult<()> {
    fs::create_dir_all(dir)?;
    let _lock = DirectoryLock::acquire(dir, lock)?;

    write_file_atomic(&dir.join(HISTORY_FILE), checkpoint.history.to_json()?.as_bytes())?;
    ArchiveWriter::new()
        .with_group(WEIGHTS_PREFIX, checkpoint.weights.iter())
        .with_group(FIRST_MOMENT_PREFIX, checkpoint.server.m.iter())
        .with_group(SECOND_MOMENT_PREFIX, checkpoint.server.v.iter())
        .with_scalar(ROUND_KEY, i64::try_from(checkpoint.round())?)
        .with_scalar(STEP_KEY, i64::try_from(checkpoint.server.step)?)
        .write(dir.join(STATE_FILE))?;
    debug!(round = checkpoint.round(), dir = %dir.display(), "checkpoint saved");
    Ok(())
}

fn load(dir: &Path, lock: LockPolicy) -> StorageResult<Option<Checkpoint>> {
    let state = dir.join(STATE_FILE);
    if !state.exists() {
        return Ok(None);
    }
    let _lock = DirectoryLock::acquire(dir, lock)?;

    let mut archive = ArchiveReader::open(&state)?;
    let weights = WeightSet::from(archive.take_group(WEIGHTS_PREFIX, None)?);
    let shapes = weights.shapes();
    let m = WeightSet::from(archive.take_group(FIRST_MOMENT_PREFIX, Some(&shapes))?);
    let v = WeightSet::from(archive.take_group(SECOND_MOMENT_PREFIX, Some(&shapes))?);
    let round = u64::try_from(archive.scalar(ROUND_KEY)?).context("negative round")?;
    let step = u64::try_from(archive.scalar(STEP_KEY)?).context("negative optimizer step")?;

    let history_path = dir.join(HISTORY_FILE);
    let json = fs::read_to_string(&history_path)
        .with_context(|| format!("cannot read {}", history_path.display()))?;
    let mut history = MetricHistory::from_json(&json)
        .with_context(|| format!("cannot decode {}", history_path.display()))?;
    if history.completed_rounds() < round {
        bail!(
            "history has {} records but the checkpoint is at round {}",
            history.completed_rounds(),
            round
        );
    }
    if history.completed_rounds() > round {
        warn!(
            round,
            records = history.completed_rounds(),
            "dropping history records of an unfinished checkpoint"
        );
        history.truncate(round);
    }

    let checkpoint = Checkpoint {
        weights,
        server: AdamState { step, m, v },
        history,
    };
    ensure!(checkpoint.is_consistent(), "inconsistent checkpoint in {}", dir.display());
    Ok(Some(checkpoint))
}

fn clear(dir: &Path, lock: LockPolicy) -> StorageResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    let _lock = DirectoryLock::acquire(dir, lock)?;
    for file in &[STATE_FILE, HISTORY_FILE] {
        match fs::remove_file(dir.join(file)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
    }
    Ok(())
}

/// An exclusive lock on a checkpoint directory, released on drop.
struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    fn acquire(dir: &Path, policy: LockPolicy) -> StorageResult<Self> {
        let path = dir.join(LOCK_FILE);
        for attempt in 1..=policy.attempts {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if remove_stale(&path, policy.stale_after) {
                        continue;
                    }
                    thread::sleep(policy.backoff * attempt);
                }
                Err(err) => return Err(err.into()),
            }
        }
        bail!("checkpoint directory {} is locked", dir.display())
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

static STALE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Removes an abandoned lock and returns whether the lock can be retried right away.
///
/// The lock is renamed to a unique name first and only removed if the moved file is still the
/// one that was found stale. A lock another writer created in between is linked back in place.
fn remove_stale(path: &Path, stale_after: Duration) -> bool {
    let modified = match lock_mtime(path) {
        Some(modified) if age(modified) > stale_after => modified,
        _ => return false,
    };

    let moved = path.with_file_name(format!(
        "{}.stale.{}.{}",
        LOCK_FILE,
        process::id(),
        STALE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    match fs::rename(path, &moved) {
        Ok(()) => {}
        Err(err) => return err.kind() == io::ErrorKind::NotFound,
    }

    let taken_over = lock_mtime(&moved) == Some(modified);
    if taken_over {
        warn!(lock = %path.display(), "removing stale checkpoint lock");
    } else {
        let _ = fs::hard_link(&moved, path);
    }
    let _ = fs::remove_file(&moved);
    taken_over
}

fn lock_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

fn age(time: SystemTime) -> Duration {
    time.elapsed().unwrap_or_default()
}
