//! Ordered tensor archives.
//!
//! A weight set is persisted as an NPZ archive in which every tensor is stored under a key that
//! encodes its position, e.g. `w_0`, `w_1`, ..., `w_10`. Tensors are bound to architecture slots
//! positionally, so the order on reload is recovered from the **numeric** value of the embedded
//! index and never from the order in which the archive lists its entries. Writers deliberately
//! emit entries in lexical key order (`w_0`, `w_1`, `w_10`, `w_2`, ...), which is also what most
//! archive tools show.
//!
//! Keys without a numeric suffix hold integer scalars (e.g. the optimizer step counter).
//!
//! Archives are written atomically: the bytes go to a temporary sibling which is synced and then
//! renamed over the target, so a crash never leaves a truncated archive behind under the final
//! name.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{self, File},
    io::{self, Cursor, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use ndarray::{Array0, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, WriteNpzError};
use thiserror::Error;

use crate::{model::WeightSet, Tensor};

/// The key prefix of the tensors of a weight set.
pub const WEIGHTS_PREFIX: &str = "w";

/// The key prefix `numpy.savez` uses for positional arrays.
pub const NUMPY_PREFIX: &str = "arr";

/// Errors of the tensor archive codec.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive {0} does not exist")]
    Missing(PathBuf),
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),
    #[error("failed to encode archive: {0}")]
    Encode(#[from] WriteNpzError),
    #[error("archive i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    fn corrupt(msg: impl Into<String>) -> Self {
        Self::ArchiveCorrupt(msg.into())
    }
}

/// Saves a weight set under the `w_<index>` keys.
pub fn save(path: impl AsRef<Path>, weights: &WeightSet) -> Result<(), ArchiveError> {
    ArchiveWriter::new()
        .with_group(WEIGHTS_PREFIX, weights.iter())
        .write(path)
}

/// Loads a weight set stored under the `w_<index>` keys and checks it against the expected slot
/// shapes.
pub fn load(path: impl AsRef<Path>, shapes: &[Vec<usize>]) -> Result<WeightSet, ArchiveError> {
    let mut archive = ArchiveReader::open(path)?;
    archive
        .take_group(WEIGHTS_PREFIX, Some(shapes))
        .map(WeightSet::from)
}

/// Builder of an archive with any number of tensor groups and scalars.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    tensors: BTreeMap<String, Tensor>,
    scalars: BTreeMap<String, i64>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the tensors as `<prefix>_0`, `<prefix>_1`, ... in iteration order.
    pub fn with_group<'a>(mut self, prefix: &str, tensors: impl Iterator<Item = &'a Tensor>) -> Self {
        for (index, tensor) in tensors.enumerate() {
            self.tensors
                .insert(format!("{}_{}", prefix, index), tensor.clone());
        }
        self
    }

    /// Adds an integer scalar.
    pub fn with_scalar(mut self, name: &str, value: i64) -> Self {
        self.scalars.insert(name.to_string(), value);
        self
    }

    /// Encodes the archive into memory.
    pub fn encode(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut npz = NpzWriter::new_compressed(Cursor::new(Vec::new()));
        for (name, tensor) in &self.tensors {
            npz.add_array(name.as_str(), tensor)?;
        }
        for (name, value) in &self.scalars {
            npz.add_array(name.as_str(), &Array0::from_elem((), *value))?;
        }
        Ok(npz.finish()?.into_inner())
    }

    /// Encodes the archive and writes it atomically to `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let bytes = self.encode()?;
        write_file_atomic(path.as_ref(), &bytes)?;
        Ok(())
    }
}

/// An archive that has been read into memory and sorted into groups.
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    groups: BTreeMap<String, BTreeMap<usize, Tensor>>,
    scalars: BTreeMap<String, i64>,
}

impl ArchiveReader {
    /// Reads all entries of the archive at `path`.
    ///
    /// # Errors
    /// Fails with [`ArchiveError::Missing`] if there is no file and with
    /// [`ArchiveError::ArchiveCorrupt`] if the file can't be decoded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::Missing(path))
            }
            Err(err) => return Err(err.into()),
        };
        let mut npz = NpzReader::new(file)
            .map_err(|err| ArchiveError::corrupt(format!("{}: {}", path.display(), err)))?;
        let names = npz
            .names()
            .map_err(|err| ArchiveError::corrupt(format!("{}: {}", path.display(), err)))?;

        let mut groups: BTreeMap<String, BTreeMap<usize, Tensor>> = BTreeMap::new();
        let mut scalars = BTreeMap::new();
        for name in names {
            let key = name.strip_suffix(".npy").unwrap_or(&name);
            match split_indexed_key(key) {
                Some((prefix, index)) => {
                    let tensor = npz
                        .by_name::<OwnedRepr<f32>, IxDyn>(&name)
                        .map_err(|err| ArchiveError::corrupt(format!("{}: {}", key, err)))?;
                    if groups
                        .entry(prefix.to_string())
                        .or_default()
                        .insert(index, tensor)
                        .is_some()
                    {
                        return Err(ArchiveError::corrupt(format!("duplicate key {}", key)));
                    }
                }
                None => {
                    let scalar = npz
                        .by_name::<OwnedRepr<i64>, ndarray::Ix0>(&name)
                        .map_err(|err| ArchiveError::corrupt(format!("{}: {}", key, err)))?;
                    scalars.insert(key.to_string(), scalar.into_scalar());
                }
            }
        }

        Ok(Self {
            path,
            groups,
            scalars,
        })
    }

    /// Checks whether the archive contains tensors under the given prefix.
    pub fn has_group(&self, prefix: &str) -> bool {
        self.groups.contains_key(prefix)
    }

    /// Removes the tensors stored under `prefix` and returns them ordered by their numeric index.
    ///
    /// # Errors
    /// Fails with [`ArchiveError::ArchiveCorrupt`] if:
    /// - the group does not exist,
    /// - an index in `0..n` is missing,
    /// - `shapes` is given and the tensor count or any tensor shape differs from it.
    pub fn take_group(
        &mut self,
        prefix: &str,
        shapes: Option<&[Vec<usize>]>,
    ) -> Result<Vec<Tensor>, ArchiveError> {
        let group = self.groups.remove(prefix).ok_or_else(|| {
            ArchiveError::corrupt(format!(
                "{} has no `{}_<index>` entries",
                self.path.display(),
                prefix
            ))
        })?;

        // a BTreeMap<usize, _> iterates in numeric order
        let mut tensors = Vec::with_capacity(group.len());
        for (expected, (index, tensor)) in group.into_iter().enumerate() {
            if index != expected {
                return Err(ArchiveError::corrupt(format!(
                    "missing key {}_{}",
                    prefix, expected
                )));
            }
            tensors.push(tensor);
        }

        if let Some(shapes) = shapes {
            if shapes.len() != tensors.len() {
                return Err(ArchiveError::corrupt(format!(
                    "expected {} tensors under `{}`, found {}",
                    shapes.len(),
                    prefix,
                    tensors.len()
                )));
            }
            for (index, (tensor, shape)) in tensors.iter().zip(shapes).enumerate() {
                if tensor.shape() != shape.as_slice() {
                    return Err(ArchiveError::corrupt(format!(
                        "{}_{} has shape {:?} but its slot expects {:?}",
                        prefix,
                        index,
                        tensor.shape(),
                        shape
                    )));
                }
            }
        }

        Ok(tensors)
    }

    /// Returns the scalar stored under `name`.
    pub fn scalar(&self, name: &str) -> Result<i64, ArchiveError> {
        self.scalars
            .get(name)
            .copied()
            .ok_or_else(|| ArchiveError::corrupt(format!("missing scalar {}", name)))
    }
}

/// Splits `w_12` into `("w", 12)`. Keys whose suffix is not a number are not indexed.
fn split_indexed_key(key: &str) -> Option<(&str, usize)> {
    let (prefix, index) = key.rsplit_once('_')?;
    if prefix.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok().map(|index| (prefix, index))
}

/// Writes `bytes` to `path` such that readers see either the old or the new content.
///
/// The data is written to a temporary sibling that is unique per process and call, synced,
/// renamed over `path` and the parent directory is synced afterwards. Concurrent writers of the
/// same path never share a temporary file; the last rename wins.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = temp_path(parent, path)?;
    let written = File::options()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, path));
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    sync_directory(parent)
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Gets a hidden sibling `.<name>.<pid>.<n>.tmp` of `path`.
fn temp_path(parent: &Path, path: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(format!(
        ".{}.{}.tmp",
        process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    Ok(parent.join(tmp_name))
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{array, ArrayD};
    use tempfile::TempDir;

    use super::*;

    fn eleven_tensors() -> WeightSet {
        (0..11)
            .map(|i| ArrayD::from_elem(IxDyn(&[i % 3 + 1, 2]), i as f32))
            .collect()
    }

    #[test]
    fn test_split_indexed_key() {
        assert_eq!(split_indexed_key("w_10"), Some(("w", 10)));
        assert_eq!(split_indexed_key("arr_0"), Some(("arr", 0)));
        assert_eq!(split_indexed_key("server_m_3"), Some(("server_m", 3)));
        assert_eq!(split_indexed_key("step"), None);
        assert_eq!(split_indexed_key("w_"), None);
        assert_eq!(split_indexed_key("_3"), None);
        assert_eq!(split_indexed_key("w_1a"), None);
    }

    #[test]
    fn test_eleven_tensors_reload_in_numeric_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.npz");
        let weights = eleven_tensors();
        let shapes = weights.shapes();

        save(&path, &weights).unwrap();

        // the archive itself lists the entries lexically
        let mut npz = NpzReader::new(File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = npz
            .names()
            .unwrap()
            .into_iter()
            .map(|name| name.trim_end_matches(".npy").to_string())
            .collect();
        assert_eq!(&names[..4], &["w_0", "w_1", "w_10", "w_2"]);

        let loaded = load(&path, &shapes).unwrap();
        assert_eq!(loaded, weights);
        for (index, tensor) in loaded.iter().enumerate() {
            assert!(tensor.iter().all(|&value| value == index as f32));
        }
    }

    #[test]
    fn test_groups_and_scalars() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.npz");
        let w = vec![array![1.0_f32, 2.0].into_dyn()];
        let m = vec![array![[0.5_f32]].into_dyn(), array![0.25_f32].into_dyn()];

        ArchiveWriter::new()
            .with_group("w", w.iter())
            .with_group("m", m.iter())
            .with_scalar("step", 7)
            .write(&path)
            .unwrap();

        let mut archive = ArchiveReader::open(&path).unwrap();
        assert!(archive.has_group("w"));
        assert_eq!(archive.take_group("m", None).unwrap(), m);
        assert_eq!(archive.take_group("w", None).unwrap(), w);
        assert_eq!(archive.scalar("step").unwrap(), 7);
        assert!(matches!(
            archive.scalar("round"),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_missing_index_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gap.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("w_0", &array![1.0_f32].into_dyn()).unwrap();
        npz.add_array("w_2", &array![3.0_f32].into_dyn()).unwrap();
        npz.finish().unwrap();

        let err = ArchiveReader::open(&path)
            .unwrap()
            .take_group("w", None)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ArchiveCorrupt(msg) if msg.contains("w_1")));
    }

    #[test]
    fn test_shape_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.npz");
        save(&path, &eleven_tensors()).unwrap();

        let mut shapes = eleven_tensors().shapes();
        shapes[4] = vec![9, 9];
        assert!(matches!(
            load(&path, &shapes),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
        shapes.pop();
        assert!(matches!(
            load(&path, &shapes),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_missing_and_garbage_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.npz");
        assert!(matches!(
            ArchiveReader::open(&missing),
            Err(ArchiveError::Missing(_))
        ));

        let garbage = dir.path().join("garbage.npz");
        fs::write(&garbage, b"definitely not a zip archive").unwrap();
        assert!(matches!(
            ArchiveReader::open(&garbage),
            Err(ArchiveError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_write_file_atomic_replaces_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history.json");

        write_file_atomic(&path, b"[1]").unwrap();
        write_file_atomic(&path, b"[1,2]").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"[1,2]");
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![OsString::from("history.json")]);
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("global_model.npz");
        let first = temp_path(dir.path(), &path).unwrap();
        let second = temp_path(dir.path(), &path).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(dir.path()));
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".global_model.npz."));
    }

    #[test]
    fn test_concurrent_writers_of_one_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let writers: Vec<_> = (0..8u8)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let bytes = vec![writer; 4096];
                    for _ in 0..20 {
                        write_file_atomic(&path, &bytes).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // the content is one writer's complete payload
        let content = fs::read(&path).unwrap();
        assert_eq!(content.len(), 4096);
        assert!(content.iter().all(|&byte| byte == content[0]));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
