// rust/dsi-core/src/index/store.rs

//! Durable, shared storage of a global index order.
//!
//! The index file is a flat array of little-endian `u32` values with no
//! header: `4 * total_size` bytes. Next to it the store keeps a TOML manifest
//! describing which plan and epoch produced the file plus its XxHash64
//! checksum. Both are written through a hidden, per-writer temp file and
//! renamed into place, data first, so a manifest never refers to a
//! half-written array and leaders on different hosts can persist the same
//! shared path concurrently.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use super::generator::{GlobalIndices, IndexPlan};
use super::view::{IndexView, INDEX_WIDTH};
use crate::config::IndexConfig;
use crate::error::{Result, SamplerError};

/// Suffix appended to the index file name to form the manifest path.
pub const MANIFEST_SUFFIX: &str = ".manifest.toml";

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Sidecar metadata describing a persisted index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub epoch: u64,
    #[serde(with = "hex_u64")]
    pub seed: u64,
    pub length: usize,
    pub world_size: usize,
    pub total_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// XxHash64 of the file contents.
    #[serde(with = "hex_u64")]
    pub checksum: u64,
}

impl IndexManifest {
    /// Describes a generated index order.
    pub fn for_indices(indices: &GlobalIndices) -> Self {
        let plan = indices.plan();
        Self {
            epoch: indices.epoch(),
            seed: plan.seed,
            length: plan.length,
            world_size: plan.world_size,
            total_size: indices.len(),
            shuffle: plan.shuffle,
            drop_last: plan.drop_last,
            checksum: indices.checksum(),
        }
    }

    /// The plan that produced the file.
    pub fn plan(&self) -> IndexPlan {
        IndexPlan {
            length: self.length,
            world_size: self.world_size,
            seed: self.seed,
            shuffle: self.shuffle,
            drop_last: self.drop_last,
        }
    }

    /// Returns true if the file was generated from `plan` for `epoch`.
    pub fn matches(&self, plan: &IndexPlan, epoch: u64) -> bool {
        self.epoch == epoch && self.plan() == *plan && self.total_size == plan.total_size()
    }
}

/// Reads and writes one index file and its manifest.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
    use_mmap: bool,
    verify_checksum: bool,
}

impl IndexStore {
    /// Creates a store for `path` with memory mapping and checksum
    /// verification enabled.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            use_mmap: true,
            verify_checksum: true,
        }
    }

    /// Builds a store from the `[index]` config section, or `None` when no
    /// index file is configured.
    pub fn from_config(config: &IndexConfig) -> Option<Self> {
        config.index_file.as_ref().map(|path| Self {
            path: path.clone(),
            use_mmap: config.use_mmap,
            verify_checksum: config.verify_checksum,
        })
    }

    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(MANIFEST_SUFFIX);
        self.path.with_file_name(name)
    }

    /// Atomically writes `indices` and then its manifest.
    ///
    /// # Errors
    ///
    /// Returns a storage error if either file cannot be written.
    pub fn persist(&self, indices: &GlobalIndices) -> Result<IndexManifest> {
        let manifest = IndexManifest::for_indices(indices);

        write_atomic(&self.path, |writer| {
            for index in indices.as_slice() {
                writer.write_all(&index.to_le_bytes())?;
            }
            Ok(())
        })?;

        let manifest_path = self.manifest_path();
        let encoded = toml::to_string(&manifest).map_err(|e| {
            SamplerError::storage(&manifest_path, format!("failed to encode manifest: {e}"))
        })?;
        write_atomic(&manifest_path, |writer| writer.write_all(encoded.as_bytes()))?;

        tracing::info!(
            path = %self.path.display(),
            epoch = manifest.epoch,
            total_size = manifest.total_size,
            checksum = manifest.checksum,
            "persisted global indices"
        );
        Ok(manifest)
    }

    /// Loads the index file as a read-only view.
    ///
    /// When `expected_total_size` is given, the number of indices in the file
    /// must equal it.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file is missing or unreadable, its
    /// length is not a multiple of 4 bytes, or it holds an unexpected number
    /// of indices.
    pub fn load(&self, expected_total_size: Option<usize>) -> Result<IndexView> {
        let mut file = File::open(&self.path).map_err(|e| {
            let message = if e.kind() == io::ErrorKind::NotFound {
                "index file not found"
            } else {
                "failed to open index file"
            };
            SamplerError::storage_with_source(&self.path, message, e)
        })?;

        let size = file
            .metadata()
            .map_err(|e| {
                SamplerError::storage_with_source(&self.path, "failed to read file metadata", e)
            })?
            .len();

        if size % INDEX_WIDTH as u64 != 0 {
            return Err(SamplerError::storage(
                &self.path,
                format!("file length {size} is not a multiple of {INDEX_WIDTH} bytes"),
            ));
        }
        let total_size = usize::try_from(size / INDEX_WIDTH as u64).map_err(|_| {
            SamplerError::storage(&self.path, "index file too large for this platform")
        })?;

        if let Some(expected) = expected_total_size {
            if expected != total_size {
                return Err(SamplerError::storage(
                    &self.path,
                    format!("file holds {total_size} indices, expected {expected}"),
                ));
            }
        }

        let view = if self.use_mmap && size > 0 {
            // SAFETY: the file is opened read-only and index files are never
            // modified in place; new epochs replace them by rename.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                SamplerError::storage_with_source(&self.path, "failed to memory-map file", e)
            })?;
            IndexView::from_mmap(mmap)
        } else {
            let mut bytes = Vec::with_capacity(total_size * INDEX_WIDTH);
            file.read_to_end(&mut bytes).map_err(|e| {
                SamplerError::storage_with_source(&self.path, "failed to read index file", e)
            })?;
            if bytes.len() != total_size * INDEX_WIDTH {
                return Err(SamplerError::storage(
                    &self.path,
                    "index file changed size while reading",
                ));
            }
            let indices = bytes
                .chunks_exact(INDEX_WIDTH)
                .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                .collect();
            IndexView::from_vec(indices)
        };

        tracing::debug!(
            path = %self.path.display(),
            total_size,
            mapped = view.is_mapped(),
            "loaded global indices"
        );
        Ok(view)
    }

    /// Reads the manifest, or `None` if it has not been written yet.
    pub fn read_manifest(&self) -> Result<Option<IndexManifest>> {
        let path = self.manifest_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SamplerError::storage_with_source(
                    &path,
                    "failed to read manifest",
                    e,
                ))
            }
        };

        toml::from_str(&contents)
            .map(Some)
            .map_err(|e| SamplerError::storage(&path, format!("invalid manifest: {e}")))
    }

    /// Loads the index file and validates it against `manifest`: size always,
    /// content checksum when verification is enabled.
    pub fn load_verified(&self, manifest: &IndexManifest) -> Result<IndexView> {
        let view = self.load(Some(manifest.total_size))?;

        if self.verify_checksum {
            let actual = view.checksum();
            if actual != manifest.checksum {
                return Err(SamplerError::storage(
                    &self.path,
                    format!(
                        "checksum mismatch: manifest has {:#018x}, file has {actual:#018x}",
                        manifest.checksum
                    ),
                ));
            }
        }
        Ok(view)
    }

    /// Loads the file persisted for `plan` at `epoch`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if there is no manifest, the manifest
    /// describes another plan or epoch, or the file fails validation.
    pub fn load_for(&self, plan: &IndexPlan, epoch: u64) -> Result<IndexView> {
        let manifest = self.read_manifest()?.ok_or_else(|| {
            SamplerError::storage(self.manifest_path(), "manifest not found")
        })?;

        if !manifest.matches(plan, epoch) {
            return Err(SamplerError::storage(
                &self.path,
                format!(
                    "index file was built for epoch {} (length {}, world size {}), expected epoch {epoch} (length {}, world size {})",
                    manifest.epoch,
                    manifest.length,
                    manifest.world_size,
                    plan.length,
                    plan.world_size
                ),
            ));
        }

        self.load_verified(&manifest)
    }
}

/// Writes `target` through a uniquely named hidden temp file in the same
/// directory, synced to disk before it is renamed into place. Several leaders
/// may write the same target at once; the last rename wins.
fn write_atomic<F>(target: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> io::Result<()>,
{
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.exists() {
        fs::create_dir_all(&parent).map_err(|e| {
            SamplerError::storage_with_source(&parent, "failed to create parent directories", e)
        })?;
    }

    let file_name = target
        .file_name()
        .ok_or_else(|| SamplerError::storage(target, "path has no file name"))?;
    let mut prefix = OsString::from(".");
    prefix.push(file_name);
    prefix.push(".");

    // Removed on drop unless persisted.
    let temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(|e| SamplerError::storage_with_source(&parent, "failed to create temp file", e))?;

    write_and_sync(temp.as_file(), temp.path(), write)?;

    temp.persist(target).map_err(|e| {
        SamplerError::storage_with_source(target, "failed to rename temp file", e.error)
    })?;
    Ok(())
}

fn write_and_sync<F>(file: &File, path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> io::Result<()>,
{
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    write(&mut writer)
        .and_then(|()| writer.flush())
        .map_err(|e| SamplerError::storage_with_source(path, "failed to write file", e))?;

    file.sync_all()
        .map_err(|e| SamplerError::storage_with_source(path, "failed to sync file", e))
}

/// TOML integers are signed 64-bit, so full-range `u64` values are stored as
/// hex strings.
mod hex_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#018x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(&raw);
        u64::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::generate;
    use tempfile::TempDir;

    fn plan(length: usize, world_size: usize) -> IndexPlan {
        IndexPlan {
            length,
            world_size,
            seed: 1234,
            shuffle: true,
            drop_last: false,
        }
    }

    #[test]
    fn test_persist_layout_and_load() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("global_indices"));
        let indices = generate(&plan(37, 4), 2).unwrap();

        let manifest = store.persist(&indices).unwrap();
        assert_eq!(manifest.total_size, 40);
        assert_eq!(manifest.epoch, 2);

        // Raw little-endian u32 values, nothing else.
        let bytes = fs::read(store.path()).unwrap();
        let expected: Vec<u8> = indices
            .as_slice()
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect();
        assert_eq!(bytes, expected);

        let view = store.load(Some(40)).unwrap();
        assert!(view.is_mapped());
        assert_eq!(view.to_vec(), indices.as_slice());

        // Only the data file and the manifest remain.
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["global_indices", "global_indices.manifest.toml"]);
    }

    #[test]
    fn test_manifest_round_trip_full_range_seed() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("idx.bin"));
        let p = IndexPlan {
            seed: u64::MAX,
            ..plan(10, 2)
        };
        let indices = generate(&p, 7).unwrap();

        let written = store.persist(&indices).unwrap();
        let read = store.read_manifest().unwrap().unwrap();
        assert_eq!(written, read);
        assert_eq!(read.plan(), p);
        assert!(read.matches(&p, 7));
        assert!(!read.matches(&p, 8));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("absent"));
        assert!(store.load(None).unwrap_err().is_storage());
        assert!(store.read_manifest().unwrap().is_none());
        assert!(store.load_for(&plan(4, 1), 0).unwrap_err().is_storage());
    }

    #[test]
    fn test_length_not_multiple_of_width() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("truncated");
        fs::write(&path, [0u8; 7]).unwrap();

        let err = IndexStore::new(&path).load(None).unwrap_err();
        assert!(err.is_storage());
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn test_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("idx"));
        store.persist(&generate(&plan(8, 2), 0).unwrap()).unwrap();

        assert!(store.load(Some(8)).is_ok());
        assert!(store.load(Some(12)).unwrap_err().is_storage());
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("idx"));
        let p = plan(16, 4);
        let manifest = store.persist(&generate(&p, 0).unwrap()).unwrap();

        // Same size, different content.
        let other: Vec<u8> = (0u32..16).flat_map(|i| i.to_le_bytes()).collect();
        fs::write(store.path(), other).unwrap();

        let err = store.load_verified(&manifest).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(store.load_for(&p, 0).unwrap_err().is_storage());

        let lenient = store.clone().with_checksum_verification(false);
        assert_eq!(lenient.load_verified(&manifest).unwrap().len(), 16);
    }

    #[test]
    fn test_load_for_rejects_other_epoch() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("idx"));
        let p = plan(20, 4);
        store.persist(&generate(&p, 3).unwrap()).unwrap();

        assert!(store.load_for(&p, 3).is_ok());
        let err = store.load_for(&p, 4).unwrap_err();
        assert!(err.to_string().contains("epoch 3"));
    }

    #[test]
    fn test_empty_file_reads_into_memory() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("empty"));
        let manifest = store.persist(&generate(&plan(0, 4), 0).unwrap()).unwrap();

        let view = store.load_verified(&manifest).unwrap();
        assert!(view.is_empty());
        assert!(!view.is_mapped());
    }

    #[test]
    fn test_without_mmap() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("idx")).with_mmap(false);
        let indices = generate(&plan(9, 3), 1).unwrap();
        let manifest = store.persist(&indices).unwrap();

        let view = store.load_verified(&manifest).unwrap();
        assert!(!view.is_mapped());
        assert_eq!(view.to_vec(), indices.as_slice());
    }

    #[test]
    fn test_creates_parent_directories_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path().join("run/epochs/idx"));
        let p = plan(12, 3);

        store.persist(&generate(&p, 0).unwrap()).unwrap();
        let second = generate(&p, 1).unwrap();
        store.persist(&second).unwrap();

        assert_eq!(store.read_manifest().unwrap().unwrap().epoch, 1);
        assert_eq!(store.load_for(&p, 1).unwrap().to_vec(), second.as_slice());
    }

    #[test]
    fn test_concurrent_leaders_share_one_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("global_indices");
        let p = plan(200_000, 8);
        let indices = std::sync::Arc::new(generate(&p, 3).unwrap());

        for _ in 0..20 {
            let start = std::sync::Arc::new(std::sync::Barrier::new(2));
            let leaders: Vec<_> = (0..2)
                .map(|_| {
                    let store = IndexStore::new(&path);
                    let indices = indices.clone();
                    let start = start.clone();
                    std::thread::spawn(move || {
                        start.wait();
                        store.persist(&indices)
                    })
                })
                .collect();
            for leader in leaders {
                leader.join().unwrap().unwrap();
            }
        }

        let store = IndexStore::new(&path);
        assert_eq!(store.load_for(&p, 3).unwrap().to_vec(), indices.as_slice());

        // No temp files are left behind.
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(names.is_empty(), "{names:?}");
    }

    #[test]
    fn test_manifest_path() {
        let store = IndexStore::new("/data/run/global_indices.bin");
        assert_eq!(
            store.manifest_path(),
            PathBuf::from("/data/run/global_indices.bin.manifest.toml")
        );
    }
}
