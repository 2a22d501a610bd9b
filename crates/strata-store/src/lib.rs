//! # strata-store
//!
//! On-disk chunk store for the strata subscriber.
//!
//! Each dataset gets its own directory holding one blob file per cached
//! chunk plus a presence bitmap. Blob payloads are kept byte-identical to
//! what the origin sent; the store never re-encodes.
//!
//! ## Directory Layout
//!
//! ```text
//! <cache_root>/
//! └── ab/
//!     └── abcd1234...ef/          # BLAKE3 dataset key
//!         ├── presence.bin        # bitmap of present chunk indices
//!         └── chunks/
//!             └── 17.chunk        # header + payload for flat index 17
//! ```
//!
//! ## Chunk File Format
//!
//! `STCK | fetched_at (i64 ns LE) | BLAKE3(payload) | payload`
//!
//! ## Freshness
//!
//! A chunk is valid for a metadata epoch if its `fetched_at` is not older
//! than the epoch start. Epoch changes never touch the files; old chunks
//! simply stop answering `has()` until re-fetched.

mod bitmap;

pub use bitmap::PresenceBitmap;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const CHUNK_MAGIC: &[u8; 4] = b"STCK";
const HEADER_LEN: usize = 4 + 8 + 32;
const PRESENCE_FILE: &str = "presence.bin";
const CHUNKS_DIR: &str = "chunks";

/// Counter making temp file names unique across tasks sharing a thread
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors that can occur during chunk store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid dataset key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A chunk read back from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-dataset in-memory index
#[derive(Debug)]
struct DatasetChunks {
    dir: PathBuf,
    presence: RwLock<PresenceBitmap>,
    /// fetched_at (ns) per chunk, filled lazily from file headers
    fetched: DashMap<u64, i64>,
    dirty: AtomicBool,
}

impl DatasetChunks {
    fn chunk_path(&self, index: u64) -> PathBuf {
        self.dir.join(CHUNKS_DIR).join(format!("{}.chunk", index))
    }

    fn is_present(&self, index: u64) -> bool {
        self.presence
            .read()
            .map(|bm| bm.get(index))
            .unwrap_or(false)
    }

    fn mark_present(&self, index: u64, fetched_at: i64) {
        self.fetched.insert(index, fetched_at);
        if let Ok(mut bm) = self.presence.write() {
            bm.set(index);
        }
        self.dirty.store(true, Ordering::Release);
    }

    fn mark_absent(&self, index: u64) -> bool {
        self.fetched.remove(&index);
        let was_set = self
            .presence
            .write()
            .map(|mut bm| bm.clear(index))
            .unwrap_or(false);
        self.dirty.store(true, Ordering::Release);
        was_set
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Dataset directories on disk
    pub dataset_count: u64,
    /// Chunk blob files on disk
    pub chunk_count: u64,
    /// Total bytes of chunk files (headers included)
    pub total_bytes: u64,
}

/// On-disk chunk store
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
    datasets: Arc<DashMap<String, Arc<DatasetChunks>>>,
}

impl ChunkStore {
    /// Create a new chunk store at the given root directory.
    ///
    /// The directory will be created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            datasets: Arc::new(DashMap::new()),
        })
    }

    /// Get the root path of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a dataset's chunks
    pub fn dataset_dir(&self, dataset: &str) -> Result<PathBuf> {
        if dataset.len() < 2 || !dataset.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(StoreError::InvalidKey(dataset.to_string()));
        }
        Ok(self.root.join(&dataset[..2]).join(dataset))
    }

    /// True if the chunk is present and was fetched no earlier than `epoch`.
    pub fn has(&self, dataset: &str, index: u64, epoch: DateTime<Utc>) -> Result<bool> {
        let chunks = self.load(dataset)?;
        if !chunks.is_present(index) {
            return Ok(false);
        }
        match self.fetched_at(&chunks, index)? {
            Some(ns) => Ok(ns >= epoch_nanos(epoch)),
            None => Ok(false),
        }
    }

    /// True if any blob is present for the chunk, regardless of epoch.
    pub fn is_present(&self, dataset: &str, index: u64) -> Result<bool> {
        Ok(self.load(dataset)?.is_present(index))
    }

    /// Read a chunk. Returns None if absent.
    ///
    /// A blob that fails its integrity check is dropped and reported absent.
    #[instrument(skip(self), level = "debug")]
    pub fn read(&self, dataset: &str, index: u64) -> Result<Option<StoredChunk>> {
        let chunks = self.load(dataset)?;
        if !chunks.is_present(index) {
            return Ok(None);
        }

        let path = chunks.chunk_path(index);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                chunks.mark_absent(index);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match decode_chunk_file(&data) {
            Some((fetched_at, payload)) => {
                chunks.fetched.insert(index, fetched_at);
                Ok(Some(StoredChunk {
                    bytes: payload.to_vec(),
                    fetched_at: DateTime::from_timestamp_nanos(fetched_at),
                }))
            }
            None => {
                warn!(path = %path.display(), "Dropping corrupted chunk file");
                let _ = fs::remove_file(&path);
                chunks.mark_absent(index);
                Ok(None)
            }
        }
    }

    /// Write a chunk atomically.
    ///
    /// The blob is written to a uniquely named temp file and renamed into
    /// place, so concurrent readers see either the previous file or the
    /// complete new one.
    #[instrument(skip(self, bytes), level = "debug", fields(len = bytes.len()))]
    pub fn write(
        &self,
        dataset: &str,
        index: u64,
        bytes: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let chunks = self.load(dataset)?;
        let path = chunks.chunk_path(index);
        let ns = epoch_nanos(fetched_at);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_file_name(format!(
            "{}.{}.{}.tmp",
            index,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = File::create(&temp_path)?;
        file.write_all(CHUNK_MAGIC)?;
        file.write_all(&ns.to_le_bytes())?;
        file.write_all(blake3::hash(bytes).as_bytes())?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io(e));
        }

        chunks.mark_present(index, ns);
        Ok(())
    }

    /// Drop a chunk. Returns whether it was present.
    pub fn invalidate(&self, dataset: &str, index: u64) -> Result<bool> {
        let chunks = self.load(dataset)?;
        match fs::remove_file(chunks.chunk_path(index)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(chunks.mark_absent(index))
    }

    /// Indices with a blob on disk, ascending.
    pub fn present_indices(&self, dataset: &str) -> Result<Vec<u64>> {
        let chunks = self.load(dataset)?;
        let indices = chunks
            .presence
            .read()
            .map(|bm| bm.iter().collect())
            .unwrap_or_default();
        Ok(indices)
    }

    /// Persist the dataset's presence bitmap if it changed.
    pub fn flush(&self, dataset: &str) -> Result<()> {
        let Some(chunks) = self.datasets.get(dataset).map(|c| Arc::clone(&c)) else {
            return Ok(());
        };
        if !chunks.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let bytes = chunks
            .presence
            .read()
            .map(|bm| bm.to_bytes())
            .unwrap_or_default();
        let path = chunks.dir.join(PRESENCE_FILE);
        let temp_path = chunks.dir.join(format!(
            "{}.{}.tmp",
            PRESENCE_FILE,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&chunks.dir)?;
        let result = fs::write(&temp_path, &bytes).and_then(|_| fs::rename(&temp_path, &path));
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            chunks.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        debug!(dataset, "Flushed presence bitmap");
        Ok(())
    }

    /// Delete every chunk of a dataset.
    pub fn remove_dataset(&self, dataset: &str) -> Result<()> {
        let dir = self.dataset_dir(dataset)?;
        self.datasets.remove(dataset);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get statistics about the store.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(4) {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("walkdir loop"))
            })?;
            match entry.depth() {
                2 if entry.file_type().is_dir() => stats.dataset_count += 1,
                4 if entry.file_type().is_file() => {
                    if entry.path().extension().is_some_and(|ext| ext == "chunk") {
                        stats.chunk_count += 1;
                        stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                    }
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    fn load(&self, dataset: &str) -> Result<Arc<DatasetChunks>> {
        if let Some(chunks) = self.datasets.get(dataset) {
            return Ok(Arc::clone(&chunks));
        }

        let dir = self.dataset_dir(dataset)?;
        let presence = match fs::read(dir.join(PRESENCE_FILE)) {
            Ok(bytes) => match PresenceBitmap::from_bytes(&bytes) {
                Some(bm) => bm,
                None => {
                    warn!(dataset, "Presence bitmap unreadable, rebuilding");
                    scan_chunks(&dir)?
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => scan_chunks(&dir)?,
            Err(e) => return Err(e.into()),
        };

        let loaded = Arc::new(DatasetChunks {
            dir,
            presence: RwLock::new(presence),
            fetched: DashMap::new(),
            dirty: AtomicBool::new(false),
        });
        // Another caller may have loaded concurrently; keep whichever landed first.
        let entry = self
            .datasets
            .entry(dataset.to_string())
            .or_insert(loaded);
        Ok(Arc::clone(&entry))
    }

    fn fetched_at(&self, chunks: &DatasetChunks, index: u64) -> Result<Option<i64>> {
        if let Some(ns) = chunks.fetched.get(&index) {
            return Ok(Some(*ns));
        }

        let path = chunks.chunk_path(index);
        let mut header = [0u8; HEADER_LEN];
        let read = File::open(&path).and_then(|mut f| f.read_exact(&mut header));
        match read {
            Ok(()) => {}
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                chunks.mark_absent(index);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        if &header[..4] != CHUNK_MAGIC {
            warn!(path = %path.display(), "Dropping chunk file with bad header");
            let _ = fs::remove_file(&path);
            chunks.mark_absent(index);
            return Ok(None);
        }
        let mut ns_bytes = [0u8; 8];
        ns_bytes.copy_from_slice(&header[4..12]);
        let ns = i64::from_le_bytes(ns_bytes);
        chunks.fetched.insert(index, ns);
        Ok(Some(ns))
    }
}

fn epoch_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Split a chunk file into (fetched_at ns, payload), verifying the checksum.
fn decode_chunk_file(data: &[u8]) -> Option<(i64, &[u8])> {
    if data.len() < HEADER_LEN || &data[..4] != CHUNK_MAGIC {
        return None;
    }
    let mut ns_bytes = [0u8; 8];
    ns_bytes.copy_from_slice(&data[4..12]);
    let payload = &data[HEADER_LEN..];
    if blake3::hash(payload).as_bytes() != &data[12..HEADER_LEN] {
        return None;
    }
    Some((i64::from_le_bytes(ns_bytes), payload))
}

/// Rebuild a presence bitmap from the chunk files on disk.
fn scan_chunks(dir: &Path) -> Result<PresenceBitmap> {
    let mut bm = PresenceBitmap::new();
    let chunks_dir = dir.join(CHUNKS_DIR);
    let entries = match fs::read_dir(&chunks_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(bm),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "chunk") {
            if let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                bm.set(index);
            }
        }
    }
    Ok(bm)
}
