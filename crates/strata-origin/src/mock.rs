//! In-memory publisher for tests.
//!
//! Counts every call so tests can assert how often the subscriber reached
//! the origin, and can inject latency, unreachability and per-chunk
//! failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_meta::{CompressionParams, DType, DatasetId, OriginMeta};

use crate::{ChunkBatch, OriginClient, OriginError, Result};

struct MockDataset {
    meta: OriginMeta,
    chunks: BTreeMap<u64, Vec<u8>>,
    failing: BTreeSet<u64>,
}

#[derive(Default)]
struct MockState {
    /// root → path → dataset, in path order
    roots: BTreeMap<String, BTreeMap<String, MockDataset>>,
    fetch_counts: HashMap<(DatasetId, u64), usize>,
    latency: Duration,
}

/// Publisher held entirely in memory
#[derive(Default)]
pub struct MockOrigin {
    state: Mutex<MockState>,
    unreachable: AtomicBool,
    chunks_unreachable: AtomicBool,
    list_calls: AtomicUsize,
    meta_calls: AtomicUsize,
    mtime_calls: AtomicUsize,
    chunk_calls: AtomicUsize,
    chunks_in_flight: AtomicUsize,
    peak_chunks_in_flight: AtomicUsize,
}

/// Metadata for an uncompressed array, stamped now.
pub fn array_meta(shape: &[u64], chunk_shape: &[u64], dtype: DType) -> OriginMeta {
    OriginMeta {
        shape: shape.to_vec(),
        chunk_shape: chunk_shape.to_vec(),
        block_shape: chunk_shape.to_vec(),
        dtype,
        compression: CompressionParams {
            codec: "none".to_string(),
            level: None,
            filters: Vec::new(),
        },
        attributes: BTreeMap::new(),
        mtime: Utc::now(),
    }
}

impl MockOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty root.
    pub fn add_root(&self, root: &str) {
        self.with_state(|s| {
            s.roots.entry(root.to_string()).or_default();
        });
    }

    /// Publish a dataset with the given chunk bytes.
    pub fn add_dataset<I>(&self, root: &str, path: &str, meta: OriginMeta, chunks: I)
    where
        I: IntoIterator<Item = (u64, Vec<u8>)>,
    {
        let id = DatasetId::new(root, path);
        let dataset = MockDataset {
            meta,
            chunks: chunks.into_iter().collect(),
            failing: BTreeSet::new(),
        };
        self.with_state(|s| {
            s.roots.entry(id.root).or_default().insert(id.path, dataset);
        });
    }

    pub fn remove_dataset(&self, root: &str, path: &str) {
        let id = DatasetId::new(root, path);
        self.with_state(|s| {
            if let Some(datasets) = s.roots.get_mut(&id.root) {
                datasets.remove(&id.path);
            }
        });
    }

    /// Replace one chunk's bytes without touching the mtime.
    pub fn set_chunk(&self, root: &str, path: &str, index: u64, bytes: Vec<u8>) {
        self.with_dataset(root, path, |d| {
            d.chunks.insert(index, bytes);
        });
    }

    /// Move a dataset's modification time.
    pub fn set_mtime(&self, root: &str, path: &str, mtime: DateTime<Utc>) {
        self.with_dataset(root, path, |d| d.meta.mtime = mtime);
    }

    /// Make one chunk fail with a protocol error until cleared.
    pub fn fail_chunk(&self, root: &str, path: &str, index: u64, failing: bool) {
        self.with_dataset(root, path, |d| {
            if failing {
                d.failing.insert(index);
            } else {
                d.failing.remove(&index);
            }
        });
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail chunk fetches only; listings and metadata stay reachable.
    pub fn set_chunks_unreachable(&self, unreachable: bool) {
        self.chunks_unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    /// Times a chunk was sent to the subscriber
    pub fn fetch_count(&self, root: &str, path: &str, index: u64) -> usize {
        let key = (DatasetId::new(root, path), index);
        self.with_state(|s| s.fetch_counts.get(&key).copied().unwrap_or(0))
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn meta_calls(&self) -> usize {
        self.meta_calls.load(Ordering::SeqCst)
    }

    pub fn mtime_calls(&self) -> usize {
        self.mtime_calls.load(Ordering::SeqCst)
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    /// Most `get_chunks` calls ever running at once
    pub fn peak_chunk_concurrency(&self) -> usize {
        self.peak_chunks_in_flight.load(Ordering::SeqCst)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    fn with_dataset(&self, root: &str, path: &str, f: impl FnOnce(&mut MockDataset)) {
        let id = DatasetId::new(root, path);
        self.with_state(|s| {
            if let Some(d) = s.roots.get_mut(&id.root).and_then(|r| r.get_mut(&id.path)) {
                f(d);
            }
        });
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = self.with_state(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(OriginError::Unreachable("mock origin offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OriginClient for MockOrigin {
    async fn list_datasets(&self, root: &str) -> Result<Vec<String>> {
        self.enter(&self.list_calls).await?;
        self.with_state(|s| {
            s.roots
                .get(root)
                .map(|datasets| datasets.keys().cloned().collect())
                .ok_or_else(|| OriginError::NotFound(root.to_string()))
        })
    }

    async fn get_meta(&self, id: &DatasetId) -> Result<OriginMeta> {
        self.enter(&self.meta_calls).await?;
        self.with_state(|s| {
            s.roots
                .get(&id.root)
                .and_then(|r| r.get(&id.path))
                .map(|d| d.meta.clone())
                .ok_or_else(|| OriginError::NotFound(id.to_string()))
        })
    }

    async fn get_mtime(&self, id: &DatasetId) -> Result<DateTime<Utc>> {
        self.enter(&self.mtime_calls).await?;
        self.with_state(|s| {
            s.roots
                .get(&id.root)
                .and_then(|r| r.get(&id.path))
                .map(|d| d.meta.mtime)
                .ok_or_else(|| OriginError::NotFound(id.to_string()))
        })
    }

    async fn get_chunks(&self, id: &DatasetId, indices: &[u64]) -> Result<ChunkBatch> {
        let running = self.chunks_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_chunks_in_flight.fetch_max(running, Ordering::SeqCst);
        let result = self.serve_chunks(id, indices).await;
        self.chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MockOrigin {
    async fn serve_chunks(&self, id: &DatasetId, indices: &[u64]) -> Result<ChunkBatch> {
        self.enter(&self.chunk_calls).await?;
        if self.chunks_unreachable.load(Ordering::SeqCst) {
            return Err(OriginError::Unreachable("mock chunk server offline".to_string()));
        }
        self.with_state(|s| {
            let MockState {
                roots,
                fetch_counts,
                ..
            } = s;
            let dataset = roots
                .get(&id.root)
                .and_then(|r| r.get(&id.path))
                .ok_or_else(|| OriginError::NotFound(id.to_string()))?;

            let mut batch = ChunkBatch::default();
            for &index in indices {
                *fetch_counts.entry((id.clone(), index)).or_insert(0) += 1;
                if dataset.failing.contains(&index) {
                    batch.errors.insert(
                        index,
                        OriginError::Protocol(format!("injected failure for chunk {}", index)),
                    );
                } else if let Some(bytes) = dataset.chunks.get(&index) {
                    batch.chunks.insert(index, bytes.clone());
                } else {
                    batch
                        .errors
                        .insert(index, OriginError::NotFound(format!("{} chunk {}", id, index)));
                }
            }
            Ok(batch)
        })
    }
}
