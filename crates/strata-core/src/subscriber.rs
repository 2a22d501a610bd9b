//! The subscriber facade: every client-facing operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strata_config::{log_fetch_debug, Config};
use strata_meta::{DatasetId, DatasetMeta, MetaCache};
use strata_origin::OriginClient;
use strata_store::{ChunkStore, StoreStats};

use crate::codec::{array_len, place_chunk, ChunkCodec, PassthroughCodec};
use crate::error::{ChunkError, CoreError, Result};
use crate::fetch::{ChunkStatus, FetchCoordinator};
use crate::freshness::FreshnessResolver;
use crate::planner::{chunk_region, plan, SlicePlan, SliceSpec};
use crate::roots::{RootSummary, RootTracker};

/// How `get_slice` returns chunk contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representation {
    /// Compressed bytes exactly as the origin produced them
    Raw,
    /// Raw row-major elements from the codec
    Decoded,
}

/// Contents of one chunk in a slice result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkData {
    Raw(Vec<u8>),
    Decoded(Vec<u8>),
}

/// One chunk of a slice result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRegion {
    pub index: u64,
    pub coord: Vec<u64>,
    /// Element range per dimension, `(start, stop)`, clipped to the array
    pub region: Vec<(u64, u64)>,
    pub status: ChunkStatus,
    pub data: ChunkData,
}

/// Slice result: delivered chunks in row-major order plus per-chunk failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceData {
    pub regions: Vec<SliceRegion>,
    pub failures: BTreeMap<u64, ChunkError>,
}

impl SliceData {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Cache-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub datasets: u64,
    pub chunks: u64,
    pub bytes: u64,
    pub subscribed_roots: u64,
    pub in_flight: u64,
}

/// Serves metadata, slices and downloads from cache, fetching on demand.
#[derive(Clone)]
pub struct Subscriber {
    meta: MetaCache,
    store: ChunkStore,
    freshness: FreshnessResolver,
    fetcher: FetchCoordinator,
    roots: RootTracker,
    codec: Arc<dyn ChunkCodec>,
}

impl Subscriber {
    /// Open the metadata cache and chunk store named by `config`.
    pub fn open(config: &Config, origin: Arc<dyn OriginClient>) -> Result<Self> {
        let meta = MetaCache::open(config.storage.meta_dir())?;
        let store = ChunkStore::new(config.storage.cache_root())?;
        Ok(Self::with_parts(config, meta, store, origin))
    }

    pub fn with_parts(
        config: &Config,
        meta: MetaCache,
        store: ChunkStore,
        origin: Arc<dyn OriginClient>,
    ) -> Self {
        Self {
            freshness: FreshnessResolver::new(
                meta.clone(),
                store.clone(),
                Arc::clone(&origin),
                config.freshness.clone(),
            ),
            fetcher: FetchCoordinator::new(store.clone(), Arc::clone(&origin), config.fetch.clone()),
            roots: RootTracker::new(
                meta.clone(),
                origin,
                config.origins.clone(),
                config.roots.clone(),
            ),
            codec: Arc::new(PassthroughCodec),
            meta,
            store,
        }
    }

    /// Replace the chunk codec used for decoded slices and downloads.
    pub fn with_codec(mut self, codec: Arc<dyn ChunkCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn meta(&self) -> &MetaCache {
        &self.meta
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Metadata of a dataset in a subscribed root.
    pub async fn get_info(&self, root: &str, path: &str) -> Result<DatasetMeta> {
        let id = self.dataset(root, path)?;
        self.freshness.resolve(&id).await
    }

    /// Chunks covering a slice, in row-major order.
    ///
    /// Chunks that could not be delivered are listed in `failures`. If
    /// nothing at all could be delivered the call fails.
    pub async fn get_slice(
        &self,
        root: &str,
        path: &str,
        spec: &SliceSpec,
        repr: Representation,
    ) -> Result<SliceData> {
        let id = self.dataset(root, path)?;
        let meta = self.freshness.resolve(&id).await?;
        let plan = plan(&meta, spec)?;
        let mut outcomes = self.fetcher.ensure(&id, meta.cached_at, &plan.indices()).await?;
        let key = id.storage_key();

        let mut data = SliceData::default();
        for chunk in &plan.chunks {
            let status = match outcomes.remove(&chunk.index) {
                Some(Ok(status)) => status,
                Some(Err(e)) => {
                    data.failures.insert(chunk.index, e);
                    continue;
                }
                None => {
                    data.failures.insert(chunk.index, ChunkError::Missing);
                    continue;
                }
            };
            let Some(stored) = self.store.read(&key, chunk.index)? else {
                data.failures.insert(chunk.index, ChunkError::Missing);
                continue;
            };
            let payload = match repr {
                Representation::Raw => ChunkData::Raw(stored.bytes),
                Representation::Decoded => {
                    ChunkData::Decoded(self.codec.decode(&meta, &stored.bytes)?)
                }
            };
            data.regions.push(SliceRegion {
                index: chunk.index,
                coord: chunk.coord.clone(),
                region: chunk_region(&meta, &chunk.coord)
                    .into_iter()
                    .map(|r| (r.start, r.end))
                    .collect(),
                status,
                data: payload,
            });
        }

        if data.regions.is_empty() && !data.failures.is_empty() {
            return Err(total_failure(&id, data.failures, plan.chunks.len()));
        }
        log_fetch_debug!(
            "Slice served",
            dataset = tracing::field::display(&id),
            chunks = data.regions.len(),
            failed = data.failures.len(),
        );
        Ok(data)
    }

    /// The whole dataset, decoded and reassembled row-major.
    ///
    /// Fails unless every chunk is available.
    pub async fn download(&self, root: &str, path: &str) -> Result<Vec<u8>> {
        let id = self.dataset(root, path)?;
        let meta = self.freshness.resolve(&id).await?;
        let plan: SlicePlan = plan(&meta, &SliceSpec::Whole)?;
        let mut out = vec![0u8; array_len(&meta)?];

        let outcomes = self.fetcher.ensure(&id, meta.cached_at, &plan.indices()).await?;
        let failed: BTreeMap<u64, ChunkError> = outcomes
            .into_iter()
            .filter_map(|(idx, outcome)| outcome.err().map(|e| (idx, e)))
            .collect();
        if !failed.is_empty() {
            return Err(if failed.len() == plan.chunks.len() {
                total_failure(&id, failed, plan.chunks.len())
            } else {
                CoreError::PartialFetchFailure {
                    failed,
                    total: plan.chunks.len(),
                }
            });
        }

        let key = id.storage_key();
        for chunk in &plan.chunks {
            let stored = self.store.read(&key, chunk.index)?.ok_or_else(|| {
                CoreError::PartialFetchFailure {
                    failed: BTreeMap::from([(chunk.index, ChunkError::Missing)]),
                    total: plan.chunks.len(),
                }
            })?;
            let decoded = self.codec.decode(&meta, &stored.bytes)?;
            place_chunk(&mut out, &meta, &chunk_region(&meta, &chunk.coord), &decoded)?;
        }
        Ok(out)
    }

    pub fn list_roots(&self) -> Result<Vec<RootSummary>> {
        self.roots.list_roots()
    }

    pub async fn subscribe(&self, root: &str) -> Result<()> {
        self.roots.subscribe(root).await
    }

    pub fn unsubscribe(&self, root: &str) -> Result<bool> {
        self.roots.unsubscribe(root)
    }

    pub async fn list_datasets(&self, root: &str) -> Result<Vec<String>> {
        self.roots.list(root).await
    }

    pub fn notify(&self, root: &str) -> Result<bool> {
        self.roots.notify(root)
    }

    pub async fn resync(&self, root: &str) -> Result<Vec<String>> {
        self.roots.resync(root).await
    }

    pub fn subscribed_roots(&self) -> Result<Vec<String>> {
        self.roots.subscribed_roots()
    }

    /// Drop metadata and chunks of datasets marked deleted in a root.
    /// Returns the purged paths.
    pub fn purge_deleted(&self, root: &str) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        for (id, meta) in self.meta.datasets_in_root(root)? {
            if !meta.deleted {
                continue;
            }
            self.store.remove_dataset(&id.storage_key())?;
            self.meta.remove(&id)?;
            purged.push(id.path);
        }
        Ok(purged)
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let StoreStats {
            dataset_count,
            chunk_count,
            total_bytes,
        } = self.store.stats()?;
        Ok(CacheStatus {
            datasets: dataset_count,
            chunks: chunk_count,
            bytes: total_bytes,
            subscribed_roots: self.roots.subscribed_roots()?.len() as u64,
            in_flight: self.fetcher.in_flight() as u64,
        })
    }

    fn dataset(&self, root: &str, path: &str) -> Result<DatasetId> {
        if !self.roots.is_subscribed(root)? {
            return Err(CoreError::NotFound(format!("root {} is not subscribed", root)));
        }
        Ok(DatasetId::new(root, path))
    }
}

/// Error for a request where no chunk could be delivered.
fn total_failure(id: &DatasetId, failed: BTreeMap<u64, ChunkError>, total: usize) -> CoreError {
    let all_timeouts = failed
        .values()
        .all(|e| matches!(e, ChunkError::Origin(strata_origin::OriginError::Timeout)));
    if all_timeouts {
        return CoreError::Timeout(id.to_string());
    }
    if failed.values().all(ChunkError::is_unavailable) {
        return CoreError::Unreachable(id.to_string());
    }
    CoreError::PartialFetchFailure { failed, total }
}
