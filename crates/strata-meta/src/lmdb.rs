//! LMDB-backed metadata cache.
//!
//! Two named databases in one environment:
//! - `datasets`: `root \0 path` → JSON `DatasetMeta`
//! - `roots`: root name → JSON `RootRecord`
//!
//! Readers use MVCC snapshots and never block each other or the writer.
//! LMDB admits one write transaction at a time, so every read-modify-write
//! on a dataset record is serialized.

use std::path::Path;

use chrono::{DateTime, Utc};
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use crate::{DatasetId, DatasetMeta, Result, RootRecord};

/// Metadata cache backed by LMDB
#[derive(Clone)]
pub struct MetaCache {
    env: Env,
    datasets: Database<Str, SerdeJson<DatasetMeta>>,
    roots: Database<Str, SerdeJson<RootRecord>>,
}

impl MetaCache {
    /// Default LMDB map size: 1GB (expandable)
    const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

    /// Maximum readers
    const MAX_READERS: u32 = 256;

    /// Open or create the cache at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        // SAFETY: the environment directory is owned by this process's cache
        // and is not opened twice with different options.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_readers(Self::MAX_READERS)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let datasets = env.create_database(&mut wtxn, Some("datasets"))?;
        let roots = env.create_database(&mut wtxn, Some("roots"))?;
        wtxn.commit()?;

        debug!("Opened metadata cache at {:?}", path);

        Ok(Self {
            env,
            datasets,
            roots,
        })
    }

    /// Get a dataset record
    pub fn get(&self, id: &DatasetId) -> Result<Option<DatasetMeta>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.datasets.get(&rtxn, &id.key())?)
    }

    /// Insert or replace a dataset record
    pub fn put(&self, id: &DatasetId, meta: &DatasetMeta) -> Result<()> {
        meta.validate()?;
        let mut wtxn = self.env.write_txn()?;
        self.datasets.put(&mut wtxn, &id.key(), meta)?;
        wtxn.commit()?;
        debug!(dataset = %id, "Stored dataset metadata");
        Ok(())
    }

    /// Record a successful probe that found the origin unchanged.
    ///
    /// Updates `origin_mtime` and `probed_at` but leaves `cached_at` alone, so
    /// chunks fetched in the current epoch stay valid. Returns false if the
    /// dataset has no record.
    pub fn touch_mtime(
        &self,
        id: &DatasetId,
        probed_mtime: DateTime<Utc>,
        probed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let key = id.key();
        let mut wtxn = self.env.write_txn()?;
        let Some(mut meta) = self.datasets.get(&wtxn, &key)? else {
            return Ok(false);
        };
        meta.origin_mtime = probed_mtime;
        meta.probed_at = probed_at;
        self.datasets.put(&mut wtxn, &key, &meta)?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Flag or unflag a dataset as deleted at the origin. Returns false if absent.
    pub fn set_deleted(&self, id: &DatasetId, deleted: bool) -> Result<bool> {
        let key = id.key();
        let mut wtxn = self.env.write_txn()?;
        let Some(mut meta) = self.datasets.get(&wtxn, &key)? else {
            return Ok(false);
        };
        if meta.deleted != deleted {
            meta.deleted = deleted;
            self.datasets.put(&mut wtxn, &key, &meta)?;
            wtxn.commit()?;
        }
        Ok(true)
    }

    /// Remove a dataset record
    pub fn remove(&self, id: &DatasetId) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.datasets.delete(&mut wtxn, &id.key())?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// All cached dataset records of a root, ordered by path
    pub fn datasets_in_root(&self, root: &str) -> Result<Vec<(DatasetId, DatasetMeta)>> {
        let rtxn = self.env.read_txn()?;
        let prefix = format!("{}\0", root);
        let mut result = Vec::new();
        for item in self.datasets.prefix_iter(&rtxn, &prefix)? {
            let (key, meta) = item?;
            let path = &key[prefix.len()..];
            result.push((DatasetId::new(root, path), meta));
        }
        Ok(result)
    }

    /// Get a root record
    pub fn get_root(&self, name: &str) -> Result<Option<RootRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.roots.get(&rtxn, name)?)
    }

    /// Insert or replace a root record
    pub fn put_root(&self, root: &RootRecord) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.roots.put(&mut wtxn, &root.name, root)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Remove a root record
    pub fn remove_root(&self, name: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let removed = self.roots.delete(&mut wtxn, name)?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// All root records, ordered by name
    pub fn roots(&self) -> Result<Vec<RootRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut result = Vec::new();
        for item in self.roots.iter(&rtxn)? {
            let (_, root) = item?;
            result.push(root);
        }
        Ok(result)
    }

    /// Sync/flush LMDB to disk
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}
