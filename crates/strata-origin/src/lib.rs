//! # strata-origin
//!
//! Access to remote publishers.
//!
//! [`OriginClient`] is the only way the subscriber talks to a publisher.
//! Implementations are stateless per call and never cache; caching is the
//! job of the metadata cache and chunk store.
//!
//! - [`HttpOrigin`]: reference transport over HTTP (`reqwest`)
//! - [`mock::MockOrigin`]: in-memory publisher for tests (feature `mock`)

pub mod frame;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use http::HttpOrigin;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_meta::{DatasetId, OriginMeta};

/// Errors returned by a publisher call.
///
/// Cloneable so one outcome can be handed to every waiter on a fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginError {
    #[error("origin unreachable: {0}")]
    Unreachable(String),

    #[error("origin timed out")]
    Timeout,

    #[error("not found at origin: {0}")]
    NotFound(String),

    #[error("origin protocol error: {0}")]
    Protocol(String),
}

impl OriginError {
    /// Failures where the publisher could not answer at all.
    ///
    /// These are retried and fall back to cached data; `NotFound` and
    /// `Protocol` are answers and are not.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, OriginError::Unreachable(_) | OriginError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, OriginError>;

/// Result of a multi-chunk fetch.
///
/// Indices that failed individually appear in `errors`. An index requested
/// but present in neither map was silently omitted by the publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkBatch {
    pub chunks: BTreeMap<u64, Vec<u8>>,
    pub errors: BTreeMap<u64, OriginError>,
}

impl ChunkBatch {
    /// Outcome for one index, if the publisher reported one.
    pub fn take(&mut self, index: u64) -> Option<Result<Vec<u8>>> {
        if let Some(bytes) = self.chunks.remove(&index) {
            return Some(Ok(bytes));
        }
        self.errors.remove(&index).map(Err)
    }
}

/// Remote publisher contract.
#[async_trait]
pub trait OriginClient: Send + Sync {
    /// Dataset paths in a root, in publisher order
    async fn list_datasets(&self, root: &str) -> Result<Vec<String>>;

    /// Full descriptive metadata of a dataset
    async fn get_meta(&self, id: &DatasetId) -> Result<OriginMeta>;

    /// Current modification time of a dataset (cheap probe)
    async fn get_mtime(&self, id: &DatasetId) -> Result<DateTime<Utc>>;

    /// Compressed bytes of the given chunks.
    ///
    /// Must accept a single index. `Err` means the whole call failed;
    /// per-index failures go in [`ChunkBatch::errors`].
    async fn get_chunks(&self, id: &DatasetId, indices: &[u64]) -> Result<ChunkBatch>;
}

/// Group indices into half-open `[start, end)` runs of consecutive values.
///
/// Input order and duplicates do not matter; runs come out ascending.
pub fn contiguous_runs(indices: &[u64]) -> Vec<(u64, u64)> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for idx in sorted {
        match runs.last_mut() {
            Some((_, end)) if *end == idx => *end = idx + 1,
            _ => runs.push((idx, idx + 1)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_runs() {
        assert_eq!(contiguous_runs(&[]), vec![]);
        assert_eq!(contiguous_runs(&[7]), vec![(7, 8)]);
        assert_eq!(
            contiguous_runs(&[5, 1, 2, 3, 9, 10, 2]),
            vec![(1, 4), (5, 6), (9, 11)]
        );
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(OriginError::Timeout.is_unavailable());
        assert!(OriginError::Unreachable("refused".into()).is_unavailable());
        assert!(!OriginError::NotFound("/x".into()).is_unavailable());
        assert!(!OriginError::Protocol("bad".into()).is_unavailable());
    }

    #[test]
    fn test_batch_take() {
        let mut batch = ChunkBatch::default();
        batch.chunks.insert(1, b"one".to_vec());
        batch.errors.insert(2, OriginError::Timeout);

        assert_eq!(batch.take(1), Some(Ok(b"one".to_vec())));
        assert_eq!(batch.take(2), Some(Err(OriginError::Timeout)));
        assert_eq!(batch.take(1), None);
        assert_eq!(batch.take(3), None);
    }
}
