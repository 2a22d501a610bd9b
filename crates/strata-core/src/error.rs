//! Error types for the subscriber core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_meta::MetaError;
use strata_origin::OriginError;
use strata_store::StoreError;

/// Why a single chunk could not be delivered.
///
/// Cloneable because one ticket outcome is broadcast to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkError {
    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error("chunk store error: {0}")]
    Store(String),

    #[error("origin omitted the chunk from its response")]
    Missing,

    #[error("fetch abandoned before completion")]
    Abandoned,
}

impl ChunkError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ChunkError::Origin(e) if e.is_unavailable())
    }
}

/// Errors surfaced to subscriber callers.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("slice out of range: {0}")]
    OutOfRange(String),

    #[error("no cached data and origin unreachable: {0}")]
    Unreachable(String),

    #[error("no cached data and origin timed out: {0}")]
    Timeout(String),

    #[error("{} of {total} chunks could not be fetched", failed.len())]
    PartialFetchFailure {
        failed: BTreeMap<u64, ChunkError>,
        total: usize,
    },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("origin error: {0}")]
    Origin(OriginError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Meta(#[from] MetaError),
}

impl CoreError {
    /// Convert an origin failure that left the caller with nothing to serve.
    pub fn from_origin(err: OriginError, context: &str) -> Self {
        match err {
            OriginError::Unreachable(reason) => {
                CoreError::Unreachable(format!("{}: {}", context, reason))
            }
            OriginError::Timeout => CoreError::Timeout(context.to_string()),
            OriginError::NotFound(what) => CoreError::NotFound(what),
            other => CoreError::Origin(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_origin_keeps_taxonomy() {
        let e = CoreError::from_origin(OriginError::Unreachable("refused".into()), "public:/a");
        assert!(matches!(e, CoreError::Unreachable(ref m) if m.contains("refused")));
        assert!(e.to_string().starts_with("no cached data and origin unreachable"));

        assert!(matches!(
            CoreError::from_origin(OriginError::Timeout, "x"),
            CoreError::Timeout(_)
        ));
        assert!(matches!(
            CoreError::from_origin(OriginError::NotFound("/a".into()), "x"),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from_origin(OriginError::Protocol("bad".into()), "x"),
            CoreError::Origin(_)
        ));
    }

    #[test]
    fn test_partial_failure_message() {
        let failed = BTreeMap::from([(3, ChunkError::Missing)]);
        let e = CoreError::PartialFetchFailure { failed, total: 8 };
        assert_eq!(e.to_string(), "1 of 8 chunks could not be fetched");
    }
}
