//! # strata-meta
//!
//! Dataset metadata model and the metadata cache for the strata subscriber.
//!
//! A dataset's descriptive record (shape, chunk geometry, dtype, codec
//! parameters, attributes, origin modification time) lives apart from its
//! chunk bytes so that an `info` query never touches chunk data.
//!
//! ## Storage Backends
//!
//! - `MetaCache`: LMDB-backed, one JSON document per dataset plus one per root

pub mod lmdb;

pub use lmdb::MetaCache;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_config::path::normalize_dataset_path;

/// Errors that can occur during metadata operations
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid dataset metadata: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, MetaError>;

/// Identity of a dataset: the root it belongs to and its path within that root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub root: String,
    pub path: String,
}

impl DatasetId {
    /// Build an id, normalizing the dataset path.
    pub fn new(root: impl Into<String>, path: &str) -> Self {
        Self {
            root: root.into(),
            path: normalize_dataset_path(path),
        }
    }

    /// Record key: `root \0 path`. Sorting by key groups a root's datasets.
    pub fn key(&self) -> String {
        format!("{}\0{}", self.root, self.path)
    }

    /// Hex key used for on-disk chunk directories
    pub fn storage_key(&self) -> String {
        strata_config::path::dataset_key(&self.root, &self.path)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.path)
    }
}

/// Element type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// Opaque byte frames
    Bytes,
}

impl DType {
    /// Size of one element in bytes
    pub fn item_size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 | DType::Bytes => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }
}

/// Codec parameters recorded by the publisher. Passed through to the codec,
/// never interpreted by the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionParams {
    pub codec: String,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Free-form attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Metadata as reported by a publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginMeta {
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    pub block_shape: Vec<u64>,
    pub dtype: DType,
    #[serde(default)]
    pub compression: CompressionParams,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    pub mtime: DateTime<Utc>,
}

/// Cached dataset record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Extent of each dimension
    pub shape: Vec<u64>,
    /// Chunk extent per dimension (same rank as `shape`)
    pub chunk_shape: Vec<u64>,
    /// Sub-chunk compression unit, passed through
    pub block_shape: Vec<u64>,
    pub dtype: DType,
    pub compression: CompressionParams,
    pub attributes: BTreeMap<String, AttrValue>,
    /// Modification time the origin reported at the last successful probe
    pub origin_mtime: DateTime<Utc>,
    /// Local time of the last metadata refresh. Chunks fetched before this are stale.
    pub cached_at: DateTime<Utc>,
    /// Local time of the last successful origin probe
    pub probed_at: DateTime<Utc>,
    /// Absent from the root's listing at the last resync
    #[serde(default)]
    pub deleted: bool,
}

impl DatasetMeta {
    /// Build a fresh cache record from publisher metadata.
    pub fn from_origin(meta: OriginMeta, now: DateTime<Utc>) -> Self {
        Self {
            shape: meta.shape,
            chunk_shape: meta.chunk_shape,
            block_shape: meta.block_shape,
            dtype: meta.dtype,
            compression: meta.compression,
            attributes: meta.attributes,
            origin_mtime: meta.mtime,
            cached_at: now,
            probed_at: now,
            deleted: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Check the geometry invariants: equal ranks and non-zero chunk extents.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_shape.len() != self.shape.len() || self.block_shape.len() != self.shape.len() {
            return Err(MetaError::Invalid(format!(
                "rank mismatch: shape {:?}, chunk_shape {:?}, block_shape {:?}",
                self.shape, self.chunk_shape, self.block_shape
            )));
        }
        if let Some(dim) = self.chunk_shape.iter().position(|&c| c == 0) {
            return Err(MetaError::Invalid(format!("chunk_shape[{}] is zero", dim)));
        }
        Ok(())
    }

    /// True if chunk blobs of `other` map to the same element regions and
    /// byte layout as this record's. A changed layout orphans every
    /// cached chunk.
    pub fn same_layout(&self, other: &DatasetMeta) -> bool {
        self.shape == other.shape
            && self.chunk_shape == other.chunk_shape
            && self.block_shape == other.block_shape
            && self.dtype == other.dtype
            && self.compression == other.compression
    }

    /// Number of chunks along each dimension: `ceil(shape[i] / chunk_shape[i])`.
    pub fn grid_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }

    /// Total number of chunks in the grid
    pub fn chunk_count(&self) -> u64 {
        self.grid_shape().iter().product()
    }

    /// Number of elements in the whole array
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }
}

/// Reserved-prefix namespace carried by a root name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootScope {
    /// `~name`
    Personal,
    /// `@name`
    Shared,
    Public,
}

impl RootScope {
    pub fn of(name: &str) -> Self {
        if name.starts_with('~') {
            RootScope::Personal
        } else if name.starts_with('@') {
            RootScope::Shared
        } else {
            RootScope::Public
        }
    }
}

/// Subscription state of a root. There is no way back to "unknown" once subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootState {
    Subscribing,
    Subscribed,
}

/// Persistent record of a subscribed root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootRecord {
    pub name: String,
    pub origin_address: String,
    pub state: RootState,
    /// Dataset paths known at the last sync, in listing order
    pub last_listing: Vec<String>,
    pub listed_at: Option<DateTime<Utc>>,
    /// Set by an explicit change notification
    #[serde(default)]
    pub needs_refresh: bool,
}

impl RootRecord {
    pub fn new(name: impl Into<String>, origin_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin_address: origin_address.into(),
            state: RootState::Subscribing,
            last_listing: Vec::new(),
            listed_at: None,
            needs_refresh: false,
        }
    }

    pub fn subscribed(&self) -> bool {
        self.state == RootState::Subscribed
    }

    pub fn scope(&self) -> RootScope {
        RootScope::of(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_meta() -> DatasetMeta {
        let now = Utc::now();
        DatasetMeta::from_origin(
            OriginMeta {
                shape: vec![10, 20],
                chunk_shape: vec![5, 5],
                block_shape: vec![5, 5],
                dtype: DType::F32,
                compression: CompressionParams {
                    codec: "blosc".to_string(),
                    level: Some(5),
                    filters: vec!["shuffle".to_string()],
                },
                attributes: BTreeMap::from([
                    ("units".to_string(), AttrValue::from("kelvin")),
                    ("scale".to_string(), AttrValue::from(0.5)),
                ]),
                mtime: now,
            },
            now,
        )
    }

    #[test]
    fn test_grid_shape_rounds_up() {
        let mut meta = sample_meta();
        assert_eq!(meta.grid_shape(), vec![2, 4]);
        assert_eq!(meta.chunk_count(), 8);

        meta.shape = vec![11, 21];
        assert_eq!(meta.grid_shape(), vec![3, 5]);
    }

    #[test]
    fn test_validate_rank_mismatch() {
        let mut meta = sample_meta();
        meta.block_shape = vec![5];
        assert!(matches!(meta.validate(), Err(MetaError::Invalid(_))));
    }

    #[test]
    fn test_validate_zero_chunk() {
        let mut meta = sample_meta();
        meta.chunk_shape = vec![5, 0];
        assert!(meta.validate().is_err());
        assert!(sample_meta().validate().is_ok());
    }

    #[test]
    fn test_same_layout_ignores_times_and_attributes() {
        let meta = sample_meta();
        let mut later = meta.clone();
        later.cached_at = meta.cached_at + chrono::Duration::seconds(5);
        later.attributes.clear();
        assert!(meta.same_layout(&later));

        let mut reshaped = meta.clone();
        reshaped.shape = vec![10, 40];
        assert!(!meta.same_layout(&reshaped));

        let mut retyped = meta.clone();
        retyped.dtype = DType::F64;
        assert!(!meta.same_layout(&retyped));
    }

    #[test]
    fn test_dataset_id_normalizes_path() {
        let a = DatasetId::new("public", "runs/a/");
        let b = DatasetId::new("public", "/runs/a");
        assert_eq!(a, b);
        assert_eq!(a.key(), "public\0/runs/a");
        assert_eq!(a.to_string(), "public:/runs/a");
    }

    #[test]
    fn test_root_scope() {
        assert_eq!(RootScope::of("~alice"), RootScope::Personal);
        assert_eq!(RootScope::of("@lab"), RootScope::Shared);
        assert_eq!(RootScope::of("public"), RootScope::Public);
    }

    #[test]
    fn test_item_sizes() {
        assert_eq!(DType::Bytes.item_size(), 1);
        assert_eq!(DType::I16.item_size(), 2);
        assert_eq!(DType::F32.item_size(), 4);
        assert_eq!(DType::F64.item_size(), 8);
    }

    #[test]
    fn test_attributes_survive_json_and_bincode() {
        let meta = sample_meta();

        let json = serde_json::to_string(&meta).unwrap();
        let from_json: DatasetMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json, meta);

        let bin = bincode::serialize(&meta).unwrap();
        let from_bin: DatasetMeta = bincode::deserialize(&bin).unwrap();
        assert_eq!(from_bin.attributes, meta.attributes);
    }

    #[test]
    fn test_new_root_is_subscribing() {
        let root = RootRecord::new("@lab", "http://pub");
        assert!(!root.subscribed());
        assert_eq!(root.scope(), RootScope::Shared);
    }
}
