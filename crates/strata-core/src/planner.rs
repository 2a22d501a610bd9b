//! Slice planning: which chunks does a request touch?
//!
//! Chunks are enumerated in row-major order over the chunk grid (last
//! dimension fastest). Fetch and assembly both follow this order.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_meta::DatasetMeta;
use strata_store::ChunkStore;

use crate::error::{CoreError, Result};

/// Half-open element range along one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimSlice {
    pub start: u64,
    pub stop: u64,
    /// Element stride. Chunk selection ignores it; every chunk the
    /// `[start, stop)` span crosses is planned.
    pub step: u64,
}

impl DimSlice {
    pub fn new(start: u64, stop: u64) -> Self {
        Self {
            start,
            stop,
            step: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// Requested region of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceSpec {
    Whole,
    Dims(Vec<DimSlice>),
}

impl SliceSpec {
    /// Resolve to explicit per-dimension bounds, validating against `shape`.
    pub fn resolve(&self, shape: &[u64]) -> Result<Vec<DimSlice>> {
        let dims = match self {
            SliceSpec::Whole => return Ok(shape.iter().map(|&s| DimSlice::new(0, s)).collect()),
            SliceSpec::Dims(dims) => dims,
        };

        if dims.len() != shape.len() {
            return Err(CoreError::OutOfRange(format!(
                "slice has {} dimensions, dataset has {}",
                dims.len(),
                shape.len()
            )));
        }
        for (i, (d, &extent)) in dims.iter().zip(shape).enumerate() {
            if d.step == 0 {
                return Err(CoreError::OutOfRange(format!("dimension {}: step is zero", i)));
            }
            if !d.is_empty() && d.stop > extent {
                return Err(CoreError::OutOfRange(format!(
                    "dimension {}: stop {} exceeds extent {}",
                    i, d.stop, extent
                )));
            }
        }
        Ok(dims.clone())
    }
}

/// One chunk touched by a slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    /// Row-major flat index in the chunk grid
    pub index: u64,
    /// Coordinate in the chunk grid
    pub coord: Vec<u64>,
}

/// Ordered chunks covering a slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    pub bounds: Vec<DimSlice>,
    pub chunks: Vec<PlannedChunk>,
}

impl SlicePlan {
    pub fn indices(&self) -> Vec<u64> {
        self.chunks.iter().map(|c| c.index).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Plan indices split by what the store can already serve
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPlan {
    pub present: Vec<u64>,
    pub missing: Vec<u64>,
}

/// Compute the chunks a slice touches, in row-major order.
pub fn plan(meta: &DatasetMeta, spec: &SliceSpec) -> Result<SlicePlan> {
    meta.validate()
        .map_err(|e| CoreError::InvalidMetadata(e.to_string()))?;
    let bounds = spec.resolve(&meta.shape)?;
    let grid = meta.grid_shape();

    if bounds.iter().any(DimSlice::is_empty) {
        return Ok(SlicePlan {
            bounds,
            chunks: Vec::new(),
        });
    }

    let ranges: Vec<Range<u64>> = bounds
        .iter()
        .zip(&meta.chunk_shape)
        .map(|(d, &c)| (d.start / c)..((d.stop - 1) / c + 1))
        .collect();

    let mut chunks = Vec::new();
    let mut coord: Vec<u64> = ranges.iter().map(|r| r.start).collect();
    loop {
        chunks.push(PlannedChunk {
            index: linearize(&coord, &grid),
            coord: coord.clone(),
        });

        // Odometer step, last dimension fastest
        let mut dim = coord.len();
        loop {
            if dim == 0 {
                return Ok(SlicePlan { bounds, chunks });
            }
            dim -= 1;
            coord[dim] += 1;
            if coord[dim] < ranges[dim].end {
                break;
            }
            coord[dim] = ranges[dim].start;
        }
    }
}

/// Row-major flat index of a grid coordinate.
pub fn linearize(coord: &[u64], grid: &[u64]) -> u64 {
    coord
        .iter()
        .zip(grid)
        .fold(0, |acc, (&c, &g)| acc * g + c)
}

/// Element ranges a chunk covers, clipped to the array bounds.
pub fn chunk_region(meta: &DatasetMeta, coord: &[u64]) -> Vec<Range<u64>> {
    coord
        .iter()
        .zip(meta.chunk_shape.iter().zip(&meta.shape))
        .map(|(&c, (&cs, &s))| {
            let start = c * cs;
            start..(start + cs).min(s)
        })
        .collect()
}

/// Split planned indices into store hits valid for `epoch` and the rest.
pub fn partition(
    store: &ChunkStore,
    dataset: &str,
    epoch: DateTime<Utc>,
    indices: &[u64],
) -> Result<FetchPlan> {
    let mut out = FetchPlan::default();
    for &index in indices {
        if store.has(dataset, index, epoch)? {
            out.present.push(index);
        } else {
            out.missing.push(index);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use strata_meta::{DType, OriginMeta};

    fn meta(shape: &[u64], chunk_shape: &[u64]) -> DatasetMeta {
        DatasetMeta::from_origin(
            OriginMeta {
                shape: shape.to_vec(),
                chunk_shape: chunk_shape.to_vec(),
                block_shape: chunk_shape.to_vec(),
                dtype: DType::F32,
                compression: Default::default(),
                attributes: Default::default(),
                mtime: Utc::now(),
            },
            Utc::now(),
        )
    }

    fn dims(ranges: &[(u64, u64)]) -> SliceSpec {
        SliceSpec::Dims(ranges.iter().map(|&(a, b)| DimSlice::new(a, b)).collect())
    }

    #[test]
    fn test_single_chunk_1d() {
        let m = meta(&[1000], &[100]);
        let p = plan(&m, &dims(&[(250, 260)])).unwrap();
        assert_eq!(p.indices(), vec![2]);
    }

    #[test]
    fn test_2d_row_span() {
        let m = meta(&[10, 20], &[5, 5]);
        let p = plan(&m, &dims(&[(0, 2), (4, 8)])).unwrap();
        assert_eq!(p.indices(), vec![0, 1]);
        assert_eq!(p.chunks[1].coord, vec![0, 1]);
    }

    #[test]
    fn test_row_major_order() {
        let m = meta(&[10, 20], &[5, 5]);
        let p = plan(&m, &dims(&[(3, 7), (9, 11)])).unwrap();
        // rows 0..2, cols 1..3 in a 2x4 grid
        assert_eq!(p.indices(), vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_whole_dataset_equals_full_slice() {
        let m = meta(&[11, 7], &[5, 3]);
        let whole = plan(&m, &SliceSpec::Whole).unwrap();
        let full = plan(&m, &dims(&[(0, 11), (0, 7)])).unwrap();
        assert_eq!(whole, full);
        assert_eq!(whole.indices(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_slice() {
        let m = meta(&[10, 20], &[5, 5]);
        assert!(plan(&m, &dims(&[(3, 3), (0, 20)])).unwrap().is_empty());
        assert!(plan(&m, &dims(&[(0, 10), (8, 2)])).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_is_error() {
        let m = meta(&[10, 20], &[5, 5]);
        assert!(matches!(
            plan(&m, &dims(&[(0, 11), (0, 5)])),
            Err(CoreError::OutOfRange(_))
        ));
        assert!(matches!(
            plan(&m, &dims(&[(0, 5)])),
            Err(CoreError::OutOfRange(_))
        ));
        let zero_step = SliceSpec::Dims(vec![
            DimSlice { start: 0, stop: 5, step: 0 },
            DimSlice::new(0, 5),
        ]);
        assert!(matches!(plan(&m, &zero_step), Err(CoreError::OutOfRange(_))));
    }

    #[test]
    fn test_step_does_not_change_selection() {
        let m = meta(&[100], &[10]);
        let strided = SliceSpec::Dims(vec![DimSlice { start: 5, stop: 35, step: 20 }]);
        assert_eq!(plan(&m, &strided).unwrap().indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_scalar_dataset() {
        let m = meta(&[], &[]);
        assert_eq!(plan(&m, &SliceSpec::Whole).unwrap().indices(), vec![0]);
    }

    #[test]
    fn test_chunk_region_clips_edge() {
        let m = meta(&[11, 7], &[5, 3]);
        assert_eq!(chunk_region(&m, &[2, 2]), vec![10..11, 6..7]);
        assert_eq!(chunk_region(&m, &[0, 1]), vec![0..5, 3..6]);
    }

    /// Every rectangular sub-slice of a 3x4 chunk grid matches brute force.
    #[test]
    fn test_exhaustive_small_grid() {
        // 3x4 grid of 2x3 chunks, ragged last row and column
        let m = meta(&[5, 11], &[2, 3]);
        assert_eq!(m.grid_shape(), vec![3, 4]);

        for r0 in 0..5u64 {
            for r1 in (r0 + 1)..=5 {
                for c0 in 0..11u64 {
                    for c1 in (c0 + 1)..=11 {
                        let p = plan(&m, &dims(&[(r0, r1), (c0, c1)])).unwrap();

                        let mut expected = Vec::new();
                        for gr in 0..3u64 {
                            for gc in 0..4u64 {
                                let region = chunk_region(&m, &[gr, gc]);
                                let rows = region[0].start < r1 && r0 < region[0].end;
                                let cols = region[1].start < c1 && c0 < region[1].end;
                                if rows && cols {
                                    expected.push(gr * 4 + gc);
                                }
                            }
                        }

                        assert_eq!(p.indices(), expected, "slice [{r0}:{r1}, {c0}:{c1}]");
                        let unique: BTreeSet<_> = p.indices().into_iter().collect();
                        assert_eq!(unique.len(), p.chunks.len());
                    }
                }
            }
        }
    }

    #[test]
    fn test_partition_by_epoch() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(temp.path()).unwrap();
        let epoch = Utc::now();
        store.write("aa11", 1, b"x", epoch).unwrap();
        store
            .write("aa11", 2, b"old", epoch - chrono::Duration::seconds(5))
            .unwrap();

        let split = partition(&store, "aa11", epoch, &[0, 1, 2]).unwrap();
        assert_eq!(split.present, vec![1]);
        assert_eq!(split.missing, vec![0, 2]);
    }
}
