//! Chunk decoding seam and row-major reassembly.
//!
//! The subscriber never interprets compressed bytes itself. A [`ChunkCodec`]
//! turns one chunk blob into raw row-major elements; reassembly then copies
//! those elements into the output buffer.

use std::ops::Range;

use strata_meta::DatasetMeta;

use crate::error::{CoreError, Result};

/// Decodes compressed chunk blobs.
pub trait ChunkCodec: Send + Sync {
    /// Decode one chunk to raw row-major elements.
    ///
    /// Edge chunks may come back padded to the full `chunk_shape` or
    /// clipped to the array bounds; reassembly accepts either.
    fn decode(&self, meta: &DatasetMeta, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Codec for datasets stored without compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl ChunkCodec for PassthroughCodec {
    fn decode(&self, meta: &DatasetMeta, bytes: &[u8]) -> Result<Vec<u8>> {
        match meta.compression.codec.as_str() {
            "" | "none" | "raw" => Ok(bytes.to_vec()),
            other => Err(CoreError::Codec(format!("unsupported codec: {}", other))),
        }
    }
}

/// Bytes needed for the whole array.
pub fn array_len(meta: &DatasetMeta) -> Result<usize> {
    meta.element_count()
        .checked_mul(meta.dtype.item_size() as u64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            CoreError::InvalidMetadata(format!("array of shape {:?} is too large", meta.shape))
        })
}

/// Copy a decoded chunk covering `region` into a full-array buffer.
pub fn place_chunk(
    out: &mut [u8],
    meta: &DatasetMeta,
    region: &[Range<u64>],
    decoded: &[u8],
) -> Result<()> {
    let item = meta.dtype.item_size();
    let extents: Vec<u64> = region.iter().map(|r| r.end - r.start).collect();

    let region_elems: u64 = extents.iter().product();
    let padded_elems: u64 = meta.chunk_shape.iter().product();
    let src_shape: &[u64] = if decoded.len() as u64 == padded_elems * item as u64 {
        &meta.chunk_shape
    } else if decoded.len() as u64 == region_elems * item as u64 {
        &extents
    } else {
        return Err(CoreError::Codec(format!(
            "decoded chunk has {} bytes, expected {} or {}",
            decoded.len(),
            padded_elems * item as u64,
            region_elems * item as u64
        )));
    };

    let rank = region.len();
    if rank == 0 {
        out[..item].copy_from_slice(&decoded[..item]);
        return Ok(());
    }

    let dst_strides = strides(&meta.shape);
    let src_strides = strides(src_shape);
    let row = extents[rank - 1] as usize * item;
    if row == 0 {
        return Ok(());
    }

    // Walk every row of the region (all dims but the last)
    let mut offset = vec![0u64; rank - 1];
    loop {
        let mut dst = region[rank - 1].start;
        let mut src = 0u64;
        for d in 0..rank - 1 {
            dst += (region[d].start + offset[d]) * dst_strides[d];
            src += offset[d] * src_strides[d];
        }
        let dst = dst as usize * item;
        let src = src as usize * item;
        out[dst..dst + row].copy_from_slice(&decoded[src..src + row]);

        let mut d = rank - 1;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            offset[d] += 1;
            if offset[d] < extents[d] {
                break;
            }
            offset[d] = 0;
        }
    }
}

/// Row-major element strides for a shape
fn strides(shape: &[u64]) -> Vec<u64> {
    let mut out = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * shape[i + 1];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_meta::{DType, OriginMeta};

    fn meta(shape: &[u64], chunk_shape: &[u64], dtype: DType) -> DatasetMeta {
        DatasetMeta::from_origin(
            OriginMeta {
                shape: shape.to_vec(),
                chunk_shape: chunk_shape.to_vec(),
                block_shape: chunk_shape.to_vec(),
                dtype,
                compression: Default::default(),
                attributes: Default::default(),
                mtime: Utc::now(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_strides() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides(&[7]), vec![1]);
        assert!(strides(&[]).is_empty());
    }

    #[test]
    fn test_place_interior_chunk_2d() {
        // 4x4 array, 2x2 chunks; chunk (1, 0) covers rows 2..4, cols 0..2
        let m = meta(&[4, 4], &[2, 2], DType::U8);
        let mut out = vec![0u8; 16];
        place_chunk(&mut out, &m, &[2..4, 0..2], &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            out,
            vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0]
        );
    }

    #[test]
    fn test_place_edge_chunk_padded_or_clipped() {
        // 3x3 array, 2x2 chunks; chunk (1, 1) covers only element [2][2]
        let m = meta(&[3, 3], &[2, 2], DType::U8);

        let mut padded = vec![0u8; 9];
        place_chunk(&mut padded, &m, &[2..3, 2..3], &[9, 0, 0, 0]).unwrap();
        let mut clipped = vec![0u8; 9];
        place_chunk(&mut clipped, &m, &[2..3, 2..3], &[9]).unwrap();

        assert_eq!(padded, clipped);
        assert_eq!(padded[8], 9);

        // Padded chunk (0, 1): rows 0..2, col 2 only; source row stride is 2
        let mut out = vec![0u8; 9];
        place_chunk(&mut out, &m, &[0..2, 2..3], &[5, 0, 6, 0]).unwrap();
        assert_eq!(out, vec![0, 0, 5, 0, 0, 6, 0, 0, 0]);
    }

    #[test]
    fn test_place_multibyte_items() {
        let m = meta(&[2], &[2], DType::U16);
        let mut out = vec![0u8; 4];
        place_chunk(&mut out, &m, &[0..2], &[1, 0, 2, 0]).unwrap();
        assert_eq!(out, vec![1, 0, 2, 0]);
    }

    #[test]
    fn test_wrong_decoded_size() {
        let m = meta(&[4], &[2], DType::U8);
        let mut out = vec![0u8; 4];
        assert!(matches!(
            place_chunk(&mut out, &m, &[0..2], &[1, 2, 3]),
            Err(CoreError::Codec(_))
        ));
    }

    #[test]
    fn test_passthrough_rejects_compressed() {
        let mut m = meta(&[4], &[2], DType::U8);
        assert_eq!(PassthroughCodec.decode(&m, b"ab").unwrap(), b"ab");
        m.compression.codec = "blosc".to_string();
        assert!(PassthroughCodec.decode(&m, b"ab").is_err());
    }

    #[test]
    fn test_array_len() {
        assert_eq!(array_len(&meta(&[3, 5], &[1, 1], DType::F64)).unwrap(), 120);
    }
}
