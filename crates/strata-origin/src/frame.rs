//! Chunk frame codec for ranged chunk responses.
//!
//! A body is a sequence of frames, each
//! `index (u64 LE) | len (u32 LE) | len bytes`.
//! Payload bytes are carried verbatim.

use crate::{OriginError, Result};

const FRAME_HEADER: usize = 8 + 4;

/// Encode `(index, bytes)` pairs into one body.
pub fn encode_frames<'a, I>(chunks: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (u64, &'a [u8])>,
{
    let mut out = Vec::new();
    for (index, bytes) in chunks {
        let len = u32::try_from(bytes.len()).map_err(|_| {
            OriginError::Protocol(format!("chunk {} too large: {} bytes", index, bytes.len()))
        })?;
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

/// Decode a body produced by [`encode_frames`].
pub fn decode_frames(mut data: &[u8]) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        if data.len() < FRAME_HEADER {
            return Err(OriginError::Protocol(format!(
                "truncated frame header ({} bytes left)",
                data.len()
            )));
        }
        let mut index = [0u8; 8];
        index.copy_from_slice(&data[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[8..FRAME_HEADER]);
        let index = u64::from_le_bytes(index);
        let len = u32::from_le_bytes(len) as usize;

        let rest = &data[FRAME_HEADER..];
        if rest.len() < len {
            return Err(OriginError::Protocol(format!(
                "frame for chunk {} declares {} bytes, {} available",
                index,
                len,
                rest.len()
            )));
        }
        frames.push((index, rest[..len].to_vec()));
        data = &rest[len..];
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let body = encode_frames([(3u64, &b"ab"[..])]).unwrap();
        assert_eq!(&body[..8], &3u64.to_le_bytes());
        assert_eq!(&body[8..12], &2u32.to_le_bytes());
        assert_eq!(&body[12..], b"ab");
    }

    #[test]
    fn test_multiple_and_empty_frames() {
        let body = encode_frames([(0u64, &b""[..]), (1, &b"xyz"[..])]).unwrap();
        let frames = decode_frames(&body).unwrap();
        assert_eq!(frames, vec![(0, vec![]), (1, b"xyz".to_vec())]);
        assert!(decode_frames(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_body() {
        let body = encode_frames([(9u64, &b"payload"[..])]).unwrap();
        assert!(matches!(
            decode_frames(&body[..body.len() - 1]),
            Err(OriginError::Protocol(_))
        ));
        assert!(matches!(
            decode_frames(&body[..5]),
            Err(OriginError::Protocol(_))
        ));
    }
}
