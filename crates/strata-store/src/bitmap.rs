//! Sparse chunk-presence bitmap.
//!
//! One bit per flat chunk index. The bitmap grows on demand when a chunk
//! index beyond its current length is set, so a dataset whose grid grows
//! between metadata epochs keeps its existing bits.

const MAGIC: &[u8; 4] = b"STPB";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceBitmap {
    words: Vec<u64>,
}

impl PresenceBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u64) -> bool {
        let (word, bit) = Self::locate(index);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    pub fn set(&mut self, index: u64) {
        let (word, bit) = Self::locate(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    /// Clear a bit. Returns whether it was set.
    pub fn clear(&mut self, index: u64) -> bool {
        let (word, bit) = Self::locate(index);
        match self.words.get_mut(word) {
            Some(w) if *w & (1 << bit) != 0 => {
                *w &= !(1 << bit);
                true
            }
            _ => false,
        }
    }

    /// Number of set bits
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Set indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64u64)
                .filter(move |b| w & (1 << b) != 0)
                .map(move |b| i as u64 * 64 + b)
        })
    }

    /// Serialize as `STPB | word count (u64 LE) | words (u64 LE)*`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.words.len() * 8);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.words.len() as u64).to_le_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Parse the `to_bytes` format. Returns None on any malformation.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let rest = data.strip_prefix(MAGIC)?;
        let (len_bytes, rest) = rest.split_first_chunk::<8>()?;
        let len = usize::try_from(u64::from_le_bytes(*len_bytes)).ok()?;
        if rest.len() != len.checked_mul(8)? {
            return None;
        }
        let words = rest
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Some(Self { words })
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, index % 64)
    }
}
