//! Exact nearest-neighbour index over raw `f32` vectors.
//!
//! A [`FlatIndex`] stores every vector verbatim in one contiguous buffer and
//! answers queries by brute-force squared Euclidean distance. The
//! dimensionality is fixed at construction; adding a vector of any other
//! length fails with [`RagError::DimensionMismatch`].
//!
//! # File format
//!
//! ```text
//! offset  size   field
//! 0       4      magic "DQFX"
//! 4       4      version (u32 LE, currently 1)
//! 8       4      dim (u32 LE)
//! 12      8      count (u64 LE)
//! 20      4·d·n  vectors, row-major, f32 LE
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{RagError, Result};

const MAGIC: &[u8; 4] = b"DQFX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index of the given dimensionality.
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(RagError::InvalidInput(
                "index dimensionality must be > 0".to_string(),
            ));
        }
        Ok(Self {
            dim,
            data: Vec::new(),
        })
    }

    /// The degenerate placeholder written when a category holds no vectors.
    pub fn empty_placeholder() -> Self {
        Self {
            dim: 1,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        self.check_dim(vector.len())?;
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Copy out the vector stored at `position`.
    pub fn reconstruct(&self, position: usize) -> Result<Vec<f32>> {
        if position >= self.len() {
            return Err(RagError::InvalidInput(format!(
                "position {} out of range for index of {} vectors",
                position,
                self.len()
            )));
        }
        let start = position * self.dim;
        Ok(self.data[start..start + self.dim].to_vec())
    }

    /// Copy out `n` consecutive vectors starting at `start`.
    pub fn reconstruct_n(&self, start: usize, n: usize) -> Result<Vec<Vec<f32>>> {
        (start..start + n).map(|i| self.reconstruct(i)).collect()
    }

    /// Return up to `k` `(position, squared_distance)` pairs, nearest first.
    ///
    /// Ties keep insertion order. Asking for more than [`len`](Self::len)
    /// results returns every stored vector.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        self.check_dim(query.len())?;
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, v)| (i, squared_l2(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.dim {
            return Err(RagError::DimensionMismatch {
                expected: self.dim,
                actual,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for &v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(RagError::Corrupt("not a flat index file".to_string()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != VERSION {
            return Err(RagError::Corrupt(format!(
                "unsupported flat index version {}",
                version
            )));
        }
        let dim = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        if dim == 0 {
            return Err(RagError::Corrupt("flat index has zero dimensions".to_string()));
        }
        let payload = &bytes[HEADER_LEN..];
        let expected = dim
            .checked_mul(count)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| RagError::Corrupt("flat index header overflows".to_string()))?;
        if payload.len() != expected {
            return Err(RagError::Corrupt(format!(
                "flat index payload is {} bytes, header promises {}",
                payload.len(),
                expected
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { dim, data })
    }

    /// Write the index to `path`, flushing it to disk before returning.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

/// Squared Euclidean distance between two equal-length vectors.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(vectors: &[Vec<f32>]) -> FlatIndex {
        let mut index = FlatIndex::new(vectors[0].len()).unwrap();
        for v in vectors {
            index.add(v).unwrap();
        }
        index
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = index_of(&[vec![0.0, 0.0], vec![5.0, 5.0], vec![1.0, 1.0]]);
        let hits = index.search(&[0.9, 0.9], 3).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.0).collect();
        assert_eq!(order, vec![2, 0, 1]);
        assert!((hits[0].1 - 0.02).abs() < 1e-5);
    }

    #[test]
    fn test_k_larger_than_len_returns_all() {
        let index = index_of(&[vec![1.0], vec![2.0]]);
        assert_eq!(index.search(&[0.0], 10).unwrap().len(), 2);
    }

    #[test]
    fn test_add_rejects_wrong_dim() {
        let mut index = FlatIndex::new(3).unwrap();
        let err = index.add(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_placeholder_rejects_real_query() {
        let index = FlatIndex::empty_placeholder();
        assert_eq!(index.dim(), 1);
        assert!(matches!(
            index.search(&[0.1; 8], 3),
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_reconstruct() {
        let index = index_of(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(index.reconstruct(1).unwrap(), vec![3.0, 4.0]);
        assert_eq!(index.reconstruct_n(0, 2).unwrap().len(), 2);
        assert!(index.reconstruct(2).is_err());
    }

    #[test]
    fn test_bytes_rejects_truncated_payload() {
        let index = index_of(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let mut bytes = index.to_bytes();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            FlatIndex::from_bytes(&bytes),
            Err(RagError::Corrupt(_))
        ));
        assert!(FlatIndex::from_bytes(b"nope").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index.idx");
        let index = index_of(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        index.write_to(&path).unwrap();
        let restored = FlatIndex::read_from(&path).unwrap();
        assert_eq!(restored, index);
    }
}
