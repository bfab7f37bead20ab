//! Persisted nearest-neighbor index over fixed-dimension `f32` vectors.
//!
//! [`VectorIndex`] is the search contract the retriever depends on;
//! [`FlatIndex`] is the exact (brute force) implementation backed by the
//! `RAGIDX01` file format.
//!
//! # File Format
//!
//! All integers and floats are little-endian.
//!
//! ```text
//! offset  size        field
//! 0       8           magic "RAGIDX01"
//! 8       1           metric (0 = L2 squared, 1 = inner product)
//! 9       3           reserved, zero
//! 12      4           dims (u32)
//! 16      8           count (u64)
//! 24      32          store fingerprint (SHA-256, all zero = unlinked)
//! 56      count*dims*4 vectors, row i has id i
//! ```
//!
//! The metric lives in the header so a search never assumes a different
//! metric than the one the vectors were built for.

use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};
use crate::models::{Metric, SENTINEL_ID};

const MAGIC: &[u8; 8] = b"RAGIDX01";
const HEADER_LEN: usize = 56;

/// A row-major batch of query vectors (`rows × dims`).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBatch {
    dims: usize,
    data: Vec<f32>,
}

impl QueryBatch {
    /// Reshape a single query vector into a batch of one row.
    pub fn single(vector: Vec<f32>) -> Self {
        Self {
            dims: vector.len(),
            data: vector,
        }
    }

    /// Build a batch from equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dims = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != dims) {
            return Err(RagError::InvalidArgument(
                "query rows must all have the same width".to_string(),
            ));
        }
        Ok(Self {
            dims,
            data: rows.concat(),
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dims.max(1))
    }
}

/// Search output: `k` slots per query row, row-major.
///
/// `k` is the effective width, never more than the requested `k`. Slots the
/// index cannot fill carry [`SENTINEL_ID`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHits {
    pub k: usize,
    pub distances: Vec<f32>,
    pub ids: Vec<i64>,
}

impl SearchHits {
    /// Number of query rows.
    pub fn rows(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.ids.len() / self.k
        }
    }

    /// `(distance, id)` pairs for one query row, in native metric order.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (f32, i64)> + '_ {
        let start = i * self.k;
        let end = (start + self.k).min(self.ids.len());
        let start = start.min(end);
        self.distances[start..end]
            .iter()
            .copied()
            .zip(self.ids[start..end].iter().copied())
    }
}

/// Nearest-neighbor search contract.
///
/// Implementations are immutable after load and must be safe for
/// concurrent read-only queries.
pub trait VectorIndex: Send + Sync {
    /// Vector width the index was built with.
    fn dims(&self) -> usize;
    /// Metric the index was built with.
    fn metric(&self) -> Metric;
    /// Number of stored vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the `k` nearest stored vectors for every query row.
    ///
    /// Rows are at most `k` wide. An index with fewer than `k` vectors returns
    /// all of them; an empty index returns one sentinel slot per row.
    ///
    /// # Errors
    ///
    /// [`RagError::InvalidArgument`] if `k <= 0` or a row width differs
    /// from [`dims`](VectorIndex::dims).
    fn search(&self, queries: &QueryBatch, k: i64) -> Result<SearchHits>;
}

/// Exact brute-force index loaded fully into memory.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    metric: Metric,
    dims: usize,
    vectors: Vec<f32>,
    store_fingerprint: Option<[u8; 32]>,
}

impl FlatIndex {
    /// Build an index from in-memory rows. Row `i` receives id `i`.
    pub fn from_vectors(metric: Metric, dims: usize, rows: &[Vec<f32>]) -> Result<Self> {
        if dims == 0 {
            return Err(RagError::InvalidArgument(
                "index dimension must be > 0".to_string(),
            ));
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dims) {
            return Err(RagError::InvalidArgument(format!(
                "row {} has {} dims, expected {}",
                i,
                row.len(),
                dims
            )));
        }
        Ok(Self {
            metric,
            dims,
            vectors: rows.concat(),
            store_fingerprint: None,
        })
    }

    /// Link this index to a document store by the store file's fingerprint.
    pub fn with_store_fingerprint(mut self, fingerprint: [u8; 32]) -> Self {
        self.store_fingerprint = Some(fingerprint);
        self
    }

    /// Fingerprint of the document store this index was built against, if recorded.
    pub fn store_fingerprint(&self) -> Option<&[u8; 32]> {
        self.store_fingerprint.as_ref()
    }

    /// Load an index file.
    ///
    /// # Errors
    ///
    /// [`RagError::IndexLoad`] if the file is missing, unreadable, or corrupt.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| index_err(path, e.to_string()))?;
        Self::from_bytes(&bytes).map_err(|message| index_err(path, message))
    }

    /// Write the index to `path`, replacing any existing file.
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()).map_err(|e| {
            RagError::Config(format!("Failed to write index {}: {}", path.display(), e))
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let count = (self.vectors.len() / self.dims) as u64;
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.push(self.metric.to_byte());
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(&self.store_fingerprint.unwrap_or([0u8; 32]));
        bytes.extend_from_slice(&vec_to_blob(&self.vectors));
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!(
                "file is {} bytes, shorter than the {}-byte header",
                bytes.len(),
                HEADER_LEN
            ));
        }
        if &bytes[0..8] != MAGIC {
            return Err("not a RAGIDX01 index (bad magic)".to_string());
        }
        let metric = Metric::from_byte(bytes[8])
            .ok_or_else(|| format!("unknown metric tag {}", bytes[8]))?;
        let dims = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        if dims == 0 {
            return Err("dimension is zero".to_string());
        }
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[16..24]);
        let count = u64::from_le_bytes(count_bytes);

        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&bytes[24..56]);
        let store_fingerprint = if fingerprint == [0u8; 32] {
            None
        } else {
            Some(fingerprint)
        };

        let expected = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(dims))
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| format!("vector payload size overflows ({} × {})", count, dims))?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != expected {
            return Err(format!(
                "payload is {} bytes, header declares {} vectors × {} dims ({} bytes)",
                payload.len(),
                count,
                dims,
                expected
            ));
        }

        Ok(Self {
            metric,
            dims,
            vectors: blob_to_vec(payload),
            store_fingerprint,
        })
    }

    fn score(&self, query: &[f32], row: &[f32]) -> f32 {
        match self.metric {
            Metric::L2 => squared_l2(query, row),
            Metric::InnerProduct => inner_product(query, row),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn len(&self) -> usize {
        self.vectors.len() / self.dims
    }

    fn search(&self, queries: &QueryBatch, k: i64) -> Result<SearchHits> {
        if k <= 0 {
            return Err(RagError::InvalidArgument(format!(
                "k must be >= 1, got {}",
                k
            )));
        }
        if !queries.is_empty() && queries.dims() != self.dims {
            return Err(RagError::InvalidArgument(format!(
                "query has {} dims, index expects {}",
                queries.dims(),
                self.dims
            )));
        }
        // Width is bounded by what the index holds, never by the caller's k.
        let k = usize::try_from(k).unwrap_or(usize::MAX).min(self.len().max(1));

        let mut distances = Vec::with_capacity(queries.len() * k);
        let mut ids = Vec::with_capacity(queries.len() * k);

        for query in queries.rows() {
            let mut hits: Vec<(f32, i64)> = self
                .vectors
                .chunks_exact(self.dims)
                .enumerate()
                .map(|(i, row)| (self.score(query, row), i as i64))
                .collect();
            hits.sort_by(|a, b| self.metric.order(*a, *b));
            hits.truncate(k);
            while hits.len() < k {
                hits.push((self.metric.sentinel_distance(), SENTINEL_ID));
            }
            for (d, id) in hits {
                distances.push(d);
                ids.push(id);
            }
        }

        Ok(SearchHits { k, distances, ids })
    }
}

fn index_err(path: &Path, message: String) -> RagError {
    RagError::IndexLoad {
        path: PathBuf::from(path),
        message,
    }
}

/// Squared Euclidean distance between two equally sized vectors.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Dot product of two equally sized vectors.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Encode a float slice as little-endian bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian bytes back into floats. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn three_rows() -> Vec<Vec<f32>> {
        vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]]
    }

    #[test]
    fn test_search_l2_nearest_first() {
        let index = FlatIndex::from_vectors(Metric::L2, 2, &three_rows()).unwrap();
        let hits = index
            .search(&QueryBatch::single(vec![0.0, 0.9]), 2)
            .unwrap();
        let row: Vec<_> = hits.row(0).collect();
        assert_eq!(row.len(), 2);
        assert_eq!(row[0].1, 1);
        assert_eq!(row[1].1, 2);
        assert!(row[0].0 <= row[1].0);
    }

    #[test]
    fn test_search_inner_product_highest_first() {
        let index = FlatIndex::from_vectors(Metric::InnerProduct, 2, &three_rows()).unwrap();
        let hits = index
            .search(&QueryBatch::single(vec![1.0, 1.0]), 3)
            .unwrap();
        let ids: Vec<i64> = hits.row(0).map(|(_, id)| id).collect();
        // 0.7+0.7 = 1.4 beats the two unit rows, which tie at 1.0
        assert_eq!(ids, vec![2, 0, 1]);
    }

    #[test]
    fn test_k_above_len_returns_every_vector() {
        let index = FlatIndex::from_vectors(Metric::L2, 2, &three_rows()).unwrap();
        let hits = index
            .search(&QueryBatch::single(vec![0.0, 0.0]), 5)
            .unwrap();
        assert_eq!(hits.k, 3);
        let mut ids: Vec<i64> = hits.row(0).map(|(_, id)| id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_huge_k_is_bounded_by_index_size() {
        let index =
            FlatIndex::from_vectors(Metric::L2, 2, &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let batch = QueryBatch::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let hits = index.search(&batch, 1i64 << 62).unwrap();
        assert_eq!(hits.k, 2);
        assert_eq!(hits.rows(), 2);
        assert_eq!(hits.row(0).map(|(_, id)| id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(hits.row(1).map(|(_, id)| id).collect::<Vec<_>>(), vec![1, 0]);

        let hits = index
            .search(&QueryBatch::single(vec![0.0, 0.0]), i64::MAX)
            .unwrap();
        assert_eq!(hits.ids.len(), 2);
    }

    #[test]
    fn test_empty_index_returns_sentinel() {
        let index = FlatIndex::from_vectors(Metric::L2, 2, &[]).unwrap();
        assert!(index.is_empty());
        let hits = index
            .search(&QueryBatch::single(vec![0.0, 0.0]), 2)
            .unwrap();
        let row: Vec<_> = hits.row(0).collect();
        assert_eq!(row, vec![(f32::MAX, SENTINEL_ID)]);
    }

    #[test]
    fn test_k_zero_is_invalid() {
        let index = FlatIndex::from_vectors(Metric::L2, 2, &three_rows()).unwrap();
        let err = index
            .search(&QueryBatch::single(vec![0.0, 0.0]), 0)
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
        let err = index
            .search(&QueryBatch::single(vec![0.0, 0.0]), -3)
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
    }

    #[test]
    fn test_query_width_mismatch() {
        let index = FlatIndex::from_vectors(Metric::L2, 2, &three_rows()).unwrap();
        let err = index
            .search(&QueryBatch::single(vec![0.0, 0.0, 0.0]), 1)
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidArgument(_)));
    }

    #[test]
    fn test_batch_rows_searched_independently() {
        let index = FlatIndex::from_vectors(Metric::L2, 2, &three_rows()).unwrap();
        let batch = QueryBatch::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let hits = index.search(&batch, 1).unwrap();
        assert_eq!(hits.rows(), 2);
        assert_eq!(hits.row(0).next().unwrap().1, 0);
        assert_eq!(hits.row(1).next().unwrap().1, 1);
    }

    #[test]
    fn test_file_roundtrip_keeps_metric_and_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docs.index");
        let index = FlatIndex::from_vectors(Metric::InnerProduct, 2, &three_rows())
            .unwrap()
            .with_store_fingerprint([7u8; 32]);
        index.write(&path).unwrap();

        let loaded = FlatIndex::load(&path).unwrap();
        assert_eq!(loaded.metric(), Metric::InnerProduct);
        assert_eq!(loaded.dims(), 2);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.store_fingerprint(), Some(&[7u8; 32]));
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = FlatIndex::load(&tmp.path().join("nope.index")).unwrap_err();
        assert!(matches!(err, RagError::IndexLoad { .. }));
    }

    #[test]
    fn test_load_rejects_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docs.index");
        let good = FlatIndex::from_vectors(Metric::L2, 2, &three_rows())
            .unwrap()
            .to_bytes();

        let mut truncated = good.clone();
        truncated.pop();
        std::fs::write(&path, &truncated).unwrap();
        assert!(matches!(
            FlatIndex::load(&path),
            Err(RagError::IndexLoad { .. })
        ));

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        std::fs::write(&path, &bad_magic).unwrap();
        assert!(matches!(
            FlatIndex::load(&path),
            Err(RagError::IndexLoad { .. })
        ));

        let mut bad_metric = good;
        bad_metric[8] = 42;
        std::fs::write(&path, &bad_metric).unwrap();
        assert!(matches!(
            FlatIndex::load(&path),
            Err(RagError::IndexLoad { .. })
        ));

        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            FlatIndex::load(&path),
            Err(RagError::IndexLoad { .. })
        ));
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_squared_l2() {
        assert!((squared_l2(&[1.0, 2.0], &[4.0, 6.0]) - 25.0).abs() < 1e-6);
        assert_eq!(squared_l2(&[], &[]), 0.0);
    }
}
