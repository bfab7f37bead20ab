//! Core data models used throughout the pipeline.
//!
//! These types represent the passages, distance metrics, and retrieval
//! results that flow from the vector index to the prompt assembler.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Id reported by the index for a result slot it could not fill.
pub const SENTINEL_ID: i64 = -1;

/// A unit of source text stored in the document store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub id: i64,
    pub text: String,
}

/// Distance metric fixed when the index was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance; lower is more similar.
    L2,
    /// Inner product score; higher is more similar.
    InnerProduct,
}

impl Metric {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Metric::L2 => 0,
            Metric::InnerProduct => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Metric::L2),
            1 => Some(Metric::InnerProduct),
            _ => None,
        }
    }

    /// Compare two `(distance, id)` hits in this metric's native order.
    ///
    /// Ties are broken by ascending id so that results are deterministic.
    pub fn order(self, a: (f32, i64), b: (f32, i64)) -> Ordering {
        let by_distance = match self {
            Metric::L2 => a.0.total_cmp(&b.0),
            Metric::InnerProduct => b.0.total_cmp(&a.0),
        };
        by_distance.then(a.1.cmp(&b.1))
    }

    /// Distance value placed next to a sentinel id.
    pub fn sentinel_distance(self) -> f32 {
        match self {
            Metric::L2 => f32::MAX,
            Metric::InnerProduct => -f32::MAX,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::L2 => write!(f, "l2"),
            Metric::InnerProduct => write!(f, "inner_product"),
        }
    }
}

/// A passage returned by the retriever, annotated with its search distance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedItem {
    #[serde(rename = "id")]
    pub passage_id: i64,
    pub distance: f32,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_orders_ascending() {
        let mut hits = vec![(0.9, 2), (0.1, 5), (0.5, 1)];
        hits.sort_by(|a, b| Metric::L2.order(*a, *b));
        assert_eq!(hits, vec![(0.1, 5), (0.5, 1), (0.9, 2)]);
    }

    #[test]
    fn test_inner_product_orders_descending() {
        let mut hits = vec![(0.9, 2), (0.1, 5), (0.5, 1)];
        hits.sort_by(|a, b| Metric::InnerProduct.order(*a, *b));
        assert_eq!(hits, vec![(0.9, 2), (0.5, 1), (0.1, 5)]);
    }

    #[test]
    fn test_ties_break_by_id() {
        let mut hits = vec![(0.5, 7), (0.5, 3), (0.5, 4)];
        hits.sort_by(|a, b| Metric::L2.order(*a, *b));
        assert_eq!(hits, vec![(0.5, 3), (0.5, 4), (0.5, 7)]);

        hits.sort_by(|a, b| Metric::InnerProduct.order(*a, *b));
        assert_eq!(hits, vec![(0.5, 3), (0.5, 4), (0.5, 7)]);
    }

    #[test]
    fn test_metric_byte_roundtrip() {
        for m in [Metric::L2, Metric::InnerProduct] {
            assert_eq!(Metric::from_byte(m.to_byte()), Some(m));
        }
        assert_eq!(Metric::from_byte(9), None);
    }
}
