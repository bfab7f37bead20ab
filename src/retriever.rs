//! Query-to-passages retrieval.
//!
//! Embeds the query, searches the vector index, and resolves hit ids
//! through the document store. Sentinel slots and ids the store cannot
//! resolve are skipped, so a query may return fewer than `k` items.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::{QueryBatch, VectorIndex};
use crate::models::{Metric, RetrievedItem, SENTINEL_ID};
use crate::store::DocumentStore;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<DocumentStore>,
}

impl Retriever {
    /// Bind an embedder to an index and its store.
    ///
    /// # Errors
    ///
    /// [`RagError::DimensionMismatch`] if the embedder and index widths differ.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<DocumentStore>,
    ) -> Result<Self> {
        if embedder.dims() != index.dims() {
            return Err(RagError::DimensionMismatch {
                model: embedder.model_name().to_string(),
                embedder: embedder.dims(),
                index: index.dims(),
            });
        }
        Ok(Self {
            embedder,
            index,
            store,
        })
    }

    pub fn metric(&self) -> Metric {
        self.index.metric()
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Return up to `k` passages nearest to `query`, best first.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedItem>> {
        let vector = self.embedder.embed(query).await?;
        if vector.len() != self.index.dims() {
            return Err(RagError::embedding(
                self.embedder.provider(),
                format!(
                    "returned {} dims, expected {}",
                    vector.len(),
                    self.index.dims()
                ),
            ));
        }

        let k = i64::try_from(k).unwrap_or(i64::MAX);
        let hits = self.index.search(&QueryBatch::single(vector), k)?;

        let mut items = Vec::new();
        for (distance, id) in hits.row(0) {
            if id == SENTINEL_ID {
                continue;
            }
            match self.store.get(id) {
                Ok(text) => items.push(RetrievedItem {
                    passage_id: id,
                    distance,
                    text: text.to_string(),
                }),
                Err(e) => {
                    tracing::warn!(id, error = %e, "skipping unresolvable index hit");
                }
            }
        }

        tracing::debug!(requested = k, returned = items.len(), "retrieval complete");
        Ok(items)
    }
}
