//! End-to-end query pipeline.
//!
//! [`RagPipeline::open`] performs every startup check (artifact files,
//! credentials, index/store linkage, embedder width) before the first query.
//! With `embedding.verify_dims` set, the width is measured with a live
//! embedding rather than taken from configuration.
//! After that the pipeline is immutable and may be shared across tasks
//! behind an `Arc`; a failed query leaves it fully usable.
//!
//! A query runs `validate → retrieve → assemble → generate`. An embedding
//! failure aborts the query before a prompt is built. A generation failure
//! does not: the retrieved context is still returned alongside the error.

use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{RagError, Result};
use crate::generation::{create_generator, AnswerGenerator, CancelToken, FragmentStream};
use crate::index::{FlatIndex, VectorIndex};
use crate::models::{Metric, RetrievedItem};
use crate::prompt::{Prompt, PromptAssembler};
use crate::retriever::Retriever;
use crate::store::DocumentStore;

/// How an index file relates to the document store it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// The index carries no store fingerprint.
    Unlinked,
    Matches,
    Mismatch,
}

impl Linkage {
    pub fn check(index: &FlatIndex, store: &DocumentStore) -> Self {
        match index.store_fingerprint() {
            None => Linkage::Unlinked,
            Some(fp) if fp == store.fingerprint() => Linkage::Matches,
            Some(_) => Linkage::Mismatch,
        }
    }
}

/// Load the index and store named by `config`, without contacting any backend.
pub fn load_artifacts(config: &Config) -> Result<(FlatIndex, DocumentStore)> {
    config.check_artifacts()?;
    let index = FlatIndex::load(&config.index.path)?;
    let store = DocumentStore::load(&config.index.store_path)?;
    Ok((index, store))
}

/// Startup consistency checks between a loaded index and store.
fn verify_artifacts(config: &Config, index: &FlatIndex, store: &DocumentStore) -> Result<()> {
    if config.index.verify_fingerprint && Linkage::check(index, store) == Linkage::Mismatch {
        return Err(RagError::Config(format!(
            "index {} was built from a different document store than {}",
            config.index.path.display(),
            config.index.store_path.display()
        )));
    }

    let rows = index.len() as i64;
    let covered = store.max_id().map(|m| m + 1).unwrap_or(0);
    if rows > covered {
        tracing::warn!(
            index_rows = rows,
            store_passages = store.len(),
            "index holds rows beyond the document store; those hits will be skipped"
        );
    }
    Ok(())
}

/// Embed a fixed text and check the width the backend actually returns.
///
/// Remote embedders only declare their width from configuration; this is the
/// one check that catches a backend serving a different model.
pub async fn verify_embedder_width(embedder: &dyn Embedder, index_dims: usize) -> Result<()> {
    let vector = embedder.embed("dimension check").await?;
    if vector.len() != index_dims {
        return Err(RagError::DimensionMismatch {
            model: embedder.model_name().to_string(),
            embedder: vector.len(),
            index: index_dims,
        });
    }
    tracing::debug!(dims = index_dims, "embedder width verified");
    Ok(())
}

/// Result of an atomic query.
#[derive(Debug)]
pub struct Answered {
    pub retrieved: Vec<RetrievedItem>,
    pub prompt: Prompt,
    /// Generation outcome, kept apart so the context survives a failure.
    pub answer: Result<String>,
}

/// Result of a streamed query.
pub struct StreamingAnswer {
    pub retrieved: Vec<RetrievedItem>,
    pub prompt: Prompt,
    pub fragments: Result<FragmentStream>,
}

pub struct RagPipeline {
    retriever: Retriever,
    assembler: PromptAssembler,
    generator: Arc<dyn AnswerGenerator>,
    default_k: usize,
    max_k: usize,
}

impl RagPipeline {
    /// Run all startup checks and build the pipeline.
    pub async fn open(config: &Config) -> Result<Self> {
        let (index, store) = load_artifacts(config)?;
        config.check_credentials()?;
        verify_artifacts(config, &index, &store)?;
        tracing::info!(
            index = %config.index.path.display(),
            metric = %index.metric(),
            dims = index.dims(),
            vectors = index.len(),
            passages = store.len(),
            "artifacts loaded"
        );

        let embedder = create_embedder(&config.embedding).await?;
        if config.embedding.verify_dims {
            verify_embedder_width(embedder.as_ref(), index.dims()).await?;
        }
        let generator = create_generator(&config.generation)?;
        tracing::info!(
            embedder = embedder.provider(),
            embedding_model = embedder.model_name(),
            generator = generator.provider(),
            generation_model = generator.model_name(),
            "backends ready"
        );

        Self::new(
            embedder,
            Arc::new(index),
            Arc::new(store),
            generator,
            PromptAssembler::from_config(&config.prompt),
            config.retrieval.default_k,
            config.retrieval.max_k,
        )
    }

    /// Assemble a pipeline from already-built parts.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<DocumentStore>,
        generator: Arc<dyn AnswerGenerator>,
        assembler: PromptAssembler,
        default_k: usize,
        max_k: usize,
    ) -> Result<Self> {
        let retriever = Retriever::new(embedder, index, store)?;
        Ok(Self {
            retriever,
            assembler,
            generator,
            default_k,
            max_k,
        })
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    pub fn max_k(&self) -> usize {
        self.max_k
    }

    pub fn metric(&self) -> Metric {
        self.retriever.metric()
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn generator(&self) -> &dyn AnswerGenerator {
        self.generator.as_ref()
    }

    fn check_query(&self, question: &str, k: Option<usize>) -> Result<usize> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidArgument(
                "question must not be empty".to_string(),
            ));
        }
        let k = k.unwrap_or(self.default_k);
        if k == 0 || k > self.max_k {
            return Err(RagError::InvalidArgument(format!(
                "k must be between 1 and {}, got {}",
                self.max_k, k
            )));
        }
        Ok(k)
    }

    /// Retrieve context passages only.
    pub async fn search(&self, question: &str, k: Option<usize>) -> Result<Vec<RetrievedItem>> {
        let k = self.check_query(question, k)?;
        self.retriever
            .retrieve(question, k)
            .instrument(query_span("search"))
            .await
    }

    /// Retrieve, assemble and generate the whole answer.
    pub async fn ask(&self, question: &str, k: Option<usize>) -> Result<Answered> {
        let k = self.check_query(question, k)?;
        async {
            let retrieved = self.retriever.retrieve(question, k).await?;
            let prompt = self.assembler.build(question, &retrieved);
            let answer = self.generator.generate(&prompt.render()).await;
            if let Err(e) = &answer {
                tracing::warn!(error = %e, "generation failed; returning context only");
            }
            Ok::<_, RagError>(Answered {
                retrieved,
                prompt,
                answer,
            })
        }
        .instrument(query_span("ask"))
        .await
    }

    /// Retrieve, assemble and start a streamed answer.
    ///
    /// The fragment stream ends when `cancel` fires or when it is dropped.
    pub async fn ask_stream(
        &self,
        question: &str,
        k: Option<usize>,
        cancel: CancelToken,
    ) -> Result<StreamingAnswer> {
        let k = self.check_query(question, k)?;
        async {
            let retrieved = self.retriever.retrieve(question, k).await?;
            let prompt = self.assembler.build(question, &retrieved);
            let fragments = self
                .generator
                .generate_stream(&prompt.render(), cancel)
                .await;
            if let Err(e) = &fragments {
                tracing::warn!(error = %e, "generation failed to start; returning context only");
            }
            Ok::<_, RagError>(StreamingAnswer {
                retrieved,
                prompt,
                fragments,
            })
        }
        .instrument(query_span("ask_stream"))
        .await
    }
}

fn query_span(kind: &'static str) -> tracing::Span {
    tracing::info_span!("query", id = %Uuid::new_v4(), kind)
}
