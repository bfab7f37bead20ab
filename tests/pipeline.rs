//! End-to-end pipeline tests with in-process embedder and generator fakes.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use grounded_rag::config::parse_config;
use grounded_rag::embedding::Embedder;
use grounded_rag::error::{RagError, Result};
use grounded_rag::generation::{
    cancel_pair, collect_fragments, with_cancel, AnswerGenerator, CancelToken, FragmentStream,
};
use grounded_rag::index::{FlatIndex, VectorIndex};
use grounded_rag::models::Metric;
use grounded_rag::pipeline::RagPipeline;
use grounded_rag::prompt::PromptAssembler;
use grounded_rag::store::DocumentStore;

const ECONOMY: [&str; 3] = [
    "A: inflation rose 2%",
    "B: unemployment fell",
    "C: GDP grew 1.5%",
];

/// One dimension per topic keyword, plus a small floor.
struct KeywordEmbedder {
    calls: AtomicUsize,
    fail_first: usize,
}

impl KeywordEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        }
    }

    fn failing_first(n: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_first: n,
        }
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn provider(&self) -> &str {
        "keyword"
    }
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(RagError::Embedding {
                provider: "keyword".to_string(),
                cause: "unavailable: request timed out".to_string(),
            });
        }
        let text = text.to_lowercase();
        let score = |word: &str| if text.contains(word) { 1.0 } else { 0.1 };
        Ok(vec![score("inflation"), score("unemployment"), score("gdp")])
    }
}

/// Deterministic generator: the answer names the first chunk id in the prompt.
struct EchoGenerator;

impl EchoGenerator {
    fn answer_for(prompt: &str) -> String {
        let first = prompt
            .find("[chunk id=")
            .map(|i| &prompt[i..])
            .and_then(|s| s.split(']').next())
            .unwrap_or("no context");
        format!("Grounded in {}] across {} chars.", first, prompt.len())
    }
}

#[async_trait]
impl AnswerGenerator for EchoGenerator {
    fn provider(&self) -> &str {
        "echo"
    }
    fn model_name(&self) -> &str {
        "echo-test"
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        Ok(Self::answer_for(prompt))
    }
    async fn generate_stream(&self, prompt: &str, cancel: CancelToken) -> Result<FragmentStream> {
        let answer = Self::answer_for(prompt);
        let parts: Vec<Result<String>> = answer
            .split_inclusive(' ')
            .map(|p| Ok(p.to_string()))
            .collect();
        Ok(with_cancel(Box::pin(stream::iter(parts)), cancel))
    }
}

struct FailingGenerator;

#[async_trait]
impl AnswerGenerator for FailingGenerator {
    fn provider(&self) -> &str {
        "failing"
    }
    fn model_name(&self) -> &str {
        "failing-test"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(RagError::Generation {
            provider: "failing".to_string(),
            cause: "rejected (401 Unauthorized): bad key".to_string(),
        })
    }
    async fn generate_stream(&self, prompt: &str, _cancel: CancelToken) -> Result<FragmentStream> {
        self.generate(prompt).await.map(|_| -> FragmentStream { Box::pin(stream::empty()) })
    }
}

/// Emits one fragment, then waits forever.
struct StallingGenerator;

#[async_trait]
impl AnswerGenerator for StallingGenerator {
    fn provider(&self) -> &str {
        "stalling"
    }
    fn model_name(&self) -> &str {
        "stalling-test"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        std::future::pending().await
    }
    async fn generate_stream(&self, _prompt: &str, cancel: CancelToken) -> Result<FragmentStream> {
        let s = stream::iter(vec![Ok("first ".to_string())]).chain(stream::pending());
        Ok(with_cancel(Box::pin(s), cancel))
    }
}

fn unit_rows(n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            let mut v = vec![0.0; 3];
            v[i % 3] = 1.0;
            v
        })
        .collect()
}

fn pipeline_with(
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn AnswerGenerator>,
    rows: usize,
) -> RagPipeline {
    let index: Arc<dyn VectorIndex> =
        Arc::new(FlatIndex::from_vectors(Metric::L2, 3, &unit_rows(rows)).unwrap());
    let store = Arc::new(DocumentStore::from_texts(ECONOMY));
    RagPipeline::new(
        embedder,
        index,
        store,
        generator,
        PromptAssembler::default(),
        4,
        10,
    )
    .unwrap()
}

fn economy_pipeline(generator: Arc<dyn AnswerGenerator>) -> RagPipeline {
    pipeline_with(Arc::new(KeywordEmbedder::new()), generator, 3)
}

#[tokio::test]
async fn test_economy_scenario() {
    let pipeline = economy_pipeline(Arc::new(EchoGenerator));
    let answered = pipeline
        .ask("What happened to unemployment?", Some(2))
        .await
        .unwrap();

    assert_eq!(answered.retrieved.len(), 2);
    assert_eq!(answered.retrieved[0].passage_id, 1);
    assert_eq!(answered.retrieved[0].text, "B: unemployment fell");
    assert!(answered.retrieved[0].distance <= answered.retrieved[1].distance);

    assert!(answered.prompt.context_block.contains("[chunk id=1 |"));
    let rendered = answered.prompt.render();
    assert!(rendered.contains("Question: What happened to unemployment?"));

    let answer = answered.answer.unwrap();
    assert!(answer.starts_with("Grounded in [chunk id=1 |"));
}

#[tokio::test]
async fn test_exactly_k_in_metric_order() {
    let pipeline = pipeline_with(Arc::new(KeywordEmbedder::new()), Arc::new(EchoGenerator), 3);
    for k in 1..=3 {
        let items = pipeline.search("inflation", Some(k)).await.unwrap();
        assert_eq!(items.len(), k);
        for pair in items.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }
}

#[tokio::test]
async fn test_fewer_passages_than_k() {
    let pipeline = economy_pipeline(Arc::new(EchoGenerator));
    let items = pipeline.search("GDP", Some(10)).await.unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].passage_id, 2);
}

#[tokio::test]
async fn test_default_k_applies() {
    let pipeline = pipeline_with(Arc::new(KeywordEmbedder::new()), Arc::new(EchoGenerator), 3);
    let items = pipeline.search("GDP", None).await.unwrap();
    assert_eq!(items.len(), 3);
}

#[tokio::test]
async fn test_invalid_queries_rejected() {
    let pipeline = economy_pipeline(Arc::new(EchoGenerator));

    let err = pipeline.search("inflation", Some(0)).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidArgument(_)));

    let err = pipeline.search("inflation", Some(11)).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidArgument(_)));

    let err = pipeline.ask("   ", None).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidArgument(_)));

    // The pipeline is still usable afterwards.
    assert_eq!(pipeline.search("inflation", Some(1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dangling_ids_excluded() {
    // Five index rows, three passages: ids 3 and 4 cannot be resolved.
    let pipeline = pipeline_with(Arc::new(KeywordEmbedder::new()), Arc::new(EchoGenerator), 5);
    let items = pipeline.search("inflation", Some(5)).await.unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.passage_id < 3));
}

#[tokio::test]
async fn test_embedding_failure_then_recovery() {
    let pipeline = pipeline_with(
        Arc::new(KeywordEmbedder::failing_first(1)),
        Arc::new(EchoGenerator),
        3,
    );

    let err = pipeline.ask("inflation?", Some(2)).await.unwrap_err();
    assert!(matches!(err, RagError::Embedding { .. }));

    let answered = pipeline.ask("inflation?", Some(2)).await.unwrap();
    assert_eq!(answered.retrieved[0].passage_id, 0);
    assert!(answered.answer.is_ok());
}

#[tokio::test]
async fn test_generation_failure_keeps_context() {
    let pipeline = economy_pipeline(Arc::new(FailingGenerator));
    let answered = pipeline.ask("unemployment", Some(2)).await.unwrap();
    assert_eq!(answered.retrieved.len(), 2);
    assert!(matches!(answered.answer, Err(RagError::Generation { .. })));

    let streaming = pipeline
        .ask_stream("unemployment", Some(2), CancelToken::never())
        .await
        .unwrap();
    assert_eq!(streaming.retrieved.len(), 2);
    assert!(streaming.fragments.is_err());
}

#[tokio::test]
async fn test_stream_matches_atomic() {
    let pipeline = economy_pipeline(Arc::new(EchoGenerator));
    let atomic = pipeline
        .ask("What happened to unemployment?", Some(2))
        .await
        .unwrap();
    let streaming = pipeline
        .ask_stream("What happened to unemployment?", Some(2), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(atomic.prompt, streaming.prompt);
    let streamed = collect_fragments(streaming.fragments.unwrap()).await.unwrap();
    assert_eq!(streamed, atomic.answer.unwrap());
}

#[tokio::test]
async fn test_cancel_ends_stream() {
    let pipeline = economy_pipeline(Arc::new(StallingGenerator));
    let (handle, token) = cancel_pair();
    let streaming = pipeline
        .ask_stream("inflation", Some(1), token)
        .await
        .unwrap();
    let mut fragments = streaming.fragments.unwrap();

    assert_eq!(fragments.next().await.unwrap().unwrap(), "first ");
    handle.cancel();
    let next = tokio::time::timeout(Duration::from_secs(2), fragments.next())
        .await
        .expect("stream should end after cancel");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_concurrent_queries_share_pipeline() {
    let pipeline = Arc::new(economy_pipeline(Arc::new(EchoGenerator)));
    let mut handles = Vec::new();
    for q in ["inflation", "unemployment", "GDP"] {
        let p = pipeline.clone();
        handles.push(tokio::spawn(async move {
            p.search(q, Some(1)).await.unwrap()[0].passage_id
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    assert_eq!(ids, vec![0, 1, 2]);
}

// ============ Startup checks ============

fn write_artifacts(dir: &std::path::Path, link: Option<[u8; 32]>) {
    let store_json = serde_json::to_string(&ECONOMY).unwrap();
    fs::write(dir.join("docs.json"), &store_json).unwrap();
    let mut index = FlatIndex::from_vectors(Metric::L2, 3, &unit_rows(3)).unwrap();
    if let Some(fp) = link {
        index = index.with_store_fingerprint(fp);
    }
    index.write(&dir.join("docs.index")).unwrap();
}

fn config_in(dir: &std::path::Path, dims: usize) -> grounded_rag::config::Config {
    let toml = format!(
        r#"
[index]
path = "docs.index"
store_path = "docs.json"

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = {dims}
url = "http://127.0.0.1:9"

[generation]
provider = "ollama"
model = "mistral"
url = "http://127.0.0.1:9"
"#
    );
    let mut config = parse_config(&toml).unwrap();
    config.resolve_paths(dir);
    config
}

#[tokio::test]
async fn test_open_accepts_linked_artifacts() {
    let tmp = TempDir::new().unwrap();
    let store_json = serde_json::to_string(&ECONOMY).unwrap();
    let fp = grounded_rag::store::fingerprint_bytes(store_json.as_bytes());
    write_artifacts(tmp.path(), Some(fp));

    let pipeline = RagPipeline::open(&config_in(tmp.path(), 3)).await.unwrap();
    assert_eq!(pipeline.metric(), Metric::L2);
    assert_eq!(pipeline.default_k(), 4);
}

#[tokio::test]
async fn test_open_rejects_foreign_store() {
    let tmp = TempDir::new().unwrap();
    write_artifacts(tmp.path(), Some([7u8; 32]));

    let err = RagPipeline::open(&config_in(tmp.path(), 3))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RagError::Config(_)));
    assert!(err.is_startup());
}

#[tokio::test]
async fn test_open_rejects_dimension_mismatch() {
    let tmp = TempDir::new().unwrap();
    write_artifacts(tmp.path(), None);

    let err = RagPipeline::open(&config_in(tmp.path(), 768))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RagError::DimensionMismatch {
            embedder: 768,
            index: 3,
            ..
        }
    ));
}

#[tokio::test]
async fn test_open_missing_store() {
    let tmp = TempDir::new().unwrap();
    write_artifacts(tmp.path(), None);
    fs::remove_file(tmp.path().join("docs.json")).unwrap();

    let err = RagPipeline::open(&config_in(tmp.path(), 3))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("document store file not found"));
}

#[tokio::test]
async fn test_open_reports_missing_store_before_credentials() {
    let tmp = TempDir::new().unwrap();
    write_artifacts(tmp.path(), None);
    fs::remove_file(tmp.path().join("docs.json")).unwrap();

    let mut config = config_in(tmp.path(), 3);
    config.generation.provider = "openai".to_string();
    config.generation.api_key_env = Some("RAG_PIPELINE_TEST_UNSET_KEY".to_string());

    let err = RagPipeline::open(&config).await.err().unwrap();
    assert!(
        err.to_string().contains("document store file not found"),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_open_measures_live_width_when_asked() {
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn embed() -> Json<Value> {
        Json(json!({"embeddings": [[0.1, 0.2, 0.3, 0.4]]}))
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/api/embed", post(embed)))
            .await
            .unwrap();
    });

    let tmp = TempDir::new().unwrap();
    write_artifacts(tmp.path(), None);
    let mut config = config_in(tmp.path(), 3);
    config.embedding.url = Some(format!("http://{}", addr));

    // Declared width matches the index, so the default check passes.
    assert!(RagPipeline::open(&config).await.is_ok());

    config.embedding.verify_dims = true;
    let err = RagPipeline::open(&config).await.err().unwrap();
    assert!(matches!(
        err,
        RagError::DimensionMismatch {
            embedder: 4,
            index: 3,
            ..
        }
    ));
}
