//! Query embedding backends.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`RemoteEmbedder`]**: calls an HTTP embeddings API (OpenAI-compatible,
//!   Ollama, or the Hugging Face feature-extraction pipeline) with a request
//!   timeout and bounded retry.
//! - **`LocalEmbedder`**: runs models in-process via fastembed (primary) or
//!   tract (musl/Intel Mac); no network calls after the model download.
//!
//! # Provider Selection
//!
//! [`create_embedder`] instantiates the backend named by
//! `embedding.provider`:
//!
//! | Config Value | Backend |
//! |-------------|----------|
//! | `"openai"` | [`RemoteEmbedder`] → `POST {url}/v1/embeddings` |
//! | `"ollama"` | [`RemoteEmbedder`] → `POST {url}/api/embed` |
//! | `"huggingface"` | [`RemoteEmbedder`] → `POST {url}/pipeline/feature-extraction/{model}` |
//! | `"local"` | `LocalEmbedder` (fastembed or tract, see features) |
//!
//! Remote failures surface as [`RagError::Embedding`]; once retries are
//! exhausted the cause starts with `unavailable`.

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::http::{send_with_retry, RetryPolicy};

/// Converts query text into a fixed-width vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Backend label used in errors and logs (e.g. `"openai"`).
    fn provider(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Width of every vector this embedder returns.
    fn dims(&self) -> usize;
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============ Remote Embedder ============

/// Wire protocol spoken by a [`RemoteEmbedder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApi {
    OpenAi,
    Ollama,
    HuggingFace,
}

impl RemoteApi {
    fn from_provider(provider: &str) -> Option<Self> {
        match provider {
            "openai" => Some(RemoteApi::OpenAi),
            "ollama" => Some(RemoteApi::Ollama),
            "huggingface" => Some(RemoteApi::HuggingFace),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RemoteApi::OpenAi => "openai",
            RemoteApi::Ollama => "ollama",
            RemoteApi::HuggingFace => "huggingface",
        }
    }

    fn default_url(self) -> &'static str {
        match self {
            RemoteApi::OpenAi => "https://api.openai.com",
            RemoteApi::Ollama => "http://localhost:11434",
            RemoteApi::HuggingFace => "https://api-inference.huggingface.co",
        }
    }
}

/// Embedding backend reached over HTTP.
pub struct RemoteEmbedder {
    api: RemoteApi,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RemoteEmbedder {
    /// Create a remote embedder from configuration.
    ///
    /// # Errors
    ///
    /// [`RagError::Config`] if `model` or `dims` is missing, the provider is
    /// not a remote one, or a required credential is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api = RemoteApi::from_provider(&config.provider).ok_or_else(|| {
            RagError::Config(format!(
                "'{}' is not a remote embedding provider",
                config.provider
            ))
        })?;
        let model = config.model.clone().ok_or_else(|| {
            RagError::Config(format!("embedding.model required for {} provider", api.label()))
        })?;
        let dims = config.dims.filter(|d| *d > 0).ok_or_else(|| {
            RagError::Config(format!("embedding.dims required for {} provider", api.label()))
        })?;
        let api_key = config.api_key()?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| api.default_url().to_string());

        Self::with_api(
            api,
            model,
            dims,
            url,
            api_key,
            Duration::from_secs(config.timeout_secs),
            RetryPolicy::new(config.max_retries, config.retry_backoff_ms),
        )
    }

    /// Create a remote embedder from explicit parts.
    pub fn with_api(
        api: RemoteApi,
        model: String,
        dims: usize,
        url: String,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client,
            retry,
        })
    }

    fn request(&self, text: &str) -> reqwest::RequestBuilder {
        let (endpoint, body) = match self.api {
            RemoteApi::OpenAi => (
                format!("{}/v1/embeddings", self.url),
                serde_json::json!({ "model": self.model, "input": [text] }),
            ),
            RemoteApi::Ollama => (
                format!("{}/api/embed", self.url),
                serde_json::json!({ "model": self.model, "input": text }),
            ),
            RemoteApi::HuggingFace => (
                format!("{}/pipeline/feature-extraction/{}", self.url, self.model),
                serde_json::json!({ "inputs": text }),
            ),
        };

        let mut req = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn provider(&self) -> &str {
        self.api.label()
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.api.label();
        let response = send_with_retry(&self.retry, provider, || self.request(text))
            .await
            .map_err(|e| RagError::embedding(provider, e.cause()))?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::embedding(provider, format!("invalid response body: {}", e)))?;

        let parsed = match self.api {
            RemoteApi::OpenAi => parse_openai_response(&json),
            RemoteApi::Ollama => parse_ollama_response(&json),
            RemoteApi::HuggingFace => parse_feature_extraction(&json),
        };
        parsed.map_err(|cause| RagError::embedding(provider, cause))
    }
}

/// Extract `data[0].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> std::result::Result<Vec<f32>, String> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .ok_or_else(|| "Invalid OpenAI response: missing data[0].embedding".to_string())?;
    float_array(embedding)
}

/// Extract the first vector from an Ollama `/api/embed` response.
///
/// Older Ollama builds answer with a single `embedding` field instead of
/// an `embeddings` array; both are accepted.
fn parse_ollama_response(json: &serde_json::Value) -> std::result::Result<Vec<f32>, String> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .or_else(|| json.get("embedding"))
        .ok_or_else(|| "Invalid Ollama response: missing embeddings array".to_string())?;
    float_array(embedding)
}

/// Parse a feature-extraction response.
///
/// Sentence-level models answer with a flat vector; token-level models
/// answer with one vector per token, which are mean-pooled.
fn parse_feature_extraction(json: &serde_json::Value) -> std::result::Result<Vec<f32>, String> {
    let outer = json
        .as_array()
        .ok_or_else(|| "Invalid feature-extraction response: expected an array".to_string())?;

    if outer.iter().all(|v| v.is_number()) {
        return float_array(json);
    }

    // Unwrap a batch of one: [[[...token vectors...]]] or [[...vector...]]
    let rows: Vec<Vec<f32>> = match outer.as_slice() {
        [single] if single.as_array().map_or(false, |a| a.iter().all(|v| v.is_array())) => {
            single
                .as_array()
                .into_iter()
                .flatten()
                .map(float_array)
                .collect::<std::result::Result<_, _>>()?
        }
        _ => outer
            .iter()
            .map(float_array)
            .collect::<std::result::Result<_, _>>()?,
    };

    mean_pool(&rows).ok_or_else(|| "Invalid feature-extraction response: empty or ragged rows".to_string())
}

fn float_array(value: &serde_json::Value) -> std::result::Result<Vec<f32>, String> {
    value
        .as_array()
        .ok_or_else(|| "embedding is not an array".to_string())?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| format!("embedding contains a non-number: {}", v))
        })
        .collect()
}

fn mean_pool(rows: &[Vec<f32>]) -> Option<Vec<f32>> {
    let width = rows.first()?.len();
    if width == 0 || rows.iter().any(|r| r.len() != width) {
        return None;
    }
    let mut sum = vec![0f32; width];
    for row in rows {
        for (s, v) in sum.iter_mut().zip(row) {
            *s += v;
        }
    }
    let n = rows.len() as f32;
    Some(sum.into_iter().map(|s| s / n).collect())
}

// ============ Local Embedder (fastembed or tract) ============

#[cfg(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
))]
fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RagError::Config(format!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

/// In-process embedder backed by fastembed (bundled ONNX Runtime).
///
/// The model is initialized once, on the blocking pool, when the embedder
/// is loaded; each query then runs inference on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub async fn load(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        let fastembed_model = config_to_fastembed_model(&model_name)?;

        let model = tokio::task::spawn_blocking(move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
            )
        })
        .await
        .map_err(|e| RagError::embedding("local", format!("model loader panicked: {}", e)))?
        .map_err(|e| {
            RagError::Config(format!("Failed to initialize local embedding model: {}", e))
        })?;

        tracing::info!(model = %model_name, dims, "local embedding model ready");

        Ok(Self {
            model_name,
            dims,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn provider(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let texts = vec![text.to_string()];

        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| "local embedding model lock poisoned".to_string())?;
            model
                .embed(texts, None)
                .map_err(|e| format!("Local embedding failed: {}", e))
        })
        .await
        .map_err(|e| RagError::embedding("local", format!("inference task failed: {}", e)))?
        .map_err(|cause| RagError::embedding("local", cause))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagError::embedding("local", "Empty embedding response"))
    }
}

#[cfg(all(
    feature = "local-embeddings-tract",
    not(feature = "local-embeddings-fastembed")
))]
pub use local_tract::TractEmbedder as LocalEmbedder;

/// Create the [`Embedder`] named by `config.provider`.
///
/// # Errors
///
/// [`RagError::Config`] for unknown providers, missing model settings or
/// credentials, or a local backend that was not compiled in.
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" | "ollama" | "huggingface" => Ok(Arc::new(RemoteEmbedder::new(config)?)),
        #[cfg(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"))]
        "local" => Ok(Arc::new(LocalEmbedder::load(config).await?)),
        #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
        "local" => Err(RagError::Config(
            "Local embedding provider requires one of: --features local-embeddings-fastembed, --features local-embeddings-tract".to_string(),
        )),
        other => Err(RagError::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}
