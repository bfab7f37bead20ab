//! Tract-based local embedder (fallback for musl and Intel Mac).
//!
//! Pure-Rust path: loads the ONNX model with tract-onnx, tokenizes with the
//! tokenizers crate, and runs inference in `spawn_blocking`. No ONNX Runtime
//! or system deps. Model files are downloaded once into the user cache.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::bail;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tract_onnx::prelude::*;

use super::{resolve_local_model, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::RagError;

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ALL_MINILM_DIMS: usize = 384;
const DEFAULT_MAX_LEN: usize = 256;

/// Model manifest: name -> (onnx path in repo, tokenizer path in repo, dims).
fn model_manifest(model_name: &str) -> anyhow::Result<(&'static str, &'static str, usize)> {
    match model_name {
        "all-minilm-l6-v2" => Ok(("onnx/model.onnx", "tokenizer.json", ALL_MINILM_DIMS)),
        _ => bail!(
            "Tract backend supports only all-minilm-l6-v2 for now. Requested: '{}'",
            model_name
        ),
    }
}

fn cache_dir() -> anyhow::Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base)
        .join(".cache")
        .join("grounded-rag")
        .join("models");
    std::fs::create_dir_all(&dir).map_err(|e| anyhow::anyhow!("Create cache dir: {}", e))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &std::path::Path) -> anyhow::Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo,
        path.replace(' ', "%20")
    );
    tracing::info!(%url, "downloading embedding model file");
    let resp = reqwest::blocking::get(&url)
        .map_err(|e| anyhow::anyhow!("Download {}: {}", url, e))?
        .error_for_status()
        .map_err(|e| anyhow::anyhow!("Download {}: {}", url, e))?;
    let bytes = resp
        .bytes()
        .map_err(|e| anyhow::anyhow!("Read body: {}", e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Create cache parent: {}", e))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| anyhow::anyhow!("Write cache: {}", e))?;
    Ok(())
}

/// Ensure model and tokenizer are in cache; return (onnx path, tokenizer path).
fn ensure_cached(model_name: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
    let (onnx_rel, tokenizer_rel, _) = model_manifest(model_name)?;
    let dir = cache_dir()?;
    let model_dir = dir.join(model_name);
    let onnx_path = model_dir.join(onnx_rel);
    let tokenizer_path = model_dir.join(tokenizer_rel);
    download_to_cache(ALL_MINILM_REPO, onnx_rel, &onnx_path)?;
    download_to_cache(ALL_MINILM_REPO, tokenizer_rel, &tokenizer_path)?;
    Ok((onnx_path, tokenizer_path))
}

/// Runs the optimized graph on one batch of inputs.
type RunFn = dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send + Sync;

/// Local embedder running the ONNX graph with tract.
///
/// The tokenizer and the optimized plan are built once in [`load`](Self::load)
/// and shared by every query.
pub struct TractEmbedder {
    model_name: String,
    dims: usize,
    tokenizer: Arc<tokenizers::Tokenizer>,
    run: Arc<RunFn>,
}

impl TractEmbedder {
    /// Resolve the model, cache its files and build the inference plan.
    pub async fn load(config: &EmbeddingConfig) -> crate::error::Result<Self> {
        let (model_name, _) = resolve_local_model(config);
        let name = model_name.clone();

        let (dims, tokenizer, run) = tokio::task::spawn_blocking(move || {
            let (_, _, dims) = model_manifest(&name)?;
            let (onnx, tokenizer) = ensure_cached(&name)?;
            let (tokenizer, run) = build_session(&onnx, &tokenizer)?;
            Ok::<_, anyhow::Error>((dims, tokenizer, run))
        })
        .await
        .map_err(|e| RagError::Config(format!("model loader panicked: {}", e)))?
        .map_err(|e| RagError::Config(format!("Failed to prepare local embedding model: {}", e)))?;

        if let Some(configured) = config.dims {
            if configured != dims {
                return Err(RagError::Config(format!(
                    "embedding.dims = {} but {} produces {} dims",
                    configured, model_name, dims
                )));
            }
        }

        Ok(Self {
            model_name,
            dims,
            tokenizer: Arc::new(tokenizer),
            run,
        })
    }
}

fn build_session(
    onnx_path: &std::path::Path,
    tokenizer_path: &std::path::Path,
) -> anyhow::Result<(tokenizers::Tokenizer, Arc<RunFn>)> {
    let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path)
        .map_err(|e| anyhow::anyhow!("Load tokenizer: {}", e))?;

    let plan = tract_onnx::onnx()
        .model_for_path(onnx_path)
        .map_err(|e| anyhow::anyhow!("Load ONNX: {}", e))?
        .into_optimized()
        .map_err(|e| anyhow::anyhow!("Optimize: {}", e))?
        .into_runnable()
        .map_err(|e| anyhow::anyhow!("Build tract runnable: {}", e))?;
    tracing::debug!(onnx = %onnx_path.display(), "tract plan ready");

    let run: Arc<RunFn> = Arc::new(move |inputs| plan.run(inputs));
    Ok((tokenizer, run))
}

#[async_trait]
impl Embedder for TractEmbedder {
    fn provider(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> crate::error::Result<Vec<f32>> {
        let tokenizer = Arc::clone(&self.tokenizer);
        let run = Arc::clone(&self.run);
        let dims = self.dims;
        let text = text.to_string();

        tokio::task::spawn_blocking(move || run_tract_embed(&tokenizer, run.as_ref(), dims, &text))
            .await
            .map_err(|e| RagError::embedding("local", format!("inference task failed: {}", e)))?
            .map_err(|e| RagError::embedding("local", e.to_string()))
    }
}

fn run_tract_embed(
    tokenizer: &tokenizers::Tokenizer,
    run: &RunFn,
    dims: usize,
    text: &str,
) -> anyhow::Result<Vec<f32>> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| anyhow::anyhow!("Tokenize: {}", e))?;
    let len = encoding.get_ids().len().clamp(1, DEFAULT_MAX_LEN);

    let mut input_ids = vec![0i64; len];
    let mut attention_mask = vec![0i64; len];
    for (j, &id) in encoding.get_ids().iter().take(len).enumerate() {
        input_ids[j] = id as i64;
        attention_mask[j] = 1;
    }

    let input_ids_tensor = ndarray::Array2::from_shape_vec((1, len), input_ids)
        .map_err(|e| anyhow::anyhow!("Input ids shape: {}", e))?;
    let attention_mask_tensor = ndarray::Array2::from_shape_vec((1, len), attention_mask)
        .map_err(|e| anyhow::anyhow!("Attention mask shape: {}", e))?;

    let input_ids_t: Tensor = input_ids_tensor.into();
    let attention_mask_t: Tensor = attention_mask_tensor.into();
    let result = run(tvec!(input_ids_t.into(), attention_mask_t.into()))
        .map_err(|e| anyhow::anyhow!("Inference: {}", e))?;

    let output = result
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No output tensor"))?;
    let view = output
        .to_array_view::<f32>()
        .map_err(|e| anyhow::anyhow!("Output to array: {}", e))?;

    // Output is [1, seq_len, dims] (last_hidden_state, mean-pooled here) or [1, dims].
    let shape = view.shape();
    let pooled = match shape.len() {
        2 => view.slice(ndarray::s![0, ..]).iter().copied().collect(),
        3 => {
            let valid_len = len.min(shape[1]);
            let mut sum = vec![0f32; dims];
            for j in 0..valid_len {
                for (k, &v) in view.slice(ndarray::s![0, j, ..]).iter().enumerate() {
                    if k < dims {
                        sum[k] += v;
                    }
                }
            }
            for x in &mut sum {
                *x /= valid_len.max(1) as f32;
            }
            sum
        }
        _ => bail!("Unexpected output shape: {:?}", shape),
    };

    Ok(normalize_l2(pooled))
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_l2_unit_length() {
        let v = normalize_l2(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    fn word_tokenizer() -> tokenizers::Tokenizer {
        use tokenizers::models::wordlevel::WordLevel;
        let vocab = [("[UNK]".to_string(), 0u32), ("inflation".to_string(), 1u32)]
            .into_iter()
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        tokenizers::Tokenizer::new(model)
    }

    #[tokio::test]
    async fn test_plan_reused_across_queries() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let run: Arc<RunFn> = Arc::new(move |inputs: TVec<TValue>| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(inputs.len(), 2);
            let hidden = tract_ndarray::Array3::<f32>::from_shape_vec(
                (1, 1, 2),
                vec![3.0, 4.0],
            )
            .unwrap();
            Ok(tvec!(Tensor::from(hidden).into()))
        });
        let embedder = TractEmbedder {
            model_name: "all-minilm-l6-v2".to_string(),
            dims: 2,
            tokenizer: Arc::new(word_tokenizer()),
            run: Arc::clone(&run),
        };

        for _ in 0..3 {
            let v = embedder.embed("inflation").await.unwrap();
            assert!((v[0] - 0.6).abs() < 1e-6);
            assert!((v[1] - 0.8).abs() < 1e-6);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Only the embedder and this test hold the plan; queries borrow it.
        assert_eq!(Arc::strong_count(&run), 2);
    }

    #[test]
    fn test_manifest_rejects_unknown_model() {
        assert!(model_manifest("bge-large-en-v1.5").is_err());
        assert_eq!(model_manifest("all-minilm-l6-v2").unwrap().2, 384);
    }
}
