//! TOML configuration parsing and validation.
//!
//! [`load_config`] reads the file, applies defaults, validates every section
//! and resolves relative artifact paths against the config file's directory.
//! Any problem is reported as [`RagError::Config`] so the process can refuse
//! to start before it serves a single query.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};

/// Hard upper bound on passages per query exposed to users.
pub const MAX_K: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Path to the `RAGIDX01` vector index file.
    pub path: PathBuf,
    /// Path to the JSON document store.
    pub store_path: PathBuf,
    /// Reject an index whose recorded store fingerprint does not match the store.
    #[serde(default = "default_true")]
    pub verify_fingerprint: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_k() -> usize {
    4
}
fn default_max_k() -> usize {
    MAX_K
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `local`, `openai`, `ollama`, or `huggingface`.
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Embed a short text at startup and compare its width with the index,
    /// instead of trusting `dims`. Costs one backend call.
    #[serde(default)]
    pub verify_dims: bool,
    /// Base URL of the embedding API. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the bearer credential.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `ollama`, `openai`, or `huggingface`.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_max_output_tokens() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptConfig {
    /// Overrides the built-in system instruction.
    #[serde(default)]
    pub system_instruction: Option<String>,
    /// Character budget for the whole rendered prompt.
    #[serde(default)]
    pub max_prompt_chars: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl EmbeddingConfig {
    /// Environment variable consulted for the credential, if the provider uses one.
    pub fn key_env(&self) -> Option<String> {
        self.api_key_env
            .clone()
            .or_else(|| default_key_env(&self.provider).map(str::to_string))
    }

    /// Read the bearer credential from the environment.
    ///
    /// # Errors
    ///
    /// [`RagError::Config`] when the provider requires a credential and the
    /// variable is unset or empty.
    pub fn api_key(&self) -> Result<Option<String>> {
        resolve_key(&self.provider, self.key_env(), "embedding")
    }
}

impl GenerationConfig {
    pub fn key_env(&self) -> Option<String> {
        self.api_key_env
            .clone()
            .or_else(|| default_key_env(&self.provider).map(str::to_string))
    }

    pub fn api_key(&self) -> Result<Option<String>> {
        resolve_key(&self.provider, self.key_env(), "generation")
    }
}

fn default_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "huggingface" => Some("HUGGINGFACE_API_KEY"),
        _ => None,
    }
}

fn key_required(provider: &str) -> bool {
    matches!(provider, "openai" | "huggingface")
}

fn resolve_key(provider: &str, env: Option<String>, section: &str) -> Result<Option<String>> {
    let value = env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|v| !v.trim().is_empty());
    if value.is_none() && key_required(provider) {
        return Err(RagError::Config(format!(
            "{}.provider '{}' requires a credential: set the {} environment variable",
            section,
            provider,
            env.unwrap_or_else(|| "API key".to_string())
        )));
    }
    Ok(value)
}

impl Config {
    /// Resolve relative artifact paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.index.path.is_relative() {
            self.index.path = base.join(&self.index.path);
        }
        if self.index.store_path.is_relative() {
            self.index.store_path = base.join(&self.index.store_path);
        }
    }

    /// Check the semantic constraints `serde` cannot express.
    pub fn validate(&self) -> Result<()> {
        // Validate retrieval
        if self.retrieval.max_k == 0 || self.retrieval.max_k > MAX_K {
            return Err(RagError::Config(format!(
                "retrieval.max_k must be in [1, {}]",
                MAX_K
            )));
        }
        if self.retrieval.default_k == 0 || self.retrieval.default_k > self.retrieval.max_k {
            return Err(RagError::Config(format!(
                "retrieval.default_k must be in [1, {}]",
                self.retrieval.max_k
            )));
        }

        // Validate embedding
        match self.embedding.provider.as_str() {
            "local" => {}
            "openai" | "ollama" | "huggingface" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    return Err(RagError::Config(format!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    )));
                }
                if self.embedding.model.is_none() {
                    return Err(RagError::Config(format!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    )));
                }
            }
            other => {
                return Err(RagError::Config(format!(
                    "Unknown embedding provider: '{}'. Must be local, openai, ollama, or huggingface.",
                    other
                )))
            }
        }
        if self.embedding.timeout_secs == 0 {
            return Err(RagError::Config(
                "embedding.timeout_secs must be > 0".to_string(),
            ));
        }

        // Validate generation
        match self.generation.provider.as_str() {
            "openai" | "ollama" | "huggingface" => {}
            other => {
                return Err(RagError::Config(format!(
                    "Unknown generation provider: '{}'. Must be openai, ollama, or huggingface.",
                    other
                )))
            }
        }
        if self.generation.model.trim().is_empty() {
            return Err(RagError::Config(
                "generation.model must not be empty".to_string(),
            ));
        }
        if self.generation.max_output_tokens == 0 {
            return Err(RagError::Config(
                "generation.max_output_tokens must be > 0".to_string(),
            ));
        }
        if let Some(t) = self.generation.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RagError::Config(
                    "generation.temperature must be in [0.0, 2.0]".to_string(),
                ));
            }
        }
        if self.generation.timeout_secs == 0 {
            return Err(RagError::Config(
                "generation.timeout_secs must be > 0".to_string(),
            ));
        }

        if self.prompt.max_prompt_chars == Some(0) {
            return Err(RagError::Config(
                "prompt.max_prompt_chars must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check that credentials and artifact files are present.
    ///
    /// Kept separate from [`validate`](Config::validate) so that commands
    /// which never reach a backend (e.g. `inspect`) can skip the credential check.
    pub fn check_credentials(&self) -> Result<()> {
        self.embedding.api_key()?;
        self.generation.api_key()?;
        Ok(())
    }

    pub fn check_artifacts(&self) -> Result<()> {
        if !self.index.path.exists() {
            return Err(RagError::Config(format!(
                "index file not found: {}",
                self.index.path.display()
            )));
        }
        if !self.index.store_path.exists() {
            return Err(RagError::Config(format!(
                "document store file not found: {}",
                self.index.store_path.display()
            )));
        }
        Ok(())
    }
}

/// Parse, validate and path-resolve the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RagError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut config = parse_config(&content)?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_paths(&base);
    Ok(config)
}

/// Parse and validate config text without touching the filesystem.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| RagError::Config(format!("Failed to parse config file: {}", e)))?;
    config.validate()?;
    Ok(config)
}
