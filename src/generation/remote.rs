//! HTTP answer generators.
//!
//! | API | Endpoint | Streaming wire format |
//! |-----|----------|-----------------------|
//! | Ollama | `POST {url}/api/chat` | NDJSON, one `{"message":{"content"}}` per line |
//! | OpenAI-compatible | `POST {url}/v1/chat/completions` | SSE, `choices[0].delta.content`, ends with `[DONE]` |
//! | Hugging Face | `POST {url}/models/{model}` | SSE (TGI), `token.text` |
//!
//! Request setup is retried like the embedding path; once fragments start
//! flowing nothing is retried, since a replay would duplicate text.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

use super::{with_cancel, AnswerGenerator, CancelToken, FragmentStream};
use crate::config::GenerationConfig;
use crate::error::{RagError, Result};
use crate::http::{send_with_retry, LineBuffer, RetryPolicy};

/// Wire protocol spoken by an [`HttpGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationApi {
    Ollama,
    OpenAi,
    HuggingFace,
}

impl GenerationApi {
    fn from_provider(provider: &str) -> Option<Self> {
        match provider {
            "ollama" => Some(GenerationApi::Ollama),
            "openai" => Some(GenerationApi::OpenAi),
            "huggingface" => Some(GenerationApi::HuggingFace),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GenerationApi::Ollama => "ollama",
            GenerationApi::OpenAi => "openai",
            GenerationApi::HuggingFace => "huggingface",
        }
    }

    fn default_url(self) -> &'static str {
        match self {
            GenerationApi::Ollama => "http://localhost:11434",
            GenerationApi::OpenAi => "https://api.openai.com",
            GenerationApi::HuggingFace => "https://api-inference.huggingface.co",
        }
    }
}

/// Generation backend reached over HTTP.
pub struct HttpGenerator {
    api: GenerationApi,
    model: String,
    url: String,
    api_key: Option<String>,
    max_output_tokens: u32,
    temperature: Option<f32>,
    timeout: Duration,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpGenerator {
    /// Create a generator from configuration.
    ///
    /// # Errors
    ///
    /// [`RagError::Config`] for an unknown provider or a missing credential.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api = GenerationApi::from_provider(&config.provider).ok_or_else(|| {
            RagError::Config(format!(
                "Unknown generation provider: {}",
                config.provider
            ))
        })?;
        let api_key = config.api_key()?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| api.default_url().to_string());

        let mut generator = Self::with_api(
            api,
            config.model.clone(),
            url,
            api_key,
            Duration::from_secs(config.timeout_secs),
            RetryPolicy::new(config.max_retries, config.retry_backoff_ms),
        )?;
        generator.max_output_tokens = config.max_output_tokens;
        generator.temperature = config.temperature;
        Ok(generator)
    }

    /// Create a generator from explicit parts with default sampling settings.
    pub fn with_api(
        api: GenerationApi,
        model: String,
        url: String,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        // No whole-request timeout on the client: streamed bodies may
        // legitimately outlive it. Atomic requests set one per request.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RagError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api,
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            max_output_tokens: 300,
            temperature: None,
            timeout,
            client,
            retry,
        })
    }

    fn body(&self, prompt: &str, stream: bool) -> Value {
        match self.api {
            GenerationApi::Ollama => {
                let mut options = json!({ "num_predict": self.max_output_tokens });
                if let Some(t) = self.temperature {
                    options["temperature"] = json!(t);
                }
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "stream": stream,
                    "options": options,
                })
            }
            GenerationApi::OpenAi => {
                let mut body = json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "max_tokens": self.max_output_tokens,
                    "stream": stream,
                });
                if let Some(t) = self.temperature {
                    body["temperature"] = json!(t);
                }
                body
            }
            GenerationApi::HuggingFace => {
                let mut parameters = json!({
                    "max_new_tokens": self.max_output_tokens,
                    "return_full_text": false,
                });
                if let Some(t) = self.temperature {
                    parameters["temperature"] = json!(t);
                }
                json!({
                    "inputs": prompt,
                    "parameters": parameters,
                    "stream": stream,
                })
            }
        }
    }

    fn request(&self, prompt: &str, stream: bool) -> reqwest::RequestBuilder {
        let endpoint = match self.api {
            GenerationApi::Ollama => format!("{}/api/chat", self.url),
            GenerationApi::OpenAi => format!("{}/v1/chat/completions", self.url),
            GenerationApi::HuggingFace => format!("{}/models/{}", self.url, self.model),
        };

        let mut req = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(&self.body(prompt, stream));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if !stream {
            req = req.timeout(self.timeout);
        }
        req
    }
}

#[async_trait]
impl AnswerGenerator for HttpGenerator {
    fn provider(&self) -> &str {
        self.api.label()
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let provider = self.api.label();
        let response = send_with_retry(&self.retry, provider, || self.request(prompt, false))
            .await
            .map_err(|e| RagError::generation(provider, e.cause()))?;

        let json: Value = response.json().await.map_err(|e| {
            RagError::generation(provider, format!("invalid response body: {}", e))
        })?;
        parse_atomic(self.api, &json).map_err(|cause| RagError::generation(provider, cause))
    }

    async fn generate_stream(&self, prompt: &str, cancel: CancelToken) -> Result<FragmentStream> {
        let api = self.api;
        let provider = api.label();
        let idle = self.timeout;
        let policy = self.retry.with_attempt_timeout(self.timeout);

        let response = send_with_retry(&policy, provider, || self.request(prompt, true))
            .await
            .map_err(|e| RagError::generation(provider, e.cause()))?;

        let stream = match api {
            GenerationApi::Ollama => ndjson_fragments(response, idle),
            GenerationApi::OpenAi | GenerationApi::HuggingFace => {
                sse_fragments(api, response, idle)
            }
        };

        Ok(with_cancel(stream, cancel))
    }
}

fn idle_error(provider: &str, idle: Duration) -> RagError {
    RagError::generation(
        provider,
        format!("no data received for {}ms", idle.as_millis()),
    )
}

/// Ollama body: one JSON record per line.
fn ndjson_fragments(response: reqwest::Response, idle: Duration) -> FragmentStream {
    let provider = GenerationApi::Ollama.label();
    Box::pin(async_stream::try_stream! {
        let mut body = Box::pin(response.bytes_stream());
        let mut lines = LineBuffer::default();

        'read: loop {
            let next = tokio::time::timeout(idle, body.next())
                .await
                .map_err(|_| idle_error(provider, idle))?;
            let Some(chunk) = next else {
                if let Some(rest) = lines.finish() {
                    let decoded =
                        decode_ndjson(&rest).map_err(|cause| RagError::generation(provider, cause))?;
                    if let Some(text) = decoded.text {
                        yield text;
                    }
                }
                break 'read;
            };
            let chunk = chunk
                .map_err(|e| RagError::generation(provider, format!("stream error: {}", e)))?;

            for line in lines.push(&chunk) {
                let decoded =
                    decode_ndjson(&line).map_err(|cause| RagError::generation(provider, cause))?;
                if let Some(text) = decoded.text {
                    yield text;
                }
                if decoded.done {
                    break 'read;
                }
            }
        }
    })
}

/// OpenAI and TGI bodies: server-sent events, one JSON payload per event.
fn sse_fragments(api: GenerationApi, response: reqwest::Response, idle: Duration) -> FragmentStream {
    let provider = api.label();
    Box::pin(async_stream::try_stream! {
        let mut events = Box::pin(response.bytes_stream().eventsource());

        loop {
            let next = tokio::time::timeout(idle, events.next())
                .await
                .map_err(|_| idle_error(provider, idle))?;
            let Some(event) = next else {
                break;
            };
            let event = event
                .map_err(|e| RagError::generation(provider, format!("stream error: {}", e)))?;

            let decoded = decode_event_data(api, &event.data)
                .map_err(|cause| RagError::generation(provider, cause))?;
            if let Some(text) = decoded.text {
                yield text;
            }
            if decoded.done {
                break;
            }
        }
    })
}

/// One decoded record of a streamed body.
#[derive(Debug, Default, PartialEq)]
struct Decoded {
    text: Option<String>,
    done: bool,
}

/// Decode the `data` of one SSE event. Multi-line data arrives joined by `\n`.
fn decode_event_data(api: GenerationApi, data: &str) -> std::result::Result<Decoded, String> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(Decoded::default());
    }
    if data == "[DONE]" {
        return Ok(Decoded {
            text: None,
            done: true,
        });
    }
    let json: Value =
        serde_json::from_str(data).map_err(|e| format!("invalid stream event: {}", e))?;
    if let Some(err) = json.get("error") {
        return Err(error_message(err));
    }
    let text = match api {
        GenerationApi::HuggingFace => {
            let special = json
                .pointer("/token/special")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if special {
                None
            } else {
                json.pointer("/token/text").and_then(Value::as_str)
            }
        }
        _ => json
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str),
    };
    Ok(Decoded {
        text: text.filter(|t| !t.is_empty()).map(str::to_string),
        done: false,
    })
}

fn decode_ndjson(line: &str) -> std::result::Result<Decoded, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Decoded::default());
    }
    let json: Value =
        serde_json::from_str(line).map_err(|e| format!("invalid stream line: {}", e))?;
    if let Some(err) = json.get("error") {
        return Err(error_message(err));
    }
    let text = json
        .pointer("/message/content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let done = json.get("done").and_then(Value::as_bool).unwrap_or(false);
    Ok(Decoded { text, done })
}

fn error_message(err: &Value) -> String {
    err.as_str()
        .map(str::to_string)
        .or_else(|| err.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| err.to_string())
}

fn parse_atomic(api: GenerationApi, json: &Value) -> std::result::Result<String, String> {
    if let Some(err) = json.get("error") {
        return Err(error_message(err));
    }
    let text = match api {
        GenerationApi::Ollama => json.pointer("/message/content").and_then(Value::as_str),
        GenerationApi::OpenAi => json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str),
        GenerationApi::HuggingFace => json
            .pointer("/0/generated_text")
            .or_else(|| json.get("generated_text"))
            .and_then(Value::as_str),
    };
    text.map(str::to_string)
        .ok_or_else(|| format!("Invalid {} response: missing answer text", api.label()))
}
