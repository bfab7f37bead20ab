//! Shared HTTP plumbing for the remote embedding and generation backends.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: `base`, `2 × base`, `4 × base`, … (exponent capped at 5)

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

/// Bounded retry settings for one backend.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Duration,
    /// Bound on waiting for response headers, for requests whose body is
    /// streamed and therefore cannot carry a whole-request timeout.
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(backoff_ms),
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (1u32 << (attempt - 1).min(5))
    }
}

/// Why a request ultimately failed.
#[derive(Debug)]
pub enum SendError {
    /// The backend refused the request with a non-retryable status.
    Rejected { status: StatusCode, body: String },
    /// Every attempt failed with a transient error.
    Unavailable(String),
}

impl SendError {
    /// Render as an error cause string.
    pub fn cause(&self) -> String {
        match self {
            SendError::Rejected { status, body } => format!("rejected ({}): {}", status, body),
            SendError::Unavailable(last) => format!("unavailable: {}", last),
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Send the request built by `make` until it succeeds or the policy is exhausted.
///
/// `make` is called once per attempt because a `RequestBuilder` is consumed by `send`.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    backend: &str,
    mut make: F,
) -> Result<Response, SendError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            tracing::warn!(
                backend,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = last_err.as_deref().unwrap_or(""),
                "retrying request"
            );
            tokio::time::sleep(delay).await;
        }

        let sent = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, make().send()).await {
                Ok(sent) => sent,
                Err(_) => {
                    last_err = Some(format!(
                        "timed out after {}ms waiting for a response",
                        limit.as_millis()
                    ));
                    continue;
                }
            },
            None => make().send().await,
        };

        match sent {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body = response.text().await.unwrap_or_default();
                if is_retryable(status) {
                    last_err = Some(format!("HTTP {}: {}", status, body));
                    continue;
                }

                return Err(SendError::Rejected { status, body });
            }
            Err(e) => {
                last_err = Some(if e.is_timeout() {
                    format!("request timed out: {}", e)
                } else {
                    e.to_string()
                });
                continue;
            }
        }
    }

    Err(SendError::Unavailable(
        last_err.unwrap_or_else(|| "request failed after retries".to_string()),
    ))
}

/// Splits a chunked byte stream into complete text lines.
///
/// Used for NDJSON bodies, whose records may be split across network chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completes, without the terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever remains after the body ends (a final unterminated line).
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
