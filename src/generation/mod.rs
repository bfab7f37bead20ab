//! Answer generation boundary.
//!
//! [`AnswerGenerator`] exposes an atomic call and a streaming call. A stream
//! is a lazy, finite, non-restartable sequence of text fragments; callers
//! concatenate fragments in arrival order to reconstruct the answer (see
//! [`collect_fragments`]). For a deterministic backend, the concatenation
//! equals the atomic result for the same prompt.
//!
//! A stream ends early when its [`CancelToken`] fires or when the caller
//! drops it; either way the underlying backend response is released.

pub mod cancel;
mod remote;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::error::Result;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use remote::{GenerationApi, HttpGenerator};

/// Fragments of a streamed answer.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Produces an answer for an assembled prompt.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Backend label used in errors and logs.
    fn provider(&self) -> &str;
    fn model_name(&self) -> &str;

    /// Generate the whole answer in one call.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Start a streamed generation.
    ///
    /// Errors before the first fragment (connection, rejected request) are
    /// returned directly; later failures arrive as an `Err` item that ends
    /// the stream.
    async fn generate_stream(&self, prompt: &str, cancel: CancelToken) -> Result<FragmentStream>;
}

/// Drain a stream and concatenate its fragments in arrival order.
pub async fn collect_fragments(mut stream: FragmentStream) -> Result<String> {
    let mut answer = String::new();
    while let Some(fragment) = stream.next().await {
        answer.push_str(&fragment?);
    }
    Ok(answer)
}

/// Wrap a stream so it ends as soon as `cancel` fires.
pub fn with_cancel(mut stream: FragmentStream, mut cancel: CancelToken) -> FragmentStream {
    Box::pin(async_stream::stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = stream.next() => next,
            };
            match next {
                Some(item) => yield item,
                None => break,
            }
        }
    })
}

/// Create the [`AnswerGenerator`] named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn AnswerGenerator>> {
    Ok(Arc::new(HttpGenerator::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use futures::stream;

    fn fragments(parts: &[&str]) -> FragmentStream {
        let items: Vec<Result<String>> = parts.iter().map(|p| Ok(p.to_string())).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_collect_concatenates_in_order() {
        let answer = collect_fragments(fragments(&["Unemp", "loyment ", "fell."]))
            .await
            .unwrap();
        assert_eq!(answer, "Unemployment fell.");
    }

    #[tokio::test]
    async fn test_collect_stops_at_error() {
        let items: Vec<Result<String>> = vec![
            Ok("partial".to_string()),
            Err(RagError::generation("test", "connection reset")),
        ];
        let err = collect_fragments(Box::pin(stream::iter(items)))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Generation { .. }));
    }

    #[tokio::test]
    async fn test_with_cancel_stops_stream() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        let mut s = with_cancel(fragments(&["a", "b"]), token);
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_with_cancel_passes_through_when_idle() {
        let s = with_cancel(fragments(&["a", "b"]), CancelToken::never());
        assert_eq!(collect_fragments(s).await.unwrap(), "ab");
    }
}
