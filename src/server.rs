//! HTTP front-end for the query pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/search` | Retrieved context passages only |
//! | `POST` | `/ask` | Context plus the generated answer |
//! | `POST` | `/ask/stream` | Server-sent events: `context`, `fragment`…, then `done` or `error` |
//!
//! Request body for the `POST` routes: `{ "question": "...", "k": 4 }` (`k` optional).
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "k must be between 1 and 10, got 0" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embedding_failed` (502),
//! `generation_failed` (502), `internal` (500).
//!
//! A failed generation on `/ask` is not an HTTP error: the response keeps
//! the retrieved `context` and reports the failure in `answer_error`.
//!
//! Dropping a `/ask/stream` connection drops the fragment stream, which
//! releases the backend response.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::RagError;
use crate::generation::CancelToken;
use crate::models::RetrievedItem;
use crate::pipeline::RagPipeline;

/// Starts the HTTP server on `[server].bind`.
///
/// All startup checks run before the listener is bound; a startup failure
/// is returned without serving anything.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(RagPipeline::open(config).await?);
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("RAG server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

/// Build the router over a ready pipeline.
pub fn router(pipeline: Arc<RagPipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/ask/stream", post(handle_ask_stream))
        .layer(cors)
        .with_state(pipeline)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl From<&RagError> for ErrorDetail {
    fn from(err: &RagError) -> Self {
        let code = match err {
            RagError::InvalidArgument(_) => "bad_request",
            RagError::Embedding { .. } => "embedding_failed",
            RagError::Generation { .. } => "generation_failed",
            _ => "internal",
        };
        ErrorDetail {
            code,
            message: err.to_string(),
        }
    }
}

struct AppError(RagError);

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RagError::Embedding { .. } | RagError::Generation { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: ErrorDetail::from(&self.0),
        };
        (status, Json(body)).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search, /ask ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    context: Vec<RetrievedItem>,
}

async fn handle_search(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let context = pipeline.search(&req.question, req.k).await?;
    Ok(Json(SearchResponse { context }))
}

#[derive(Serialize)]
struct AskResponse {
    context: Vec<RetrievedItem>,
    answer: Option<String>,
    answer_error: Option<ErrorDetail>,
}

async fn handle_ask(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<AskResponse>, AppError> {
    let answered = pipeline.ask(&req.question, req.k).await?;
    let (answer, answer_error) = match answered.answer {
        Ok(text) => (Some(text), None),
        Err(e) => (None, Some(ErrorDetail::from(&e))),
    };
    Ok(Json(AskResponse {
        context: answered.retrieved,
        answer,
        answer_error,
    }))
}

// ============ POST /ask/stream ============

#[derive(Serialize)]
struct FragmentPayload<'a> {
    text: &'a str,
}

fn json_event(name: &'static str, payload: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn handle_ask_stream(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Cancellation is by disconnect: axum drops this stream with the connection.
    let answer = pipeline
        .ask_stream(&req.question, req.k, CancelToken::never())
        .await?;

    let events = async_stream::stream! {
        yield Ok::<_, Infallible>(json_event(
            "context",
            &SearchResponse { context: answer.retrieved },
        ));

        match answer.fragments {
            Err(e) => {
                yield Ok(json_event("error", &ErrorDetail::from(&e)));
            }
            Ok(mut fragments) => {
                let mut failed = false;
                while let Some(item) = fragments.next().await {
                    match item {
                        Ok(text) => {
                            yield Ok(json_event("fragment", &FragmentPayload { text: &text }));
                        }
                        Err(e) => {
                            yield Ok(json_event("error", &ErrorDetail::from(&e)));
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    yield Ok(Event::default().event("done").data("{}"));
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let bad = ErrorDetail::from(&RagError::InvalidArgument("k".into()));
        assert_eq!(bad.code, "bad_request");
        let emb = ErrorDetail::from(&RagError::Embedding {
            provider: "ollama".into(),
            cause: "unavailable: refused".into(),
        });
        assert_eq!(emb.code, "embedding_failed");
        let generation = ErrorDetail::from(&RagError::Generation {
            provider: "openai".into(),
            cause: "rejected".into(),
        });
        assert_eq!(generation.code, "generation_failed");
        let other = ErrorDetail::from(&RagError::OutOfRange { id: 9, len: 3 });
        assert_eq!(other.code, "internal");
    }

    #[test]
    fn test_status_mapping() {
        let resp = AppError(RagError::InvalidArgument("empty".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = AppError(RagError::Embedding {
            provider: "x".into(),
            cause: "y".into(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let resp = AppError(RagError::Config("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
