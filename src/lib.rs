//! # Grounded RAG
//!
//! Retrieval-augmented question answering over a pre-built vector index.
//!
//! A question is embedded, its nearest passages are looked up in the index
//! and resolved through the document store, and the passages are assembled
//! into a prompt that instructs the language model to answer only from the
//! supplied context. Building the index (chunking, corpus embedding) is out
//! of scope; the index and store are loaded as immutable artifacts.
//!
//! ## Architecture
//!
//! ```text
//! question ─▶ Embedder ─▶ VectorIndex ─▶ DocumentStore
//!                                            │
//!                                            ▼
//!                                     PromptAssembler ─▶ AnswerGenerator
//!                                                           │
//!                      ┌────────────────────────────────────┤
//!                      ▼                                    ▼
//!                 ┌──────────┐                        ┌──────────┐
//!                 │   CLI    │                        │   HTTP   │
//!                 │  (rag)   │                        │  (axum)  │
//!                 └──────────┘                        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag inspect                             # check index/store linkage
//! rag search "What happened to unemployment?"
//! rag ask "What happened to unemployment?" --k 2 --stream
//! rag serve                               # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Pipeline error type |
//! | [`models`] | Core data types |
//! | [`index`] | Flat vector index and its file format |
//! | [`store`] | Passage id → text lookup |
//! | [`embedding`] | Query embedding backends |
//! | [`retriever`] | Embed, search, resolve |
//! | [`prompt`] | Grounded prompt assembly |
//! | [`generation`] | Atomic and streamed answer backends |
//! | [`http`] | Retry and line-framing helpers for remote backends |
//! | [`pipeline`] | Startup checks and the end-to-end query |
//! | [`cli`] | `rag` command implementations |
//! | [`server`] | HTTP server |

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod http;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retriever;
pub mod server;
pub mod store;
