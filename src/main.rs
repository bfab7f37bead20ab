//! # Grounded RAG CLI (`rag`)
//!
//! Answers questions from a pre-built vector index and document store,
//! grounding every answer in retrieved passages.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag ask "<question>"` | Print the retrieved context, then the answer |
//! | `rag search "<question>"` | Print the retrieved context only |
//! | `rag chat` | Interactive question loop over stdin |
//! | `rag inspect` | Describe the index and store without contacting backends |
//! | `rag serve` | Start the HTTP server |
//!
//! Logging is controlled with `RAG_LOG` (e.g. `RAG_LOG=grounded_rag=debug`)
//! and written to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use grounded_rag::{cli, config, pipeline::RagPipeline, server};

/// Grounded RAG: question answering over a pre-built vector index.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "Question answering grounded in a pre-built vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Relative artifact paths inside it resolve against its directory.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question from the indexed passages.
    Ask {
        question: String,

        /// Number of passages to retrieve (1 to `retrieval.max_k`).
        #[arg(long)]
        k: Option<usize>,

        /// Print the answer as it is generated. Ctrl-C stops generation.
        #[arg(long)]
        stream: bool,
    },

    /// Retrieve context passages without generating an answer.
    Search {
        question: String,

        #[arg(long)]
        k: Option<usize>,
    },

    /// Ask questions interactively until EOF.
    Chat {
        #[arg(long)]
        k: Option<usize>,

        #[arg(long)]
        stream: bool,
    },

    /// Show index metric, dimension, size and store linkage.
    Inspect,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RAG_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&args.config)
        .with_context(|| format!("cannot start with config {}", args.config.display()))?;

    match args.command {
        Commands::Inspect => {
            cli::run_inspect(&cfg)?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask { question, k, stream } => {
            let pipeline = RagPipeline::open(&cfg).await?;
            cli::run_ask(&pipeline, &question, k, stream, &cli::Interrupts::ctrl_c()).await?;
        }
        Commands::Search { question, k } => {
            let pipeline = RagPipeline::open(&cfg).await?;
            cli::run_search(&pipeline, &question, k).await?;
        }
        Commands::Chat { k, stream } => {
            let pipeline = RagPipeline::open(&cfg).await?;
            cli::run_chat(&pipeline, k, stream, &cli::Interrupts::ctrl_c()).await?;
        }
    }

    Ok(())
}
