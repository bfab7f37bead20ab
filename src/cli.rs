//! Command implementations for the `rag` binary.
//!
//! Each `run_*` function prints its rendered output to stdout. Diagnostics
//! go through `tracing` (stderr), so stdout stays clean for piping.
//!
//! Context passages are always printed before the answer, one block each:
//!
//! ```text
//! Chunk 1 (distance=0.1100)
//! B: unemployment fell
//! ```

use anyhow::{Context, Result};
use futures::StreamExt;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::config::Config;
use crate::generation::{cancel_pair, CancelToken};
use crate::index::VectorIndex;
use crate::models::RetrievedItem;
use crate::pipeline::{load_artifacts, Linkage, RagPipeline};

/// Render retrieved passages in rank order.
pub fn render_context(items: &[RetrievedItem]) -> String {
    if items.is_empty() {
        return "No passages retrieved.\n".to_string();
    }
    let mut out = String::new();
    for item in items {
        out.push_str(&format!(
            "Chunk {} (distance={:.4})\n{}\n\n",
            item.passage_id, item.distance, item.text
        ));
    }
    out
}

fn print_context(items: &[RetrievedItem]) {
    println!("=== Context ===");
    print!("{}", render_context(items));
}

pub async fn run_search(pipeline: &RagPipeline, question: &str, k: Option<usize>) -> Result<()> {
    let items = pipeline.search(question, k).await?;
    print_context(&items);
    Ok(())
}

/// Fires an [`Interrupts`] source by hand.
pub struct InterruptTrigger(watch::Sender<u64>);

impl InterruptTrigger {
    pub fn fire(&self) {
        self.0.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Ctrl-C presses seen by a single listener shared by a whole command.
#[derive(Clone)]
pub struct Interrupts {
    presses: watch::Receiver<u64>,
}

impl Interrupts {
    /// A source fired only through the returned trigger.
    pub fn manual() -> (InterruptTrigger, Self) {
        let (tx, rx) = watch::channel(0);
        (InterruptTrigger(tx), Self { presses: rx })
    }

    /// Install the process Ctrl-C listener. Call once per command.
    pub fn ctrl_c() -> Self {
        let (trigger, interrupts) = Self::manual();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                trigger.fire();
            }
        });
        interrupts
    }

    /// Resolves at the next press after this call; earlier presses are ignored.
    pub async fn pressed(&mut self) {
        self.presses.borrow_and_update();
        if self.presses.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Answer one question, atomically or streamed.
///
/// Context is printed even when generation fails; the failure is then
/// returned as the command's error. An interrupt ends a streamed answer
/// where it stands and abandons an atomic one.
pub async fn run_ask(
    pipeline: &RagPipeline,
    question: &str,
    k: Option<usize>,
    stream: bool,
    interrupts: &Interrupts,
) -> Result<()> {
    if stream {
        return run_ask_streaming(pipeline, question, k, interrupts).await;
    }

    let mut presses = interrupts.clone();
    let answered = tokio::select! {
        answered = pipeline.ask(question, k) => answered?,
        _ = presses.pressed() => anyhow::bail!("query cancelled"),
    };
    print_context(&answered.retrieved);
    println!("=== Answer ===");
    let answer = answered.answer.context("answer generation failed")?;
    println!("{}", answer);
    Ok(())
}

async fn run_ask_streaming(
    pipeline: &RagPipeline,
    question: &str,
    k: Option<usize>,
    interrupts: &Interrupts,
) -> Result<()> {
    let (handle, token) = cancel_pair();
    let watcher: CancelToken = token.clone();
    let mut presses = interrupts.clone();
    let forward = tokio::spawn(async move {
        presses.pressed().await;
        handle.cancel();
    });

    let result = stream_answer(pipeline, question, k, token).await;
    forward.abort();

    if watcher.is_cancelled() {
        println!();
        println!("[generation cancelled]");
    }
    result
}

async fn stream_answer(
    pipeline: &RagPipeline,
    question: &str,
    k: Option<usize>,
    token: CancelToken,
) -> Result<()> {
    let streaming = pipeline.ask_stream(question, k, token).await?;
    print_context(&streaming.retrieved);
    println!("=== Answer ===");

    let mut fragments = streaming
        .fragments
        .context("answer generation failed")?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        let fragment = fragment.context("answer generation failed")?;
        print!("{}", fragment);
        stdout.flush()?;
    }
    println!();
    Ok(())
}

/// Interactive question loop over stdin.
///
/// Ends on EOF, `exit`/`quit`, or an interrupt at the prompt. An interrupt
/// during a query only ends that query. A failed query is reported and the
/// loop continues with the same pipeline.
pub async fn run_chat(
    pipeline: &RagPipeline,
    k: Option<usize>,
    stream: bool,
    interrupts: &Interrupts,
) -> Result<()> {
    println!("Ask a question (exit, quit, Ctrl-D or Ctrl-C to leave).");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut presses = interrupts.clone();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = presses.pressed() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        if let Err(e) = run_ask(pipeline, question, k, stream, interrupts).await {
            eprintln!("Error: {:#}", e);
        }
        println!();
    }
    Ok(())
}

/// Describe the index and store without contacting any backend.
pub fn run_inspect(config: &Config) -> Result<()> {
    let (index, store) = load_artifacts(config)?;

    println!("Index:      {}", config.index.path.display());
    println!("  metric:   {}", index.metric());
    println!("  dims:     {}", index.dims());
    println!("  vectors:  {}", index.len());
    println!("Store:      {}", config.index.store_path.display());
    println!("  passages: {}", store.len());
    println!("  sha256:   {}", hex::encode(store.fingerprint()));

    let linkage = match Linkage::check(&index, &store) {
        Linkage::Unlinked => "unlinked (index records no store fingerprint)",
        Linkage::Matches => "ok (index was built from this store)",
        Linkage::Mismatch => "MISMATCH (index was built from a different store)",
    };
    println!("Linkage:    {}", linkage);

    let covered = store.max_id().map(|m| m + 1).unwrap_or(0);
    if index.len() as i64 > covered {
        println!(
            "Warning:    {} index rows have no passage in the store",
            index.len() as i64 - covered
        );
    }
    Ok(())
}
