//! Grounded prompt assembly.
//!
//! [`PromptAssembler::build`] is a pure function of the system instruction,
//! the retrieved items (in the order given) and the question. Items are
//! rendered in exactly the order received, each tagged with its passage id
//! and distance so that claims in the answer can be traced to a chunk:
//!
//! ```text
//! <system instruction>
//!
//! Retrieved context (relevant excerpts):
//! [chunk id=1 | dist=0.1234]
//! <passage text>
//!
//! ---
//! [chunk id=0 | dist=0.5678]
//! <passage text>
//!
//! Question: <question>
//!
//! <grounding instructions>
//! ```
//!
//! With a character budget, items are dropped from the end (least relevant)
//! until the prompt fits. The system instruction, question and grounding
//! instructions are never cut.

use std::fmt;

use crate::config::PromptConfig;
use crate::models::RetrievedItem;

/// Joins rendered context items.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an expert assistant for the indexed reference documents. \
Answer in the language of the question and cite the chunk ids you rely on when useful.";

/// Appended to every prompt. Keeps answers grounded in the retrieved context.
pub const GROUNDING_INSTRUCTIONS: &str = "Answer clearly and concisely, relying on the context above.\n\
If the information is not in the context, say so explicitly and suggest how it could be obtained.";

const CONTEXT_HEADING: &str = "Retrieved context (relevant excerpts):";

/// An assembled prompt, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system_instruction: String,
    pub context_block: String,
    pub question: String,
    /// Items rendered into `context_block`.
    pub included: usize,
    /// Items dropped to respect the character budget.
    pub omitted: usize,
}

impl Prompt {
    /// The full text sent to the language model.
    pub fn render(&self) -> String {
        render_parts(&self.system_instruction, &self.context_block, &self.question)
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn render_parts(system: &str, context: &str, question: &str) -> String {
    format!(
        "{system}\n\n{CONTEXT_HEADING}\n{context}\n\nQuestion: {question}\n\n{GROUNDING_INSTRUCTIONS}"
    )
}

/// Render one retrieved item with its provenance tag.
pub fn render_item(item: &RetrievedItem) -> String {
    format!(
        "[chunk id={} | dist={:.4}]\n{}",
        item.passage_id, item.distance, item.text
    )
}

/// Builds [`Prompt`]s from retrieved items.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    system_instruction: String,
    max_prompt_chars: Option<usize>,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            max_prompt_chars: None,
        }
    }
}

impl PromptAssembler {
    pub fn new(system_instruction: impl Into<String>, max_prompt_chars: Option<usize>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            max_prompt_chars,
        }
    }

    pub fn from_config(config: &PromptConfig) -> Self {
        Self::new(
            config
                .system_instruction
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            config.max_prompt_chars,
        )
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    /// Assemble a prompt from `retrieved`, preserving its order.
    pub fn build(&self, question: &str, retrieved: &[RetrievedItem]) -> Prompt {
        let rendered: Vec<String> = retrieved.iter().map(render_item).collect();

        let mut included = rendered.len();
        if let Some(budget) = self.max_prompt_chars {
            let fixed = render_parts(&self.system_instruction, "", question)
                .chars()
                .count();
            let sep = CONTEXT_SEPARATOR.chars().count();
            let mut total = fixed
                + rendered.iter().map(|r| r.chars().count()).sum::<usize>()
                + sep * rendered.len().saturating_sub(1);

            while included > 0 && total > budget {
                included -= 1;
                total -= rendered[included].chars().count();
                if included > 0 {
                    total -= sep;
                }
            }
        }

        if included < rendered.len() {
            tracing::debug!(
                kept = included,
                dropped = rendered.len() - included,
                "context truncated to fit prompt budget"
            );
        }

        Prompt {
            system_instruction: self.system_instruction.clone(),
            context_block: rendered[..included].join(CONTEXT_SEPARATOR),
            question: question.to_string(),
            included,
            omitted: rendered.len() - included,
        }
    }
}
