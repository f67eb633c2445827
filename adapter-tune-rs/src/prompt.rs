//! Alpaca-style instruction prompts.

use serde::{Deserialize, Serialize};

/// An instruction with optional context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRecord {
    /// What the model should do.
    pub instruction: String,
    /// Extra context; empty when there is none.
    #[serde(default)]
    pub input: String,
}

impl PromptRecord {
    /// Record with the given instruction and input.
    pub fn new(instruction: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            input: input.into(),
        }
    }
}

/// Format `record` as an Alpaca prompt ending in `### Response:`.
///
/// ```rust
/// use adapter_tune_rs::prompt::{generate_prompt, PromptRecord};
///
/// let prompt = generate_prompt(&PromptRecord::new("Say hi.", ""));
/// assert!(prompt.ends_with("### Instruction:\nSay hi.\n\n### Response:"));
/// assert!(!prompt.contains("### Input:"));
/// ```
#[must_use]
pub fn generate_prompt(record: &PromptRecord) -> String {
    if record.input.is_empty() {
        format!(
            "Below is an instruction that describes a task. \
             Write a response that appropriately completes the request.\n\n\
             ### Instruction:\n{}\n\n### Response:",
            record.instruction
        )
    } else {
        format!(
            "Below is an instruction that describes a task, paired with an input that provides further context. \
             Write a response that appropriately completes the request.\n\n\
             ### Instruction:\n{}\n\n### Input:\n{}\n\n### Response:",
            record.instruction, record.input
        )
    }
}
