//! Reasoning Parser Module
//!
//! Splits an accumulating response buffer into reasoning text (inside
//! `<think>...</think>`) and answer text.
//!
//! ## Recompute, don't patch
//! The classifier is a pure function of the whole buffer seen so far. Callers
//! append each content fragment to the buffer and classify again; the result
//! replaces the previous view. This keeps partial tags at chunk boundaries
//! trivially correct at the cost of re-scanning the buffer on every chunk.
//!
//! ## Rules
//! - Only the last fully-closed block is shown as reasoning.
//! - If the last `<think>` comes after the last `</think>`, the block is still
//!   open: everything after the tag is reasoning, nothing after it is answer.
//! - Tool-call syntax is scrubbed from the answer; the buffer is untouched.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::tool_call_parser::scrub_tool_calls;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?s)<think>(.*?)</think>").unwrap();
}

/// Derived view of a response buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifiedView {
    /// Current reasoning text, trimmed.
    pub reasoning: String,
    /// Answer text with reasoning and tool-call syntax removed, trimmed.
    pub answer: String,
    /// True while the latest `<think>` block has not been closed yet.
    pub reasoning_open: bool,
}

impl ClassifiedView {
    pub fn has_reasoning(&self) -> bool {
        !self.reasoning.is_empty()
    }

    /// Reasoning that has been closed and can be collapsed by the UI.
    pub fn reasoning_complete(&self) -> bool {
        self.has_reasoning() && !self.reasoning_open
    }
}

/// Classify the full buffer seen so far.
///
/// Never fails: unmatched or nested tags fall through to the rules above.
pub fn classify(buffer: &str) -> ClassifiedView {
    let mut reasoning = THINK_BLOCK
        .captures_iter(buffer)
        .last()
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();
    let mut reasoning_open = false;

    let mut answer_source = buffer;
    if let Some(open_idx) = buffer.rfind(THINK_OPEN) {
        let still_open = buffer
            .rfind(THINK_CLOSE)
            .map_or(true, |close_idx| open_idx > close_idx);
        if still_open {
            reasoning = &buffer[open_idx + THINK_OPEN.len()..];
            reasoning_open = true;
            answer_source = &buffer[..open_idx];
        }
    }

    let without_blocks = THINK_BLOCK.replace_all(answer_source, "");
    let answer = scrub_tool_calls(&without_blocks);

    ClassifiedView {
        reasoning: reasoning.trim().to_string(),
        answer: answer.trim().to_string(),
        reasoning_open,
    }
}
