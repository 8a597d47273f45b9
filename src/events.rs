/// Turn updates for chatflow front ends
///
/// This module defines the contract between a running turn and whatever renders it.
/// Updates flow in one direction: Turn → renderer (over an unbounded channel).
/// Renderer → turn communication goes through the cancellation token instead.
use serde::Serialize;

use crate::chat_manager::TurnOutcome;
use crate::iteration_log::{EntryHandle, LogEntry};
use crate::protocol::GenerationStatus;
use crate::reasoning_parser::ClassifiedView;
use crate::tool_execution::orchestrator::ToolRun;

/// The single-line indicator shown while a turn is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "tool", rename_all = "snake_case")]
pub enum StatusLine {
    Thinking,
    FunctionCalling,
    Answering,
    /// MCP mode, between `tool_call_start` and its completion.
    CallingTool(String),
    Error,
    /// Shown after a user cancellation, never `Error`.
    Paused,
    Cleared,
}

impl StatusLine {
    pub fn label(&self) -> String {
        match self {
            StatusLine::Thinking => "thinking".to_string(),
            StatusLine::FunctionCalling => "function calling".to_string(),
            StatusLine::Answering => "answering".to_string(),
            StatusLine::CallingTool(name) => format!("calling {}", name),
            StatusLine::Error => "error".to_string(),
            StatusLine::Paused => "paused".to_string(),
            StatusLine::Cleared => String::new(),
        }
    }
}

impl From<GenerationStatus> for StatusLine {
    fn from(status: GenerationStatus) -> Self {
        match status {
            GenerationStatus::Thinking => StatusLine::Thinking,
            GenerationStatus::FunctionCalling => StatusLine::FunctionCalling,
            GenerationStatus::Answering => StatusLine::Answering,
            GenerationStatus::Error => StatusLine::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnUpdate {
    Status {
        status: StatusLine,
    },
    /// Re-classified view; only sent when it differs from the last one.
    View {
        view: ClassifiedView,
    },
    /// An in-band `error` event or a transport failure. Replaces the answer text.
    Error {
        error: String,
    },
    LogAppended {
        handle: EntryHandle,
        entry: LogEntry,
    },
    LogUpdated {
        handle: EntryHandle,
        entry: LogEntry,
    },
    ToolRunStarted {
        index: usize,
        run: ToolRun,
    },
    ToolRunFinished {
        index: usize,
        run: ToolRun,
    },
    Finished {
        outcome: TurnOutcome,
    },
}
