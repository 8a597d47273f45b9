//! Iteration Event Log
//!
//! Renders the server-orchestrated (MCP) agent protocol as an ordered list
//! of entries. Entries are append-only; the single exception is the status
//! of a `ToolCall` entry, which the matching completion or error event
//! updates in place.
//!
//! ## Correlation
//! Wire events carry no call identifier. A completion belongs to the most
//! recently started call, which only holds while the server runs tools one
//! after another. That lookup lives in [`CallCorrelator`] so an identifier
//! can replace it without touching the log itself.

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{StreamEvent, ToolCallStatus};

/// Stable index of an entry for the lifetime of its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EntryHandle(usize);

impl EntryHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InfoKind {
    ToolCallsDetected { count: usize },
    IterationComplete { iteration: u32, has_tool_calls: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallEntry {
    pub name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Iteration {
        iteration: u32,
        time: Option<String>,
    },
    Thinking {
        content: String,
        time: Option<String>,
    },
    Info {
        info: InfoKind,
        time: Option<String>,
    },
    Warning {
        max_iterations: u32,
        time: Option<String>,
    },
    ToolCall(ToolCallEntry),
}

impl LogEntry {
    pub fn title(&self) -> String {
        match self {
            LogEntry::Iteration { iteration, .. } => format!("Round {}", iteration),
            LogEntry::Thinking { .. } => "Model reasoning".to_string(),
            LogEntry::Info { info, .. } => match info {
                InfoKind::ToolCallsDetected { count } => format!("Detected {} tool call(s)", count),
                InfoKind::IterationComplete {
                    has_tool_calls: true,
                    ..
                } => "Tools finished, continuing".to_string(),
                InfoKind::IterationComplete {
                    has_tool_calls: false,
                    ..
                } => "Processing complete".to_string(),
            },
            LogEntry::Warning { max_iterations, .. } => {
                format!("Reached maximum iterations ({})", max_iterations)
            }
            LogEntry::ToolCall(call) => format!("Calling tool: {}", call.name),
        }
    }

    /// Body text shown under the title, if any.
    pub fn detail(&self) -> Option<String> {
        match self {
            LogEntry::Thinking { content, .. } => Some(content.clone()),
            LogEntry::ToolCall(call) => {
                let mut out = serde_json::to_string_pretty(&call.arguments).ok()?;
                match call.status {
                    ToolCallStatus::Executing => {}
                    ToolCallStatus::Success => {
                        if let Some(result) = &call.result {
                            out.push_str("\n=> ");
                            out.push_str(&render_value(result));
                        }
                    }
                    ToolCallStatus::Error => {
                        out.push_str("\nerror: ");
                        out.push_str(call.error.as_deref().unwrap_or("unknown error"));
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }

    pub fn time(&self) -> Option<&str> {
        match self {
            LogEntry::Iteration { time, .. }
            | LogEntry::Thinking { time, .. }
            | LogEntry::Info { time, .. }
            | LogEntry::Warning { time, .. } => time.as_deref(),
            LogEntry::ToolCall(call) => call.time.as_deref(),
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What a single event did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChange {
    Appended(EntryHandle),
    Updated(EntryHandle),
}

impl LogChange {
    pub fn handle(self) -> EntryHandle {
        match self {
            LogChange::Appended(h) | LogChange::Updated(h) => h,
        }
    }
}

/// Resolves completion events to the call they finish.
#[derive(Debug, Default)]
pub struct CallCorrelator {
    started: Vec<EntryHandle>,
}

impl CallCorrelator {
    pub fn record_start(&mut self, handle: EntryHandle) {
        self.started.push(handle);
    }

    /// The most recently started call. Completing it does not pop it, so a
    /// duplicate completion lands on the same entry again.
    pub fn resolve(&self) -> Option<EntryHandle> {
        self.started.last().copied()
    }
}

#[derive(Debug, Default)]
pub struct IterationLog {
    entries: Vec<LogEntry>,
    correlator: CallCorrelator,
}

impl IterationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&LogEntry> {
        self.entries.get(handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one event. Events outside the MCP vocabulary, and completions
    /// with no started call to attach to, leave the log untouched.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<LogChange> {
        match event {
            StreamEvent::Status { .. }
            | StreamEvent::Content { .. }
            | StreamEvent::Error { .. }
            | StreamEvent::Done { .. } => None,
            StreamEvent::IterationStart {
                iteration,
                timestamp,
            } => Some(self.append(LogEntry::Iteration {
                iteration: *iteration,
                time: format_time(timestamp.as_deref()),
            })),
            StreamEvent::ThinkingExtracted {
                thinking,
                timestamp,
            } => Some(self.append(LogEntry::Thinking {
                content: thinking.clone(),
                time: format_time(timestamp.as_deref()),
            })),
            StreamEvent::ToolCallsParsed { count, timestamp } => Some(self.append(LogEntry::Info {
                info: InfoKind::ToolCallsDetected { count: *count },
                time: format_time(timestamp.as_deref()),
            })),
            StreamEvent::ToolCallStart {
                name,
                arguments,
                timestamp,
            } => {
                let change = self.append(LogEntry::ToolCall(ToolCallEntry {
                    name: name.clone(),
                    arguments: arguments.clone(),
                    status: ToolCallStatus::Executing,
                    result: None,
                    error: None,
                    time: format_time(timestamp.as_deref()),
                }));
                self.correlator.record_start(change.handle());
                Some(change)
            }
            StreamEvent::ToolCallComplete {
                success, result, ..
            } => self.update_call(|call| {
                if *success {
                    call.status = ToolCallStatus::Success;
                    call.result = Some(result.clone());
                } else {
                    call.status = ToolCallStatus::Error;
                    call.error = Some(
                        result
                            .get("error")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| render_value(result)),
                    );
                }
            }),
            StreamEvent::ToolCallError { error, .. } => self.update_call(|call| {
                call.status = ToolCallStatus::Error;
                call.error = Some(error.clone());
            }),
            StreamEvent::IterationComplete {
                iteration,
                has_tool_calls,
                timestamp,
            } => Some(self.append(LogEntry::Info {
                info: InfoKind::IterationComplete {
                    iteration: *iteration,
                    has_tool_calls: *has_tool_calls,
                },
                time: format_time(timestamp.as_deref()),
            })),
            StreamEvent::MaxIterationsReached {
                max_iterations,
                timestamp,
            } => Some(self.append(LogEntry::Warning {
                max_iterations: *max_iterations,
                time: format_time(timestamp.as_deref()),
            })),
        }
    }

    fn append(&mut self, entry: LogEntry) -> LogChange {
        let handle = EntryHandle(self.entries.len());
        self.entries.push(entry);
        LogChange::Appended(handle)
    }

    fn update_call(&mut self, f: impl FnOnce(&mut ToolCallEntry)) -> Option<LogChange> {
        let Some(handle) = self.correlator.resolve() else {
            tracing::warn!("tool call result with no started call, ignoring");
            return None;
        };
        match self.entries.get_mut(handle.0) {
            Some(LogEntry::ToolCall(call)) => {
                f(call);
                Some(LogChange::Updated(handle))
            }
            _ => None,
        }
    }
}

/// `HH:MM:SS` from an ISO-8601 timestamp, with or without an offset.
fn format_time(timestamp: Option<&str>) -> Option<String> {
    let raw = timestamp?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.format("%H:%M:%S").to_string());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.format("%H:%M:%S").to_string())
}
