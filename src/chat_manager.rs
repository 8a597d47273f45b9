use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::ConversationHistory;
use crate::error::ChatError;
use crate::events::{StatusLine, TurnUpdate};
use crate::iteration_log::{IterationLog, LogChange, LogEntry};
use crate::protocol::{ChatMessage, ChatRequest, ChatRole, MediaRef, ModelParams, StreamEvent};
use crate::reasoning_parser::{classify, ClassifiedView};
use crate::stream_client::{ChatTransport, EventReader};
use crate::tool_call_parser::extract_tool_calls;
use crate::tool_execution::{run_tool_calls, ToolExecutor, ToolRun};

/// Who handles tool calls for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ToolMode {
    /// No tool handling at all.
    #[default]
    #[serde(rename = "off")]
    Off,
    /// Extract calls from the finished answer and run them here.
    #[serde(rename = "client")]
    ClientParse,
    /// The server runs tools and reports progress as MCP events.
    #[serde(rename = "mcp")]
    ServerMcp,
}

impl ToolMode {
    pub fn auto_parse(self) -> bool {
        self == ToolMode::ServerMcp
    }
}

/// Everything needed to build a request besides the transcript.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnSettings {
    pub model_id: Option<String>,
    pub enabled_tools: Vec<String>,
    pub params: ModelParams,
    pub mode: ToolMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    /// Aborted by the user; rendered as "paused".
    Cancelled,
    Failed(String),
}

/// The one in-flight generation and its cancellation token.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub turn_id: Uuid,
    cancel: CancellationToken,
}

impl GenerationSession {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Single-flight gate: `Idle -> Active -> Idle`, never two sessions at once.
#[derive(Debug, Default)]
pub struct SessionController {
    active: Option<GenerationSession>,
    last_outcome: Option<TurnOutcome>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        if self.active.is_some() {
            SessionState::Active
        } else {
            SessionState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Open a session with a fresh token. Rejected, not queued, when busy.
    pub fn begin(&mut self) -> Result<GenerationSession, ChatError> {
        if self.active.is_some() {
            return Err(ChatError::SessionBusy);
        }
        let session = GenerationSession {
            turn_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        };
        self.active = Some(session.clone());
        Ok(session)
    }

    /// Signal the active session to stop. Returns false when idle.
    pub fn cancel(&self) -> bool {
        match &self.active {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(GenerationSession::cancel_token)
    }

    /// Return to idle and drop the token. A stale `turn_id` is ignored.
    pub fn finish(&mut self, turn_id: Uuid, outcome: TurnOutcome) -> bool {
        match &self.active {
            Some(session) if session.turn_id == turn_id => {
                self.active = None;
                self.last_outcome = Some(outcome);
                true
            }
            _ => {
                tracing::warn!(%turn_id, "finish for a turn that is not active");
                false
            }
        }
    }

    pub fn last_outcome(&self) -> Option<&TurnOutcome> {
        self.last_outcome.as_ref()
    }
}

/// Owns the conversation and gates turns on it.
pub struct ChatManager {
    conversation: ConversationHistory,
    controller: SessionController,
    settings: TurnSettings,
}

impl ChatManager {
    pub fn new(settings: TurnSettings) -> Self {
        Self {
            conversation: ConversationHistory::new(),
            controller: SessionController::new(),
            settings,
        }
    }

    pub fn conversation(&self) -> &ConversationHistory {
        &self.conversation
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut TurnSettings {
        &mut self.settings
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    pub fn last_outcome(&self) -> Option<&TurnOutcome> {
        self.controller.last_outcome()
    }

    /// Validate, append the user message, and hand back a runnable turn.
    ///
    /// Every rejection happens before the conversation is touched.
    pub fn start_turn(&mut self, text: &str, media: Vec<MediaRef>) -> Result<Turn, ChatError> {
        if self.controller.is_active() {
            return Err(ChatError::SessionBusy);
        }
        let model_id = match self.settings.model_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(ChatError::NoModelSelected),
        };
        let text = text.trim();
        if text.is_empty() && media.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let session = self.controller.begin()?;
        self.conversation
            .push(ChatMessage::new(ChatRole::User, text.to_string()).with_media(media));

        let mode = self.settings.mode;
        let request = ChatRequest {
            model_id,
            messages: self.conversation.to_wire(),
            enabled_tools: self.settings.enabled_tools.clone(),
            params: self.settings.params.clone(),
            auto_parse: mode.auto_parse(),
        };
        tracing::info!(
            turn_id = %session.turn_id,
            model = %request.model_id,
            ?mode,
            messages = request.messages.len(),
            "starting turn"
        );

        Ok(Turn::new(session, request, mode))
    }

    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    pub fn cancel_handle(&self) -> Option<CancellationToken> {
        self.controller.cancel_handle()
    }

    /// Record the turn's result in the transcript and go back to idle.
    ///
    /// Completed turns append their answer, failed turns the error text,
    /// cancelled turns nothing.
    pub fn finish_turn(&mut self, report: &TurnReport) {
        let content = match &report.outcome {
            TurnOutcome::Completed if report.view.answer.is_empty() => None,
            TurnOutcome::Completed => Some(report.view.answer.clone()),
            TurnOutcome::Failed(error) => Some(error.clone()),
            TurnOutcome::Cancelled => None,
        };
        if let Some(content) = content {
            self.conversation
                .push(ChatMessage::new(ChatRole::Assistant, content));
        }

        tracing::info!(turn_id = %report.turn_id, outcome = ?report.outcome, "turn finished");
        self.controller
            .finish(report.turn_id, report.outcome.clone());
    }

    pub fn clear_conversation(&mut self) -> Result<(), ChatError> {
        if self.controller.is_active() {
            return Err(ChatError::SessionBusy);
        }
        self.conversation.clear();
        Ok(())
    }
}

/// Everything a finished turn produced.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: Uuid,
    pub outcome: TurnOutcome,
    pub view: ClassifiedView,
    pub log: Vec<LogEntry>,
    pub tool_runs: Vec<ToolRun>,
}

/// State owned by one in-flight turn, dropped when it ends.
pub struct Turn {
    session: GenerationSession,
    request: ChatRequest,
    mode: ToolMode,
    buffer: String,
    view: ClassifiedView,
    log: IterationLog,
    status: StatusLine,
    server_error: Option<String>,
    tool_runs: Vec<ToolRun>,
}

impl Turn {
    fn new(session: GenerationSession, request: ChatRequest, mode: ToolMode) -> Self {
        Self {
            session,
            request,
            mode,
            buffer: String::new(),
            view: ClassifiedView::default(),
            log: IterationLog::new(),
            status: StatusLine::Cleared,
            server_error: None,
            tool_runs: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.session.turn_id
    }

    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.session.cancel_token()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn view(&self) -> &ClassifiedView {
        &self.view
    }

    pub fn log(&self) -> &IterationLog {
        &self.log
    }

    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    /// Apply one decoded event. `Break` once the stream is done.
    pub fn handle_event(
        &mut self,
        event: StreamEvent,
        updates: &UnboundedSender<TurnUpdate>,
    ) -> ControlFlow<()> {
        match event {
            StreamEvent::Status { status } => self.set_status(status.into(), updates),
            StreamEvent::Content { content } => {
                self.buffer.push_str(&content);
                let view = classify(&self.buffer);
                if view != self.view {
                    self.view = view.clone();
                    let _ = updates.send(TurnUpdate::View { view });
                }
            }
            StreamEvent::Error { error } => {
                tracing::warn!("server reported error: {}", error);
                self.set_status(StatusLine::Error, updates);
                self.server_error = Some(error.clone());
                let _ = updates.send(TurnUpdate::Error { error });
            }
            StreamEvent::Done { .. } => {
                if self.status != StatusLine::Error {
                    self.set_status(StatusLine::Cleared, updates);
                }
                return ControlFlow::Break(());
            }
            mcp => self.apply_mcp(&mcp, updates),
        }
        ControlFlow::Continue(())
    }

    fn apply_mcp(&mut self, event: &StreamEvent, updates: &UnboundedSender<TurnUpdate>) {
        if self.mode != ToolMode::ServerMcp {
            tracing::debug!(?event, "ignoring MCP event outside MCP mode");
            return;
        }
        if let StreamEvent::ToolCallStart { name, .. } = event {
            self.set_status(StatusLine::CallingTool(name.clone()), updates);
        }

        let Some(change) = self.log.apply(event) else {
            return;
        };
        let handle = change.handle();
        let Some(entry) = self.log.get(handle).cloned() else {
            return;
        };
        let update = match change {
            LogChange::Appended(_) => TurnUpdate::LogAppended { handle, entry },
            LogChange::Updated(_) => TurnUpdate::LogUpdated { handle, entry },
        };
        let _ = updates.send(update);
    }

    fn set_status(&mut self, status: StatusLine, updates: &UnboundedSender<TurnUpdate>) {
        if self.status != status {
            self.status = status.clone();
            let _ = updates.send(TurnUpdate::Status { status });
        }
    }

    /// Drive the turn to a terminal state.
    ///
    /// Client-side tool calls are extracted once the stream has completed
    /// cleanly, and only in [`ToolMode::ClientParse`].
    pub async fn run(
        mut self,
        transport: &dyn ChatTransport,
        executor: Option<&dyn ToolExecutor>,
        updates: UnboundedSender<TurnUpdate>,
    ) -> TurnReport {
        let cancel = self.session.cancel_token();

        let mut outcome = match self.stream(transport, &cancel, &updates).await {
            Ok(()) => match self.server_error.clone() {
                Some(error) => TurnOutcome::Failed(error),
                None => TurnOutcome::Completed,
            },
            Err(e) => self.interrupted(e, &cancel, &updates),
        };

        if outcome == TurnOutcome::Completed && self.mode == ToolMode::ClientParse {
            let calls = extract_tool_calls(&self.buffer);
            match executor {
                _ if calls.is_empty() => {}
                Some(executor) => {
                    self.set_status(StatusLine::FunctionCalling, &updates);
                    let batch = run_tool_calls(calls, executor, &cancel, &updates).await;
                    self.tool_runs = batch.runs;
                    if batch.cancelled {
                        outcome = self.interrupted(ChatError::Cancelled, &cancel, &updates);
                    } else {
                        self.set_status(StatusLine::Cleared, &updates);
                    }
                }
                None => tracing::warn!(
                    "no tool executor configured, skipping {} tool call(s)",
                    calls.len()
                ),
            }
        }

        let _ = updates.send(TurnUpdate::Finished {
            outcome: outcome.clone(),
        });

        TurnReport {
            turn_id: self.session.turn_id,
            outcome,
            view: self.view,
            log: self.log.entries().to_vec(),
            tool_runs: self.tool_runs,
        }
    }

    async fn stream(
        &mut self,
        transport: &dyn ChatTransport,
        cancel: &CancellationToken,
        updates: &UnboundedSender<TurnUpdate>,
    ) -> Result<(), ChatError> {
        let body = transport.open_stream(&self.request, cancel).await?;
        let mut reader = EventReader::new(body);

        while let Some(event) = reader.next_event(cancel).await? {
            tracing::debug!(?event, "stream event");
            if self.handle_event(event, updates).is_break() {
                break;
            }
        }

        if reader.malformed_count() > 0 {
            tracing::debug!("skipped {} malformed frame(s)", reader.malformed_count());
        }
        Ok(())
    }

    /// Map an error that stopped the turn to its outcome. Cancellation is
    /// "paused", anything else is a visible failure.
    fn interrupted(
        &mut self,
        error: ChatError,
        cancel: &CancellationToken,
        updates: &UnboundedSender<TurnUpdate>,
    ) -> TurnOutcome {
        if matches!(error, ChatError::Cancelled) || cancel.is_cancelled() {
            self.set_status(StatusLine::Paused, updates);
            return TurnOutcome::Cancelled;
        }

        tracing::error!(turn_id = %self.session.turn_id, "turn failed: {}", error);
        let message = error.to_string();
        self.set_status(StatusLine::Error, updates);
        let _ = updates.send(TurnUpdate::Error {
            error: message.clone(),
        });
        TurnOutcome::Failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration_log::ToolCallEntry;
    use crate::protocol::{ToolCallStatus, ToolExecuteResponse, ToolInvocationRequest};
    use crate::stream_client::ByteStream;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Replays canned frames, optionally never finishing afterwards.
    struct Scripted {
        frames: Vec<String>,
        hang: bool,
    }

    impl Scripted {
        fn new(events: &[serde_json::Value]) -> Self {
            Self {
                frames: events.iter().map(|e| format!("data: {}\n\n", e)).collect(),
                hang: false,
            }
        }

        fn hanging(mut self) -> Self {
            self.hang = true;
            self
        }
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn open_stream(
            &self,
            _request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ByteStream, ChatError> {
            let chunks: Vec<Result<Vec<u8>, ChatError>> = self
                .frames
                .iter()
                .map(|f| Ok(f.clone().into_bytes()))
                .collect();
            let body = stream::iter(chunks);
            if self.hang {
                Ok(Box::pin(body.chain(stream::pending())))
            } else {
                Ok(Box::pin(body))
            }
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ChatTransport for Unreachable {
        async fn open_stream(
            &self,
            _request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ByteStream, ChatError> {
            Err(ChatError::Http {
                status: 500,
                body: "boom".to_string(),
            })
        }
    }

    struct Tools {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutor for Tools {
        async fn execute(
            &self,
            request: &ToolInvocationRequest,
        ) -> Result<ToolExecuteResponse, ChatError> {
            self.calls.lock().unwrap().push(request.name.clone());
            if request.name == "get_time" {
                Ok(ToolExecuteResponse {
                    success: true,
                    result: Some(json!("12:00")),
                    error: None,
                })
            } else {
                Err(ChatError::Transport("unreachable".to_string()))
            }
        }
    }

    /// Answers `get_time`, never answers anything else.
    struct StallsAfterTime;

    #[async_trait]
    impl ToolExecutor for StallsAfterTime {
        async fn execute(
            &self,
            request: &ToolInvocationRequest,
        ) -> Result<ToolExecuteResponse, ChatError> {
            if request.name == "get_time" {
                return Ok(ToolExecuteResponse {
                    success: true,
                    result: Some(json!("12:00")),
                    error: None,
                });
            }
            std::future::pending().await
        }
    }

    fn manager(mode: ToolMode) -> ChatManager {
        ChatManager::new(TurnSettings {
            model_id: Some("test-model".to_string()),
            mode,
            ..TurnSettings::default()
        })
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<TurnUpdate>) -> Vec<TurnUpdate> {
        let mut out = Vec::new();
        while let Some(update) = rx.recv().await {
            out.push(update);
        }
        out
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_pauses_and_returns_to_idle() {
        let mut chat = manager(ToolMode::Off);
        let turn = chat.start_turn("hello", Vec::new()).unwrap();
        let transport = Scripted::new(&[
            json!({"type": "status", "status": "answering"}),
            json!({"type": "content", "content": "Hel"}),
        ])
        .hanging();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let chat_ref = &chat;
        let (report, seen) = tokio::join!(turn.run(&transport, None, tx), async move {
            let mut seen = Vec::new();
            while let Some(update) = rx.recv().await {
                if matches!(update, TurnUpdate::View { .. }) {
                    assert!(chat_ref.cancel());
                }
                seen.push(update);
            }
            seen
        });

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert!(seen.contains(&TurnUpdate::Status {
            status: StatusLine::Paused
        }));
        assert!(!seen.contains(&TurnUpdate::Status {
            status: StatusLine::Error
        }));

        chat.finish_turn(&report);
        assert_eq!(chat.state(), SessionState::Idle);
        assert_eq!(chat.last_outcome(), Some(&TurnOutcome::Cancelled));
        // Only the user message; a cancelled turn leaves no assistant reply.
        assert_eq!(chat.conversation().len(), 1);
        assert!(chat.cancel_handle().is_none());
    }

    #[tokio::test]
    async fn test_second_turn_rejected_while_active() {
        let mut chat = manager(ToolMode::Off);
        let turn = chat.start_turn("first", Vec::new()).unwrap();

        let Err(err) = chat.start_turn("second", Vec::new()) else {
            panic!("second turn should be rejected");
        };
        assert!(matches!(err, ChatError::SessionBusy));
        assert_eq!(chat.conversation().len(), 1);
        assert_eq!(chat.conversation().last().unwrap().content, "first");
        assert!(turn.buffer().is_empty());
        assert!(matches!(
            chat.clear_conversation(),
            Err(ChatError::SessionBusy)
        ));

        let transport = Scripted::new(&[json!({"type": "done"})]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let report = turn.run(&transport, None, tx).await;
        chat.finish_turn(&report);
        assert!(chat.start_turn("second", Vec::new()).is_ok());
    }

    #[test]
    fn test_invalid_requests_rejected_without_mutation() {
        let mut chat = manager(ToolMode::Off);
        assert!(matches!(
            chat.start_turn("   ", Vec::new()),
            Err(ChatError::EmptyMessage)
        ));

        chat.settings_mut().model_id = None;
        assert!(matches!(
            chat.start_turn("hi", Vec::new()),
            Err(ChatError::NoModelSelected)
        ));
        assert!(chat.conversation().is_empty());
        assert_eq!(chat.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_completed_turn_appends_answer() {
        let mut chat = manager(ToolMode::Off);
        let turn = chat.start_turn("why?", Vec::new()).unwrap();
        assert!(!turn.request().auto_parse);
        assert_eq!(turn.request().messages.len(), 1);

        let transport = Scripted::new(&[
            json!({"type": "status", "status": "thinking"}),
            json!({"type": "content", "content": "<think>because"}),
            json!({"type": "content", "content": "</think>It "}),
            json!({"type": "content", "content": "depends."}),
            json!({"type": "done"}),
        ]);
        let (tx, rx) = mpsc::unbounded_channel();
        let report = turn.run(&transport, None, tx).await;
        let updates = collect(rx).await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.view.reasoning, "because");
        assert_eq!(report.view.answer, "It depends.");
        assert_eq!(
            updates.last(),
            Some(&TurnUpdate::Finished {
                outcome: TurnOutcome::Completed
            })
        );
        assert!(updates.contains(&TurnUpdate::Status {
            status: StatusLine::Cleared
        }));

        chat.finish_turn(&report);
        assert_eq!(chat.conversation().len(), 2);
        assert_eq!(chat.conversation().last().unwrap().content, "It depends.");
    }

    #[tokio::test]
    async fn test_mcp_events_build_log_and_done_ends_stream() {
        let mut chat = manager(ToolMode::ServerMcp);
        let turn = chat.start_turn("what time is it", Vec::new()).unwrap();
        assert!(turn.request().auto_parse);

        let transport = Scripted::new(&[
            json!({"type": "iteration_start", "iteration": 1, "timestamp": "2025-01-01T09:30:00"}),
            json!({"type": "tool_call_start", "name": "A", "arguments": {"x": 1}}),
            json!({"type": "tool_call_complete", "name": "A", "success": true, "result": 5}),
            json!({"type": "max_iterations_reached", "max_iterations": 1}),
            json!({"type": "content", "content": "final"}),
            json!({"type": "done"}),
            json!({"type": "content", "content": " ignored"}),
        ]);
        let (tx, rx) = mpsc::unbounded_channel();
        let report = turn.run(&transport, None, tx).await;
        let updates = collect(rx).await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.view.answer, "final");
        assert_eq!(report.log.len(), 3);
        assert_eq!(
            report.log[0],
            LogEntry::Iteration {
                iteration: 1,
                time: Some("09:30:00".to_string())
            }
        );
        match &report.log[1] {
            LogEntry::ToolCall(ToolCallEntry { status, result, .. }) => {
                assert_eq!(*status, ToolCallStatus::Success);
                assert_eq!(*result, Some(json!(5)));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        assert_eq!(report.log[2].title(), "Reached maximum iterations (1)");

        assert!(updates.contains(&TurnUpdate::Status {
            status: StatusLine::CallingTool("A".to_string())
        }));
        assert_eq!(
            updates
                .iter()
                .filter(|u| matches!(u, TurnUpdate::LogUpdated { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_mcp_events_ignored_outside_mcp_mode() {
        let mut chat = manager(ToolMode::Off);
        let turn = chat.start_turn("hi", Vec::new()).unwrap();
        let transport = Scripted::new(&[
            json!({"type": "iteration_start", "iteration": 1}),
            json!({"type": "content", "content": "ok"}),
            json!({"type": "done"}),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let report = turn.run(&transport, None, tx).await;

        assert!(report.log.is_empty());
        assert_eq!(report.view.answer, "ok");
    }

    #[tokio::test]
    async fn test_client_tools_run_in_order_after_stream() {
        let mut chat = manager(ToolMode::ClientParse);
        let turn = chat.start_turn("time?", Vec::new()).unwrap();
        let transport = Scripted::new(&[
            json!({"type": "content", "content": "Checking. <tool_call>{\"name\":\"search\",\"arguments\":{\"q\":\"x\"}}</tool_call>"}),
            json!({"type": "content", "content": "<tool_call name=\"get_time\" arguments='{}'/>"}),
            json!({"type": "done"}),
        ]);
        let tools = Tools {
            calls: Mutex::new(Vec::new()),
        };

        let (tx, _rx) = mpsc::unbounded_channel();
        let report = turn.run(&transport, Some(&tools), tx).await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.view.answer, "Checking.");
        assert_eq!(*tools.calls.lock().unwrap(), vec!["search", "get_time"]);
        assert_eq!(report.tool_runs.len(), 2);
        assert_eq!(report.tool_runs[0].status, ToolCallStatus::Error);
        assert_eq!(report.tool_runs[1].status, ToolCallStatus::Success);
        assert_eq!(report.tool_runs[1].result, Some(json!("12:00")));
    }

    #[tokio::test]
    async fn test_cancel_during_tool_runs_keeps_finished_runs() {
        let mut chat = manager(ToolMode::ClientParse);
        let turn = chat.start_turn("time?", Vec::new()).unwrap();
        let transport = Scripted::new(&[
            json!({"type": "content", "content": "<tool_call name=\"get_time\" arguments='{}'/>"}),
            json!({"type": "content", "content": "<tool_call name=\"search\" arguments='{\"q\":1}'/>"}),
            json!({"type": "done"}),
        ]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let chat_ref = &chat;
        let (report, _) = tokio::join!(
            turn.run(&transport, Some(&StallsAfterTime), tx),
            async move {
                while let Some(update) = rx.recv().await {
                    if matches!(update, TurnUpdate::ToolRunFinished { index: 0, .. }) {
                        assert!(chat_ref.cancel());
                    }
                }
            }
        );

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(report.tool_runs.len(), 2);
        assert_eq!(report.tool_runs[0].request.name, "get_time");
        assert_eq!(report.tool_runs[0].status, ToolCallStatus::Success);
        assert_eq!(report.tool_runs[1].request.name, "search");
        assert_eq!(report.tool_runs[1].status, ToolCallStatus::Error);

        chat.finish_turn(&report);
        assert_eq!(chat.state(), SessionState::Idle);
        assert_eq!(chat.last_outcome(), Some(&TurnOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_transport_failure_replaces_answer_with_error() {
        let mut chat = manager(ToolMode::Off);
        let turn = chat.start_turn("hi", Vec::new()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let report = turn.run(&Unreachable, None, tx).await;
        let updates = collect(rx).await;

        let expected = "server returned 500: boom".to_string();
        assert_eq!(report.outcome, TurnOutcome::Failed(expected.clone()));
        assert!(updates.contains(&TurnUpdate::Status {
            status: StatusLine::Error
        }));

        chat.finish_turn(&report);
        assert_eq!(chat.state(), SessionState::Idle);
        assert_eq!(chat.conversation().last().unwrap().content, expected);
        assert_eq!(chat.conversation().last().unwrap().role, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn test_in_band_error_fails_turn_and_keeps_status() {
        let mut chat = manager(ToolMode::Off);
        let turn = chat.start_turn("hi", Vec::new()).unwrap();
        let transport = Scripted::new(&[
            json!({"type": "content", "content": "partial"}),
            json!({"type": "error", "error": "model overloaded"}),
            json!({"type": "done"}),
        ]);
        let (tx, rx) = mpsc::unbounded_channel();
        let report = turn.run(&transport, None, tx).await;
        let updates = collect(rx).await;

        assert_eq!(
            report.outcome,
            TurnOutcome::Failed("model overloaded".to_string())
        );
        assert!(!updates.contains(&TurnUpdate::Status {
            status: StatusLine::Cleared
        }));
    }

    #[test]
    fn test_stale_finish_is_ignored() {
        let mut controller = SessionController::new();
        let session = controller.begin().unwrap();
        assert!(!controller.finish(Uuid::new_v4(), TurnOutcome::Completed));
        assert!(controller.is_active());
        assert!(controller.finish(session.turn_id, TurnOutcome::Completed));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!controller.cancel());
    }
}
