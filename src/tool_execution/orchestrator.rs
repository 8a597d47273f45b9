use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::executor::ToolExecutor;
use crate::error::ChatError;
use crate::events::TurnUpdate;
use crate::protocol::{ToolCallStatus, ToolInvocationRequest};

/// One client-side tool call and where it stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRun {
    pub request: ToolInvocationRequest,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolRun {
    fn pending(request: ToolInvocationRequest) -> Self {
        Self {
            request,
            status: ToolCallStatus::Executing,
            result: None,
            error: None,
        }
    }

    fn fail(&mut self, error: String) {
        self.status = ToolCallStatus::Error;
        self.error = Some(error);
    }
}

/// Runs produced by one batch, including any cut short by cancellation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolBatch {
    pub runs: Vec<ToolRun>,
    pub cancelled: bool,
}

/// Execute extracted calls one at a time, in order.
///
/// A failing call is recorded and the next one still runs. Cancellation
/// stops the loop; the call in flight at that point is kept as an error
/// and the ones never started are dropped.
pub async fn run_tool_calls(
    requests: Vec<ToolInvocationRequest>,
    executor: &dyn ToolExecutor,
    cancel: &CancellationToken,
    updates: &UnboundedSender<TurnUpdate>,
) -> ToolBatch {
    let mut batch = ToolBatch {
        runs: Vec::with_capacity(requests.len()),
        cancelled: false,
    };

    for (index, request) in requests.into_iter().enumerate() {
        if cancel.is_cancelled() {
            batch.cancelled = true;
            break;
        }

        let mut run = ToolRun::pending(request);
        let _ = updates.send(TurnUpdate::ToolRunStarted {
            index,
            run: run.clone(),
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = executor.execute(&run.request) => Some(outcome),
        };

        match outcome {
            Some(Ok(resp)) if resp.success => {
                run.status = ToolCallStatus::Success;
                run.result = resp.result;
            }
            Some(Ok(resp)) => {
                run.fail(resp.error.unwrap_or_else(|| "tool reported failure".to_string()));
            }
            Some(Err(e)) => {
                tracing::warn!(tool = %run.request.name, "tool execution failed: {}", e);
                run.fail(e.to_string());
            }
            None => {
                run.fail(ChatError::Cancelled.to_string());
                batch.cancelled = true;
            }
        }

        let _ = updates.send(TurnUpdate::ToolRunFinished {
            index,
            run: run.clone(),
        });
        batch.runs.push(run);
        if batch.cancelled {
            break;
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolExecuteResponse;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Answers by tool name and records call order.
    struct Scripted {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutor for Scripted {
        async fn execute(
            &self,
            request: &ToolInvocationRequest,
        ) -> Result<ToolExecuteResponse, ChatError> {
            self.calls.lock().unwrap().push(request.name.clone());
            match request.name.as_str() {
                "ok" => Ok(ToolExecuteResponse {
                    success: true,
                    result: Some(json!(42)),
                    error: None,
                }),
                "refused" => Ok(ToolExecuteResponse {
                    success: false,
                    result: None,
                    error: Some("not allowed".to_string()),
                }),
                _ => Err(ChatError::Transport("connection refused".to_string())),
            }
        }
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl ToolExecutor for Hanging {
        async fn execute(
            &self,
            _request: &ToolInvocationRequest,
        ) -> Result<ToolExecuteResponse, ChatError> {
            std::future::pending().await
        }
    }

    fn req(name: &str) -> ToolInvocationRequest {
        ToolInvocationRequest::new(name, Map::new())
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_calls() {
        let exec = Scripted {
            calls: Mutex::new(Vec::new()),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let batch = run_tool_calls(
            vec![req("broken"), req("refused"), req("ok")],
            &exec,
            &cancel,
            &tx,
        )
        .await;
        assert!(!batch.cancelled);
        let runs = batch.runs;

        assert_eq!(*exec.calls.lock().unwrap(), vec!["broken", "refused", "ok"]);
        assert_eq!(runs[0].status, ToolCallStatus::Error);
        assert!(runs[0].error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(runs[1].error.as_deref(), Some("not allowed"));
        assert_eq!(runs[2].status, ToolCallStatus::Success);
        assert_eq!(runs[2].result, Some(json!(42)));

        drop(tx);
        let mut kinds = Vec::new();
        while let Some(update) = rx.recv().await {
            kinds.push(match update {
                TurnUpdate::ToolRunStarted { index, .. } => format!("start {}", index),
                TurnUpdate::ToolRunFinished { index, .. } => format!("end {}", index),
                other => panic!("unexpected update {:?}", other),
            });
        }
        assert_eq!(
            kinds,
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_call() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let run = run_tool_calls(vec![req("slow"), req("never")], &Hanging, &cancel, &tx);
        let (batch, _) = tokio::join!(run, async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });

        assert!(batch.cancelled);
        assert_eq!(batch.runs.len(), 1);
        assert_eq!(batch.runs[0].request.name, "slow");
        assert_eq!(batch.runs[0].status, ToolCallStatus::Error);
        assert_eq!(batch.runs[0].error.as_deref(), Some("generation cancelled"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = run_tool_calls(vec![req("ok")], &Hanging, &cancel, &tx).await;
        assert!(batch.cancelled);
        assert!(batch.runs.is_empty());
    }
}
