use async_trait::async_trait;

use crate::error::ChatError;
use crate::protocol::{ToolExecuteRequest, ToolExecuteResponse, ToolInvocationRequest};

/// Runs one tool call somewhere else and reports its outcome.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: &ToolInvocationRequest)
        -> Result<ToolExecuteResponse, ChatError>;
}

/// Executor backed by the server's `/api/tools/execute` endpoint
pub struct HttpToolExecutor {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpToolExecutor {
    pub fn new(base_url: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/tools/execute", self.base_url)
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(
        &self,
        request: &ToolInvocationRequest,
    ) -> Result<ToolExecuteResponse, ChatError> {
        let body = ToolExecuteRequest {
            tool_name: &request.name,
            parameters: &request.arguments,
        };
        tracing::debug!(tool = %request.name, "executing tool");

        let response = self
            .http_client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Http { status, body });
        }

        let parsed = response.json::<ToolExecuteResponse>().await?;
        Ok(parsed)
    }
}
