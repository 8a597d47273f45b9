use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ChatError;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// An already-uploaded attachment, carried as base64 payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub base64: String,
}

impl MediaRef {
    pub fn new(kind: MediaKind, base64: impl Into<String>) -> Self {
        Self {
            kind,
            base64: base64.into(),
        }
    }

    /// Read and encode a local file as an attachment.
    pub fn from_file(kind: MediaKind, path: &Path) -> Result<Self, ChatError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::new(kind, BASE64.encode(bytes)))
    }

    pub fn data_url(&self) -> String {
        match self.kind {
            MediaKind::Image => format!("data:image/jpeg;base64,{}", self.base64),
            MediaKind::Video => format!("data:video/mp4;base64,{}", self.base64),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub media: Vec<MediaRef>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: String) -> Self {
        Self {
            role,
            content,
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: Vec<MediaRef>) -> Self {
        self.media = media;
        self
    }

    /// Convert to the shape the chat endpoints accept.
    pub fn to_wire(&self) -> WireMessage {
        let content = if self.media.is_empty() {
            WireContent::Text(self.content.clone())
        } else {
            let mut parts = Vec::with_capacity(self.media.len() + 1);
            parts.push(ContentPart::Text {
                text: self.content.clone(),
            });
            for media in &self.media {
                let url = MediaUrl {
                    url: media.data_url(),
                };
                parts.push(match media.kind {
                    MediaKind::Image => ContentPart::ImageUrl { image_url: url },
                    MediaKind::Video => ContentPart::VideoUrl { video_url: url },
                });
            }
            WireContent::Parts(parts)
        };
        WireMessage {
            role: self.role,
            content,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: ChatRole,
    pub content: WireContent,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    VideoUrl { video_url: MediaUrl },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MediaUrl {
    pub url: String,
}

/// Sampling parameters forwarded verbatim to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Body of a chat request. `auto_parse` selects the MCP event vocabulary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<WireMessage>,
    pub enabled_tools: Vec<String>,
    pub params: ModelParams,
    pub auto_parse: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Thinking,
    FunctionCalling,
    Answering,
    Error,
}

/// A decoded `data:` frame payload, tagged by its `type` field.
///
/// The first four variants form the plain vocabulary; the rest are only
/// emitted by the server-orchestrated (MCP) endpoint. Extra fields the
/// server attaches (`total_messages`, `calls`, `tool_results`) are ignored.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        status: GenerationStatus,
    },
    Content {
        content: String,
    },
    Error {
        error: String,
    },
    Done {
        #[serde(default)]
        timestamp: Option<String>,
    },
    IterationStart {
        iteration: u32,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ThinkingExtracted {
        thinking: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ToolCallsParsed {
        count: usize,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ToolCallStart {
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ToolCallComplete {
        #[serde(default)]
        name: Option<String>,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        timestamp: Option<String>,
    },
    ToolCallError {
        #[serde(default)]
        name: Option<String>,
        error: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    IterationComplete {
        iteration: u32,
        has_tool_calls: bool,
        #[serde(default)]
        timestamp: Option<String>,
    },
    MaxIterationsReached {
        max_iterations: u32,
        #[serde(default)]
        timestamp: Option<String>,
    },
}

impl StreamEvent {
    /// Whether the event belongs to the server-orchestrated vocabulary.
    pub fn is_mcp(&self) -> bool {
        match self {
            StreamEvent::Status { .. }
            | StreamEvent::Content { .. }
            | StreamEvent::Error { .. }
            | StreamEvent::Done { .. } => false,
            StreamEvent::IterationStart { .. }
            | StreamEvent::ThinkingExtracted { .. }
            | StreamEvent::ToolCallsParsed { .. }
            | StreamEvent::ToolCallStart { .. }
            | StreamEvent::ToolCallComplete { .. }
            | StreamEvent::ToolCallError { .. }
            | StreamEvent::IterationComplete { .. }
            | StreamEvent::MaxIterationsReached { .. } => true,
        }
    }
}

/// A structured `{name, arguments}` pair found in model output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolInvocationRequest {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Executing,
    Success,
    Error,
}

#[derive(Debug, Serialize)]
pub struct ToolExecuteRequest<'a> {
    pub tool_name: &'a str,
    pub parameters: &'a Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ToolExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}
