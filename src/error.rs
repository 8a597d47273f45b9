use thiserror::Error;

/// Errors surfaced by the chat client.
///
/// Only `Cancelled` and the transport-level variants end a turn. The rest
/// are rejected before a turn starts or handled where they occur.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A generation is already in flight for this conversation.
    #[error("a generation is already in progress")]
    SessionBusy,

    #[error("no model selected")]
    NoModelSelected,

    #[error("message is empty")]
    EmptyMessage,

    /// The caller aborted the turn. Rendered as "paused", never as an error.
    #[error("generation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid payload: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ChatError::Decode(e.to_string())
        } else {
            ChatError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Decode(e.to_string())
    }
}
