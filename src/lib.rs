pub mod chat_manager;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod iteration_log;
pub mod protocol;
pub mod reasoning_parser; // <think> separation
pub mod stream_client;
pub mod tool_call_parser;
pub mod tool_execution;

pub use chat_manager::{ChatManager, ToolMode, Turn, TurnOutcome, TurnReport};
pub use error::ChatError;
