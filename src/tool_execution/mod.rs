pub mod executor;
pub mod orchestrator;

pub use executor::{HttpToolExecutor, ToolExecutor};
pub use orchestrator::{run_tool_calls, ToolBatch, ToolRun};
