pub mod config;
pub mod llm;
pub mod registry;

pub use llm::{
    tool_executor, CallContext, EvalResult, LlmError, Message, MultiTurnError,
    MultiTurnProvider, MultiTurnResult, Provider, Request, Response, ToolDefinition,
    ToolExecutor, ToolUse,
};
pub use registry::ProviderRegistry;
