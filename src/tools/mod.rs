//! 对外边界：每个会话操作一个工具，由 ToolExecutor 统一执行并把错误转成文本

pub mod conversation;
pub mod executor;
pub mod registry;
pub mod schema;

pub use conversation::register_conversation_tools;
pub use executor::{ToolExecutor, ToolOutcome, ToolResponse};
pub use registry::{Tool, ToolDescriptor, ToolRegistry};
pub use schema::{tool_request_schema, ToolRequest};
