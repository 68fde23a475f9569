//! 核心层：会话模型、错误、执行上下文、限流、注册表与优雅关闭

pub mod conversation;
pub mod error;
pub mod execution;
pub mod rate_limit;
pub mod registry;
pub mod shutdown;

pub use conversation::{
    generate_conversation_id, is_valid_conversation_id, sanitize_task_name, Conversation,
    ConversationStatus, Role, Turn,
};
pub use error::ConversationError;
pub use execution::{Connection, ExecutionContext};
pub use rate_limit::RateLimiter;
pub use registry::{ConversationRegistry, ConversationSummary, RegistryOptions};
pub use shutdown::{
    run_with_graceful_shutdown, RegistryCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
