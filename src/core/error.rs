//! 会话错误类型
//!
//! NotFound / Timeout / InvalidState 总是上抛给调用方；Backend 在 create 中会触发完整回滚；
//! Storage 通常在本地记录日志后吞掉，只有只读 Store 的操作（get 非活跃记录、list_stored、search、stats、delete、resume 读取）才会上抛。

use thiserror::Error;

use crate::storage::StoreError;

/// 会话操作可能出现的错误（未找到、超时、后端、存储、非法状态）
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Conversation {0} not found or not active")]
    NotFound(String),

    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: &'static str, secs: f64 },

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    /// 例如恢复一个已 ended 的会话，或恢复一个仍在运行的会话
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<StoreError> for ConversationError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl ConversationError {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        Self::Backend(e.to_string())
    }

    pub fn timeout(operation: &'static str, limit: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            secs: limit.as_secs_f64(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
