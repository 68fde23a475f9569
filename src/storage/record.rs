//! 持久化记录格式
//!
//! 每个会话一个 JSON 文档：`{"metadata": {...}, "messages": [...]}`，每次修改整体重写。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::{ConversationStatus, Role};

/// 会话元数据
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub conversation_id: String,
    pub session_id: String,
    pub created_at: String,
    pub last_updated: String,
    pub message_count: usize,
    pub initial_task: String,
    pub status: ConversationStatus,
    /// 创建时的短名（旧记录可能没有）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

/// 单条持久化消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// 一个会话的完整记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub metadata: ConversationMetadata,
    pub messages: Vec<StoredMessage>,
}

/// 搜索命中：记录本身 + 命中片段
#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: ConversationRecord,
    pub matches: Vec<String>,
}

/// 存储统计
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub status_counts: BTreeMap<ConversationStatus, usize>,
    pub storage_location: PathBuf,
}
