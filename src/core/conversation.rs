//! 会话模型：Conversation / Turn / Role / ConversationStatus，以及会话 ID 的生成
//!
//! ID 形如 `conv_<清洗后的名字>_<8 位十六进制>`，名字清洗规则：小写、非字母数字连续段折叠为单个 `-`、去掉首尾 `-`。

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::storage::{ConversationMetadata, ConversationRecord, StoredMessage};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }
}

/// 会话状态：active ⇄ completed，ended 为终态
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
    Ended,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条消息（追加后不可变）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    pub turn_id: Option<String>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_timestamp(),
            turn_id: Some(new_message_id()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }

    pub fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            role: self.role,
            message: self.content.clone(),
            timestamp: self.timestamp.clone(),
            message_id: self.turn_id.clone(),
        }
    }

    pub fn from_stored(message: &StoredMessage) -> Self {
        Self {
            role: message.role,
            content: message.message.clone(),
            timestamp: message.timestamp.clone(),
            turn_id: message.message_id.clone(),
        }
    }
}

/// 活跃会话的内存状态（由 Registry 独占，Store 只做镜像）
#[derive(Clone, Debug)]
pub struct Conversation {
    pub id: String,
    /// 当前执行上下文的会话 ID（每次 create / resume 重新生成）
    pub session_id: String,
    pub task_name: String,
    pub task_description: String,
    turns: Vec<Turn>,
    pub status: ConversationStatus,
    pub created_at: String,
    last_updated: String,
}

impl Conversation {
    pub fn new(
        id: String,
        session_id: String,
        task_name: impl Into<String>,
        task_description: impl Into<String>,
    ) -> Self {
        let now = now_timestamp();
        Self {
            id,
            session_id,
            task_name: task_name.into(),
            task_description: task_description.into(),
            turns: Vec::new(),
            status: ConversationStatus::Active,
            created_at: now.clone(),
            last_updated: now,
        }
    }

    /// 从持久化记录重建（resume 使用）；会话 ID 换成新的执行上下文
    pub fn from_record(record: &ConversationRecord, session_id: String) -> Self {
        let meta = &record.metadata;
        Self {
            id: meta.conversation_id.clone(),
            session_id,
            task_name: meta
                .task_name
                .clone()
                .unwrap_or_else(|| meta.conversation_id.clone()),
            task_description: meta.initial_task.clone(),
            turns: record.messages.iter().map(Turn::from_stored).collect(),
            status: meta.status,
            created_at: meta.created_at.clone(),
            last_updated: meta.last_updated.clone(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn message_count(&self) -> usize {
        self.turns.len()
    }

    pub fn last_updated(&self) -> &str {
        &self.last_updated
    }

    /// 追加消息；completed 会话收到新消息时隐式重新打开
    pub fn push(&mut self, turn: Turn) {
        self.last_updated = advance_timestamp(&self.last_updated, &turn.timestamp);
        self.turns.push(turn);
        if self.status == ConversationStatus::Completed {
            self.status = ConversationStatus::Active;
        }
    }

    pub fn set_status(&mut self, status: ConversationStatus) {
        self.status = status;
        self.last_updated = advance_timestamp(&self.last_updated, &now_timestamp());
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            metadata: ConversationMetadata {
                conversation_id: self.id.clone(),
                session_id: self.session_id.clone(),
                created_at: self.created_at.clone(),
                last_updated: self.last_updated.clone(),
                message_count: self.turns.len(),
                initial_task: self.task_description.clone(),
                status: self.status,
                task_name: Some(self.task_name.clone()),
            },
            messages: self.turns.iter().map(Turn::to_stored).collect(),
        }
    }
}

/// 当前 UTC 时间（RFC3339，微秒精度，固定宽度以便按字符串排序）
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 返回 max(prev, candidate)，保证 last_updated 单调不减
pub fn advance_timestamp(prev: &str, candidate: &str) -> String {
    let parse = |s: &str| DateTime::parse_from_rfc3339(s).ok();
    match (parse(prev), parse(candidate)) {
        (Some(p), Some(c)) if p > c => prev.to_string(),
        (Some(_), None) => prev.to_string(),
        _ => candidate.to_string(),
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", short_hex(8))
}

pub fn new_session_id() -> String {
    format!("c2c-{}", short_hex(8))
}

fn short_hex(len: usize) -> String {
    uuid::Uuid::new_v4().simple().to_string()[..len].to_string()
}

fn separator_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"))
}

/// 清洗任务名：小写、非字母数字连续段折叠为 `-`、去掉首尾 `-`；结果为空时用 `task`
pub fn sanitize_task_name(task_name: &str) -> String {
    let lower = task_name.to_lowercase();
    let collapsed = separator_runs().replace_all(&lower, "-");
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 生成一个候选 ID；是否冲突由调用方判断并重试
pub fn generate_conversation_id(sanitized: &str) -> String {
    format!("conv_{}_{}", sanitized, short_hex(8))
}

/// ID 只允许小写字母、数字、`_` 与 `-`，防止路径穿越
pub fn is_valid_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_task_name() {
        assert_eq!(sanitize_task_name("Fix Bug"), "fix-bug");
        assert_eq!(sanitize_task_name("  Hello,   World!! "), "hello-world");
        assert_eq!(sanitize_task_name("--a__b--"), "a-b");
        assert_eq!(sanitize_task_name("v2.0 release"), "v2-0-release");
        assert_eq!(sanitize_task_name("!!!"), "task");
        assert_eq!(sanitize_task_name("Ünïcode"), "n-code");
    }

    #[test]
    fn test_generate_conversation_id_shape() {
        let id = generate_conversation_id("fix-bug");
        assert!(id.starts_with("conv_fix-bug_"));
        let suffix = id.trim_start_matches("conv_fix-bug_");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(is_valid_conversation_id(&id));
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_conversation_id(""));
        assert!(!is_valid_conversation_id("../etc/passwd"));
        assert!(!is_valid_conversation_id("conv_A"));
        assert!(!is_valid_conversation_id("conv a"));
    }

    #[test]
    fn test_advance_timestamp_is_monotonic() {
        let later = "2026-01-02T00:00:00.000000Z";
        let earlier = "2026-01-01T00:00:00.000000Z";
        assert_eq!(advance_timestamp(later, earlier), later);
        assert_eq!(advance_timestamp(earlier, later), later);
        assert_eq!(advance_timestamp(later, "garbage"), later);
    }

    #[test]
    fn test_push_reopens_completed() {
        let mut conv = Conversation::new("conv_x_1".into(), new_session_id(), "x", "do x");
        conv.status = ConversationStatus::Completed;
        conv.push(Turn::user("again"));
        assert_eq!(conv.status, ConversationStatus::Active);
        assert_eq!(conv.message_count(), 1);
        assert_eq!(conv.to_record().metadata.message_count, 1);
    }

    #[test]
    fn test_role_accepts_assistant_alias() {
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Agent);
        assert_eq!(serde_json::to_string(&Role::Agent).unwrap(), "\"agent\"");
    }
}
