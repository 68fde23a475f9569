//! 会话工具：对外的每个操作一个 Tool，全部委托给 ConversationRegistry

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{ConversationRegistry, ConversationStatus};
use crate::storage::{ConversationRecord, SearchHit, StoreStats};
use crate::tools::schema::{parameters_schema_for, parse_args};
use crate::tools::{Tool, ToolRegistry};

/// 列表与搜索结果中任务描述的截断长度
const PREVIEW_CHARS: usize = 60;
/// 每条搜索结果最多展示的片段数
const MAX_SNIPPETS: usize = 3;

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateArgs {
    /// 简短任务名，用于生成会话 ID
    task_name: String,
    /// 发送给 Agent 的初始任务
    task_description: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SendArgs {
    conversation_id: String,
    /// 为空时只收集尚未读取的回复
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ConversationIdArgs {
    conversation_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    query: String,
}

/// 注册全部会话工具
pub fn register_conversation_tools(tools: &mut ToolRegistry, registry: Arc<ConversationRegistry>) {
    tools.register(CreateConversationTool::new(registry.clone()));
    tools.register(SendMessageTool::new(registry.clone()));
    tools.register(EndConversationTool::new(registry.clone()));
    tools.register(CompleteConversationTool::new(registry.clone()));
    tools.register(ResumeConversationTool::new(registry.clone()));
    tools.register(GetConversationTool::new(registry.clone()));
    tools.register(ListConversationsTool::new(registry.clone()));
    tools.register(SearchConversationsTool::new(registry.clone()));
    tools.register(DeleteConversationTool::new(registry));
}

macro_rules! registry_tool {
    ($name:ident) => {
        pub struct $name {
            registry: Arc<ConversationRegistry>,
        }

        impl $name {
            pub fn new(registry: Arc<ConversationRegistry>) -> Self {
                Self { registry }
            }
        }
    };
}

registry_tool!(CreateConversationTool);
registry_tool!(SendMessageTool);
registry_tool!(EndConversationTool);
registry_tool!(CompleteConversationTool);
registry_tool!(ResumeConversationTool);
registry_tool!(GetConversationTool);
registry_tool!(ListConversationsTool);
registry_tool!(SearchConversationsTool);
registry_tool!(DeleteConversationTool);

#[async_trait]
impl Tool for CreateConversationTool {
    fn name(&self) -> &str {
        "create_conversation"
    }

    fn description(&self) -> &str {
        "Start a new agent conversation. The task description is sent as the first message; \
         the agent works on it in the background. Returns the conversation id."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<CreateArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: CreateArgs = parse_args(args)?;
        let id = self
            .registry
            .create(&args.task_name, &args.task_description)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!(
            "Created conversation {} - {}: {}",
            id, args.task_name, args.task_description
        ))
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to an active conversation and return the agent's reply. \
         An empty message collects a pending reply without sending anything."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<SendArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SendArgs = parse_args(args)?;
        self.registry
            .send(&args.conversation_id, &args.message)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Tool for EndConversationTool {
    fn name(&self) -> &str {
        "end_conversation"
    }

    fn description(&self) -> &str {
        "End a conversation for good. Its record is kept but it cannot be resumed."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ConversationIdArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ConversationIdArgs = parse_args(args)?;
        self.registry
            .end(&args.conversation_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Ended conversation {}", args.conversation_id))
    }
}

#[async_trait]
impl Tool for CompleteConversationTool {
    fn name(&self) -> &str {
        "complete_conversation"
    }

    fn description(&self) -> &str {
        "Mark a conversation completed and release its agent. It can be resumed later."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ConversationIdArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ConversationIdArgs = parse_args(args)?;
        self.registry
            .complete(&args.conversation_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Completed conversation {}", args.conversation_id))
    }
}

#[async_trait]
impl Tool for ResumeConversationTool {
    fn name(&self) -> &str {
        "resume_conversation"
    }

    fn description(&self) -> &str {
        "Resume a completed conversation from storage with a fresh agent session."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ConversationIdArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ConversationIdArgs = parse_args(args)?;
        let count = self
            .registry
            .resume(&args.conversation_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!(
            "Resumed conversation {} ({} messages)",
            args.conversation_id, count
        ))
    }
}

#[async_trait]
impl Tool for GetConversationTool {
    fn name(&self) -> &str {
        "get_conversation"
    }

    fn description(&self) -> &str {
        "Show a conversation's status and full message history."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ConversationIdArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ConversationIdArgs = parse_args(args)?;
        let record = self
            .registry
            .get(&args.conversation_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(render_history(&record))
    }
}

#[async_trait]
impl Tool for ListConversationsTool {
    fn name(&self) -> &str {
        "list_conversations"
    }

    fn description(&self) -> &str {
        "List active conversations, then stored conversations with storage statistics."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let active = self.registry.list().await;
        let mut out = if active.is_empty() {
            "No active conversations.\n".to_string()
        } else {
            let mut s = format!("Active conversations ({}):\n", active.len());
            for c in &active {
                s.push_str(&format!(
                    "- {} - {} [{}, {} messages]\n",
                    c.conversation_id, c.task_name, c.status, c.message_count
                ));
            }
            s
        };

        match self.registry.list_stored().await {
            Ok(records) if records.is_empty() => out.push_str("\nNo stored conversations.\n"),
            Ok(records) => {
                out.push_str(&format!("\nStored conversations ({}):\n", records.len()));
                for (i, record) in records.iter().enumerate() {
                    let meta = &record.metadata;
                    out.push_str(&format!(
                        "{}. {} - {} [{}, {} messages, updated {}]\n",
                        i + 1,
                        meta.conversation_id,
                        preview(&meta.initial_task),
                        meta.status,
                        meta.message_count,
                        meta.last_updated
                    ));
                }
            }
            Err(e) => out.push_str(&format!("\nStored conversations unavailable: {e}\n")),
        }

        if let Ok(stats) = self.registry.stats().await {
            out.push('\n');
            out.push_str(&render_stats(&stats));
        }
        Ok(out.trim_end().to_string())
    }
}

#[async_trait]
impl Tool for SearchConversationsTool {
    fn name(&self) -> &str {
        "search_conversations"
    }

    fn description(&self) -> &str {
        "Search stored conversations by task and message content (case-insensitive)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<SearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SearchArgs = parse_args(args)?;
        let hits = self
            .registry
            .search(&args.query)
            .await
            .map_err(|e| e.to_string())?;
        Ok(render_hits(&args.query, &hits))
    }
}

#[async_trait]
impl Tool for DeleteConversationTool {
    fn name(&self) -> &str {
        "delete_conversation"
    }

    fn description(&self) -> &str {
        "Delete a stored conversation record. Active conversations must be ended first."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ConversationIdArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ConversationIdArgs = parse_args(args)?;
        self.registry
            .delete(&args.conversation_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("Deleted conversation {}", args.conversation_id))
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

fn render_history(record: &ConversationRecord) -> String {
    let meta = &record.metadata;
    let name = meta.task_name.as_deref().unwrap_or(&meta.conversation_id);
    let mut out = format!(
        "Conversation {} - {} [{}]\nTask: {}\n",
        meta.conversation_id, name, meta.status, meta.initial_task
    );
    if record.messages.is_empty() {
        out.push_str("\n(no messages yet)");
    } else {
        for (i, m) in record.messages.iter().enumerate() {
            out.push_str(&format!("\n{}. {}: {}", i + 1, m.role.as_str(), m.message));
        }
    }
    out
}

fn render_stats(stats: &StoreStats) -> String {
    let count = |status: ConversationStatus| stats.status_counts.get(&status).copied().unwrap_or(0);
    format!(
        "Total: {} conversations, {} messages (active: {}, completed: {}, ended: {})\nStorage: {}",
        stats.total_conversations,
        stats.total_messages,
        count(ConversationStatus::Active),
        count(ConversationStatus::Completed),
        count(ConversationStatus::Ended),
        stats.storage_location.display()
    )
}

fn render_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No conversations match '{query}'");
    }
    let mut out = format!("Found {} conversation(s) matching '{}':", hits.len(), query);
    for (i, hit) in hits.iter().enumerate() {
        let meta = &hit.record.metadata;
        out.push_str(&format!(
            "\n{}. {} - {} [{}]",
            i + 1,
            meta.conversation_id,
            preview(&meta.initial_task),
            meta.status
        ));
        for snippet in hit.matches.iter().take(MAX_SNIPPETS) {
            out.push_str(&format!("\n   - {snippet}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::core::RegistryOptions;
    use crate::storage::ConversationStore;
    use crate::tools::ToolExecutor;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (ToolExecutor, MockBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path()).await.unwrap();
        let backend = MockBackend::new();
        let options = RegistryOptions {
            min_message_interval: Duration::ZERO,
            ..RegistryOptions::default()
        };
        let registry = Arc::new(ConversationRegistry::new(
            options,
            Arc::new(backend.clone()),
            store,
        ));
        let mut tools = ToolRegistry::new();
        register_conversation_tools(&mut tools, registry);
        (ToolExecutor::new(tools), backend, dir)
    }

    fn created_id(text: &str) -> String {
        text.trim_start_matches("Created conversation ")
            .split(' ')
            .next()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_all_tools_registered() {
        let (executor, _backend, _dir) = setup().await;
        assert_eq!(
            executor.tool_names(),
            vec![
                "complete_conversation",
                "create_conversation",
                "delete_conversation",
                "end_conversation",
                "get_conversation",
                "list_conversations",
                "resume_conversation",
                "search_conversations",
                "send_message",
            ]
        );
        let create = executor
            .descriptors()
            .into_iter()
            .find(|d| d.name == "create_conversation")
            .unwrap();
        assert!(create.parameters["properties"].get("task_description").is_some());
    }

    #[tokio::test]
    async fn test_create_send_get() {
        let (executor, backend, _dir) = setup().await;
        let out = executor
            .execute(
                "create_conversation",
                json!({"task_name": "Fix Bug", "task_description": "Investigate crash"}),
            )
            .await;
        assert!(out.ok);
        assert!(out.text.starts_with("Created conversation conv_fix-bug_"));
        assert!(out.text.ends_with(" - Fix Bug: Investigate crash"));
        let id = created_id(&out.text);

        backend.push_text_reply("Null pointer in parser");
        let out = executor
            .execute(
                "send_message",
                json!({"conversation_id": id, "message": "What's the cause?"}),
            )
            .await;
        assert_eq!(out.text, "Null pointer in parser");

        let out = executor
            .execute("get_conversation", json!({"conversation_id": id}))
            .await;
        assert!(out.text.contains("[active]"));
        assert!(out.text.contains("1. user: What's the cause?"));
        assert!(out.text.contains("2. agent: Null pointer in parser"));
    }

    #[tokio::test]
    async fn test_errors_are_rendered() {
        let (executor, _backend, _dir) = setup().await;
        let out = executor
            .execute(
                "send_message",
                json!({"conversation_id": "conv_nope_00000000", "message": "hi"}),
            )
            .await;
        assert!(!out.ok);
        assert_eq!(out.text, "Error: Conversation conv_nope_00000000 not found or not active");

        let out = executor.execute("create_conversation", json!({})).await;
        assert!(!out.ok);
        assert!(out.text.starts_with("Error: Invalid arguments:"));
    }

    #[tokio::test]
    async fn test_lifecycle_texts() {
        let (executor, _backend, _dir) = setup().await;
        let id = created_id(
            &executor
                .execute(
                    "create_conversation",
                    json!({"task_name": "Life", "task_description": "Write the release notes"}),
                )
                .await
                .text,
        );
        let by_id = json!({"conversation_id": id});

        let out = executor.execute("complete_conversation", by_id.clone()).await;
        assert_eq!(out.text, format!("Completed conversation {id}"));

        let out = executor.execute("resume_conversation", by_id.clone()).await;
        assert_eq!(out.text, format!("Resumed conversation {id} (0 messages)"));

        let out = executor.execute("list_conversations", json!({})).await;
        assert!(out.text.starts_with("Active conversations (1):"));
        assert!(out.text.contains("Stored conversations (1):"));
        assert!(out.text.contains("Total: 1 conversations"));

        let out = executor
            .execute("search_conversations", json!({"query": "RELEASE"}))
            .await;
        assert!(out.text.starts_with("Found 1 conversation(s) matching 'RELEASE':"));
        assert!(out.text.contains("- Task: Write the release notes"));

        let out = executor.execute("delete_conversation", by_id.clone()).await;
        assert!(!out.ok);

        let out = executor.execute("end_conversation", by_id.clone()).await;
        assert_eq!(out.text, format!("Ended conversation {id}"));

        let out = executor.execute("resume_conversation", by_id.clone()).await;
        assert!(!out.ok);
        assert!(out.text.contains("has ended"));

        let out = executor.execute("delete_conversation", by_id).await;
        assert_eq!(out.text, format!("Deleted conversation {id}"));

        let out = executor.execute("list_conversations", json!({})).await;
        assert!(out.text.starts_with("No active conversations."));
        let out = executor
            .execute("search_conversations", json!({"query": "release"}))
            .await;
        assert_eq!(out.text, "No conversations match 'release'");
    }
}
