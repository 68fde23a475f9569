//! 工具执行器
//!
//! execute(tool_name, args) 调用 registry.execute，把结果统一成 ToolOutcome：
//! 成功为工具返回的文本，失败为 "Error: <描述>"，错误不会越过这一层。每次调用输出一条 JSON 审计日志。

use std::time::Instant;

use serde::Serialize;

use crate::tools::schema::{tool_request_schema, ToolRequest};
use crate::tools::{ToolDescriptor, ToolRegistry};

/// 一次调用的结果（即 stdout 上的一行响应）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutcome {
    pub ok: bool,
    pub text: String,
}

impl ToolOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: text.into(),
        }
    }

    pub fn failure(description: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            text: format!("Error: {description}"),
        }
    }
}

/// 带请求标识的响应行
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

pub struct ToolExecutor {
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> ToolOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = self.registry.execute(tool_name, args).await;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": if result.is_ok() { "ok" } else { "error" },
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(text) => ToolOutcome::success(text),
            Err(e) => ToolOutcome::failure(e),
        }
    }

    /// 处理一行请求并返回一行 JSON 响应
    pub async fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ToolRequest>(line) {
            Err(e) => ToolResponse {
                id: None,
                outcome: ToolOutcome::failure(format!("Invalid request: {e}")),
            },
            Ok(request) if request.list_tools => ToolResponse {
                id: request.id,
                outcome: self.list_tools(),
            },
            Ok(ToolRequest {
                id,
                tool: Some(tool),
                args,
                ..
            }) => ToolResponse {
                id,
                outcome: self.execute(&tool, args).await,
            },
            Ok(request) => ToolResponse {
                id: request.id,
                outcome: ToolOutcome::failure("request needs either \"tool\" or \"list_tools\""),
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            tracing::error!("Failed to encode response: {}", e);
            r#"{"ok":false,"text":"Error: failed to encode response"}"#.to_string()
        })
    }

    fn list_tools(&self) -> ToolOutcome {
        let listing = serde_json::json!({
            "request_schema": tool_request_schema(),
            "tools": self.descriptors(),
        });
        match serde_json::to_string_pretty(&listing) {
            Ok(text) => ToolOutcome::success(text),
            Err(e) => ToolOutcome::failure(e),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Fails;

    #[async_trait]
    impl Tool for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("Conversation conv_x not found or not active".into())
        }
    }

    #[tokio::test]
    async fn test_errors_become_text() {
        let mut registry = ToolRegistry::new();
        registry.register(Fails);
        let executor = ToolExecutor::new(registry);

        let out = executor.execute("fails", Value::Null).await;
        assert_eq!(
            out,
            ToolOutcome {
                ok: false,
                text: "Error: Conversation conv_x not found or not active".into()
            }
        );

        let out = executor.execute("missing", Value::Null).await;
        assert!(!out.ok);
        assert_eq!(out.text, "Error: Unknown tool: missing");
    }

    #[tokio::test]
    async fn test_handle_line() {
        let mut registry = ToolRegistry::new();
        registry.register(Fails);
        let executor = ToolExecutor::new(registry);

        let line = executor
            .handle_line(r#"{"id": 7, "tool": "fails", "args": {}}"#)
            .await;
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["ok"], false);
        assert!(v["text"].as_str().unwrap().starts_with("Error: "));

        let line = executor.handle_line("not json").await;
        let v: Value = serde_json::from_str(&line).unwrap();
        assert!(v.get("id").is_none());
        assert!(v["text"].as_str().unwrap().starts_with("Error: Invalid request:"));

        let line = executor.handle_line(r#"{"args": {}}"#).await;
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["ok"], false);

        let line = executor.handle_line(r#"{"list_tools": true}"#).await;
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["ok"], true);
        let listing: Value = serde_json::from_str(v["text"].as_str().unwrap()).unwrap();
        assert_eq!(listing["tools"][0]["name"], "fails");
        assert!(listing["request_schema"].is_object());
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = serde_json::json!({ "message": "x".repeat(500) });
        let preview = args_preview(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}
