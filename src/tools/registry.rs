//! 工具注册表
//!
//! 每个对外操作实现 Tool trait（name / description / parameters_schema / execute），ToolRegistry 按名注册与查找。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 对应请求中的 "tool" 字段
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 成功返回给调用方的文本，失败返回错误描述
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具描述（list_tools 的输出项）
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 按名称存储工具；遍历顺序固定为名称字典序
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            args.get("text")
                .and_then(Value::as_str)
                .map(str::to_uppercase)
                .ok_or_else(|| "missing text".to_string())
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);

        assert_eq!(registry.tool_names(), vec!["upper"]);
        let out = registry
            .execute("upper", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "HI");
        assert_eq!(
            registry.execute("nope", Value::Null).await.unwrap_err(),
            "Unknown tool: nope"
        );

        let descriptors = registry.descriptors();
        assert_eq!(descriptors[0].name, "upper");
        assert_eq!(descriptors[0].parameters["type"], "object");
    }
}
