//! 请求格式与 JSON Schema（schemars 自动生成）
//!
//! stdin 每行一个请求：`{"tool": "...", "args": {...}}` 或 `{"list_tools": true}`。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// 单行请求
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ToolRequest {
    /// 可选的请求标识，原样带回响应（请求并发处理，响应可能乱序）
    #[serde(default)]
    pub id: Option<Value>,
    /// 工具名，如 create_conversation、send_message
    #[serde(default)]
    pub tool: Option<String>,
    /// 工具参数，依工具不同而不同
    #[serde(default)]
    pub args: Value,
    /// 为 true 时返回所有工具的名称、描述与参数 schema
    #[serde(default)]
    pub list_tools: bool,
}

/// 请求格式的 JSON Schema
pub fn tool_request_schema() -> Value {
    parameters_schema_for::<ToolRequest>()
}

/// 某个参数结构体的 JSON Schema
pub fn parameters_schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// 按参数结构体解析 args；缺少参数时给出可读的错误
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))
}
