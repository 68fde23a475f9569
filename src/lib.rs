//! C2C - Agent 对话中继
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话模型、执行上下文（每会话一条独立通道）、限流、注册表、优雅关闭
//! - **backend**: 后端连接抽象、响应收集、Stdio 子进程与 Mock 实现
//! - **storage**: 会话记录的文件存储
//! - **tools**: 对外操作（create / send / end / ...）与执行器
//! - **observability**: 日志初始化

pub mod backend;
pub mod config;
pub mod core;
pub mod observability;
pub mod storage;
pub mod tools;
