//! 后端能力抽象
//!
//! 每个会话持有一个 BackendConnection：connect → query → receive_response（惰性、有序的响应单元流）→ disconnect。
//! 连接本身不支持并发访问，所有方法都取 `&mut self`，由执行上下文串行驱动。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

/// 终止标记：后端认为本轮回复已结束
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalStatus {
    Success,
    Error,
}

/// 响应单元
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseUnit {
    /// 文本内容块（一个单元可含多个块）
    Content { blocks: Vec<String> },
    /// 不含文本的中间单元（工具调用、系统事件等）
    Event,
    /// 终止标记，可附带文本
    Terminal {
        status: TerminalStatus,
        text: Option<String>,
    },
}

impl ResponseUnit {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Content {
            blocks: vec![text.into()],
        }
    }

    pub fn success() -> Self {
        Self::Terminal {
            status: TerminalStatus::Success,
            text: None,
        }
    }

    pub fn error() -> Self {
        Self::Terminal {
            status: TerminalStatus::Error,
            text: None,
        }
    }
}

/// 后端错误
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Backend closed the stream")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 响应单元流，借用连接直到被丢弃
pub type ResponseStream<'a> =
    Pin<Box<dyn Stream<Item = Result<ResponseUnit, BackendError>> + Send + 'a>>;

/// 单个后端会话连接
#[async_trait]
pub trait BackendConnection: Send {
    async fn connect(&mut self) -> Result<(), BackendError>;

    /// 提交一条消息；回复通过 receive_response 读取
    async fn query(&mut self, text: &str) -> Result<(), BackendError>;

    /// 读取当前回复的响应单元
    fn receive_response(&mut self) -> ResponseStream<'_>;

    async fn disconnect(&mut self) -> Result<(), BackendError>;
}

/// 后端工厂：每个会话打开一个新的（尚未连接的）连接
pub trait BackendFactory: Send + Sync {
    fn open(&self) -> Box<dyn BackendConnection>;
}
