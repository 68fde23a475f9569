//! Mock 后端（用于测试，无需真实 Agent）
//!
//! 每次 query 清空上一轮未读完的单元，再放入下一条预置回复；没有预置回复时回显 `Echo: <query>` + success。
//!
//! 与 StdioBackend 不同：真实进程的 stdout 会保留上一轮没读完的行（包括 create 时初始任务的回复），
//! 在 stop_on_first_content 下下一次 send 会先读到这些旧内容。这里丢弃旧单元，每轮回复互不影响。
//! 可注入连接失败与延迟，并记录 query / connect / disconnect 次数供断言。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use super::traits::{BackendConnection, BackendError, BackendFactory, ResponseStream, ResponseUnit};

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<Vec<ResponseUnit>>,
    queries: Vec<String>,
    connects: usize,
    disconnects: usize,
    fail_connect: bool,
    connect_delay: Duration,
    query_delay: Duration,
}

/// Mock 后端工厂；clone 后共享同一份脚本与计数
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// 预置下一次 query 的回复
    pub fn push_reply(&self, units: Vec<ResponseUnit>) {
        self.with_state(|s| s.replies.push_back(units));
    }

    /// 预置一条单段文本回复（text + success）
    pub fn push_text_reply(&self, text: impl Into<String>) {
        self.push_reply(vec![ResponseUnit::text(text), ResponseUnit::success()]);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.with_state(|s| s.fail_connect = fail);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.with_state(|s| s.connect_delay = delay);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.with_state(|s| s.query_delay = delay);
    }

    pub fn queries(&self) -> Vec<String> {
        self.with_state(|s| s.queries.clone())
    }

    pub fn connects(&self) -> usize {
        self.with_state(|s| s.connects)
    }

    pub fn disconnects(&self) -> usize {
        self.with_state(|s| s.disconnects)
    }
}

impl BackendFactory for MockBackend {
    fn open(&self) -> Box<dyn BackendConnection> {
        Box::new(MockConnection {
            backend: self.clone(),
            pending: VecDeque::new(),
            connected: false,
        })
    }
}

struct MockConnection {
    backend: MockBackend,
    pending: VecDeque<ResponseUnit>,
    connected: bool,
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let (fail, delay) = self.backend.with_state(|s| (s.fail_connect, s.connect_delay));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BackendError::Connect("mock refused connection".into()));
        }
        self.backend.with_state(|s| s.connects += 1);
        self.connected = true;
        Ok(())
    }

    async fn query(&mut self, text: &str) -> Result<(), BackendError> {
        if !self.connected {
            return Err(BackendError::NotConnected);
        }
        let (reply, delay) = self.backend.with_state(|s| {
            s.queries.push(text.to_string());
            (s.replies.pop_front(), s.query_delay)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pending = reply
            .unwrap_or_else(|| vec![ResponseUnit::text(format!("Echo: {text}")), ResponseUnit::success()])
            .into();
        Ok(())
    }

    fn receive_response(&mut self) -> ResponseStream<'_> {
        let pending = &mut self.pending;
        Box::pin(stream::iter(std::iter::from_fn(move || {
            pending.pop_front().map(Ok::<_, BackendError>)
        })))
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        if self.connected {
            self.connected = false;
            self.backend.with_state(|s| s.disconnects += 1);
        }
        Ok(())
    }
}
