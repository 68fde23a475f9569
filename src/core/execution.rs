//! 执行上下文：每个会话一条独立的串行执行通道
//!
//! 每个上下文独占一个 OS 线程，线程内跑自己的 current-thread tokio runtime，并独占一个 BackendConnection。
//! 调用方通过无界队列投递任务，每个任务带一个 oneshot 结果通道；通道内同一时刻只执行一个任务，
//! 因此连接永远不会被并发访问，一个会话卡住也不会拖慢其他会话或调度循环。
//!
//! 关闭：投递 Shutdown 哨兵，通道处理完排在它前面的任务后退出并断开连接。
//! 句柄被丢弃（或强制 abort）时取消令牌触发，通道立即放弃当前任务并断开连接，不会留下无人接收结果的后台工作。

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::error::ConversationError;
use crate::backend::{BackendConnection, BackendError};

/// 执行通道独占的后端连接
pub type Connection = Box<dyn BackendConnection>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Job = Box<dyn for<'a> FnOnce(&'a mut Connection) -> BoxFuture<'a, ()> + Send>;

/// 断开连接的上限时间
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum LaneMessage {
    Run(Job),
    Shutdown(oneshot::Sender<Result<(), BackendError>>),
}

/// 执行上下文句柄
#[derive(Debug)]
pub struct ExecutionContext {
    name: String,
    tx: mpsc::UnboundedSender<LaneMessage>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// 启动执行通道并在通道内连接后端；连接失败时通道退出并返回 Backend 错误
    pub async fn start(name: &str, connection: Connection) -> Result<Self, ConversationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let lane_cancel = cancel.clone();

        std::thread::Builder::new()
            .name(format!("c2c-{name}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BackendError::Io(e)));
                        return;
                    }
                };
                runtime.block_on(run_lane(connection, rx, ready_tx, lane_cancel));
            })
            .map_err(|e| ConversationError::Backend(format!("failed to spawn execution lane: {e}")))?;

        let context = Self {
            name: name.to_string(),
            tx,
            cancel,
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(context),
            Ok(Err(e)) => Err(ConversationError::backend(e)),
            Err(_) => Err(ConversationError::Backend(
                "execution lane exited during startup".into(),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 投递一个操作到通道并等待结果。
    /// 外层超时丢弃此 future 时，通道里的任务仍会跑完，结果被丢弃
    pub async fn submit<T, F>(&self, operation: F) -> Result<T, ConversationError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Connection) -> BoxFuture<'a, Result<T, ConversationError>>
            + Send
            + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = into_job(move |conn| {
            Box::pin(async move {
                let result = operation(conn).await;
                let _ = reply_tx.send(result);
            })
        });

        self.tx
            .send(LaneMessage::Run(job))
            .map_err(|_| closed(&self.name))?;
        reply_rx.await.map_err(|_| closed(&self.name))?
    }

    /// 优雅关闭：排在哨兵前面的任务照常执行，之后断开连接
    pub async fn shutdown(&self) -> Result<(), ConversationError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LaneMessage::Shutdown(ack_tx)).is_err() {
            return Ok(());
        }
        match ack_rx.await {
            Ok(result) => result.map_err(ConversationError::backend),
            Err(_) => Ok(()),
        }
    }

    /// 强制关闭：放弃当前任务，立即断开
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// 通道是否已退出
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn into_job<F>(f: F) -> Job
where
    F: for<'a> FnOnce(&'a mut Connection) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

fn closed(name: &str) -> ConversationError {
    ConversationError::Backend(format!("execution context {name} is closed"))
}

async fn run_lane(
    mut conn: Connection,
    mut rx: mpsc::UnboundedReceiver<LaneMessage>,
    ready_tx: oneshot::Sender<Result<(), BackendError>>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        r = conn.connect() => r,
        _ = cancel.cancelled() => Err(BackendError::Connect("cancelled while connecting".into())),
    };
    if let Err(e) = connected {
        let _ = ready_tx.send(Err(e));
        let _ = disconnect(&mut conn).await;
        return;
    }
    if ready_tx.send(Ok(())).is_err() {
        // 调用方已放弃（create 超时）
        let _ = disconnect(&mut conn).await;
        return;
    }

    let mut ack = None;
    loop {
        let message = tokio::select! {
            m = rx.recv() => m,
            _ = cancel.cancelled() => break,
        };
        match message {
            Some(LaneMessage::Run(job)) => {
                tokio::select! {
                    _ = job(&mut conn) => {}
                    _ = cancel.cancelled() => {
                        tracing::warn!("Execution lane cancelled with an operation in flight");
                        break;
                    }
                }
            }
            Some(LaneMessage::Shutdown(reply)) => {
                ack = Some(reply);
                break;
            }
            None => break,
        }
    }

    // 哨兵之后到达的任务不再执行：丢弃它们即关闭各自的结果通道
    rx.close();
    while let Ok(message) = rx.try_recv() {
        if let LaneMessage::Shutdown(reply) = message {
            let _ = reply.send(Ok(()));
        }
    }

    let result = disconnect(&mut conn).await;
    if let Err(e) = &result {
        tracing::error!("Failed to disconnect backend: {}", e);
    }
    if let Some(reply) = ack {
        let _ = reply.send(result);
    }
}

async fn disconnect(conn: &mut Connection) -> Result<(), BackendError> {
    match tokio::time::timeout(DISCONNECT_TIMEOUT, conn.disconnect()).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Protocol("disconnect timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{collect_response, BackendFactory, CollectorPolicy, MockBackend};

    async fn ask(conn: &mut Connection, text: String) -> Result<String, ConversationError> {
        conn.query(&text).await.map_err(ConversationError::backend)?;
        collect_response(conn.receive_response(), &CollectorPolicy::default())
            .await
            .map_err(ConversationError::backend)
    }

    #[tokio::test]
    async fn test_submit_runs_on_lane() {
        let backend = MockBackend::new();
        let ctx = ExecutionContext::start("t1", backend.open()).await.unwrap();

        let out = ctx
            .submit(|conn| Box::pin(ask(conn, "hi".to_string())))
            .await
            .unwrap();
        assert_eq!(out, "Echo: hi");

        let thread_name = ctx
            .submit(|_conn| {
                Box::pin(async {
                    Ok::<_, ConversationError>(std::thread::current().name().map(str::to_string))
                })
            })
            .await
            .unwrap();
        assert_eq!(thread_name.as_deref(), Some("c2c-t1"));
        assert_eq!(backend.connects(), 1);
    }

    #[tokio::test]
    async fn test_operations_keep_program_order() {
        let backend = MockBackend::new();
        let ctx = ExecutionContext::start("order", backend.open()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(ctx.submit(move |conn| Box::pin(ask(conn, format!("m{i}")))));
        }
        for (i, result) in futures_util::future::join_all(handles).await.into_iter().enumerate() {
            assert_eq!(result.unwrap(), format!("Echo: m{i}"));
        }
        assert_eq!(backend.queries(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let backend = MockBackend::new();
        backend.set_fail_connect(true);
        let err = ExecutionContext::start("bad", backend.open()).await.unwrap_err();
        assert!(matches!(err, ConversationError::Backend(_)));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_rejects_new_work() {
        let backend = MockBackend::new();
        let ctx = ExecutionContext::start("down", backend.open()).await.unwrap();
        ctx.shutdown().await.unwrap();
        assert_eq!(backend.disconnects(), 1);

        // 通道退出后发送端被关闭
        for _ in 0..50 {
            if ctx.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.is_closed());
        let err = ctx
            .submit(|conn| Box::pin(ask(conn, "late".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::Backend(_)));
        ctx.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_tears_down_stuck_lane() {
        let backend = MockBackend::new();
        backend.set_query_delay(Duration::from_secs(3600));
        let ctx = ExecutionContext::start("stuck", backend.open()).await.unwrap();

        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            ctx.submit(|conn| Box::pin(ask(conn, "slow".to_string()))),
        )
        .await;
        assert!(pending.is_err());

        drop(ctx);
        for _ in 0..100 {
            if backend.disconnects() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_lanes_do_not_block_each_other() {
        let slow_backend = MockBackend::new();
        slow_backend.set_query_delay(Duration::from_secs(3600));
        let fast_backend = MockBackend::new();

        let slow = ExecutionContext::start("slow", slow_backend.open()).await.unwrap();
        let fast = ExecutionContext::start("fast", fast_backend.open()).await.unwrap();

        let stuck = tokio::spawn({
            let slow = std::sync::Arc::new(slow);
            async move { slow.submit(|conn| Box::pin(ask(conn, "wait".to_string()))).await }
        });

        let out = tokio::time::timeout(
            Duration::from_secs(5),
            fast.submit(|conn| Box::pin(ask(conn, "quick".to_string()))),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out, "Echo: quick");
        stuck.abort();
    }
}
