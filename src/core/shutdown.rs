//! 优雅关闭
//!
//! Ctrl+C、SIGTERM 或调用方关闭 stdin 都会触发关闭；之后依次执行已注册的清理任务，
//! 其中 RegistryCleanup 把所有仍在运行的会话标记为 completed 并断开后端，重启后可以 resume。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::registry::ConversationRegistry;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 调用方关闭了输入流
    InputClosed,
}

/// 关闭信号；只记录第一次触发的原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::info!(?reason, "Shutdown requested");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务单独限时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {:.1}s",
                    name,
                    self.timeout.as_secs_f64()
                ),
            }
        }
    }
}

/// 关闭所有活跃会话
pub struct RegistryCleanup {
    registry: Arc<ConversationRegistry>,
}

impl RegistryCleanup {
    pub fn new(registry: Arc<ConversationRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RegistryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let before = self.registry.active_count().await;
        let closed = self.registry.shutdown_all().await;
        if closed < before {
            anyhow::bail!("{} of {} conversations did not close cleanly", before - closed, before);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ConversationRegistry"
    }
}

/// 运行主循环直到它自行结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(
    manager: Arc<ShutdownManager>,
    app: F,
    coordinator: &ShutdownCoordinator,
) where
    F: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            manager.shutdown(ShutdownReason::InputClosed);
        }
        _ = manager.wait_for_shutdown() => {}
    }

    coordinator.run_cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::core::registry::RegistryOptions;
    use crate::storage::ConversationStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        let token = manager.token();

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    #[tokio::test]
    async fn test_app_exit_runs_cleanup() {
        let manager = Arc::new(ShutdownManager::new());
        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.register(FlagCleanup {
            called: called.clone(),
        });

        run_with_graceful_shutdown(manager.clone(), async {}, &coordinator).await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(manager.reason(), Some(ShutdownReason::InputClosed));
    }

    #[tokio::test]
    async fn test_registry_cleanup_completes_conversations() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path()).await.unwrap();
        let registry = Arc::new(ConversationRegistry::new(
            RegistryOptions::default(),
            Arc::new(MockBackend::new()),
            store,
        ));
        let id = registry.create("Leftover", "task").await.unwrap();

        RegistryCleanup::new(registry.clone()).cleanup().await.unwrap();
        assert_eq!(registry.active_count().await, 0);
        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.metadata.status, crate::core::ConversationStatus::Completed);
    }
}
