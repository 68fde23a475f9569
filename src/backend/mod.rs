//! 后端层：连接抽象、响应收集与实现（Stdio 子进程 / Mock）

pub mod collector;
pub mod mock;
pub mod stdio;
pub mod traits;

pub use collector::{collect_response, CollectorPolicy};
pub use mock::MockBackend;
pub use stdio::StdioBackend;
pub use traits::{
    BackendConnection, BackendError, BackendFactory, ResponseStream, ResponseUnit, TerminalStatus,
};

use std::sync::Arc;

use crate::config::BackendSection;

/// 按配置创建后端工厂：mock 或 stdio（默认）
pub fn create_backend_from_config(cfg: &BackendSection) -> Arc<dyn BackendFactory> {
    match cfg.kind.as_str() {
        "mock" => {
            tracing::info!("Using mock backend");
            Arc::new(MockBackend::new())
        }
        other => {
            if other != "stdio" {
                tracing::warn!("Unknown backend kind '{}', falling back to stdio", other);
            }
            tracing::info!("Using stdio backend: {:?}", cfg.command);
            Arc::new(StdioBackend::new(cfg.command.clone(), cfg.working_dir.clone()))
        }
    }
}
