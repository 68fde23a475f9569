//! C2C - Agent 对话中继
//!
//! 入口：加载配置、初始化日志、组装 Store / 后端 / 注册表 / 工具，然后在 stdin / stdout 上按行处理请求。
//! 每个请求独立处理，一个会话的慢回复不会阻塞其他会话；退出前把仍在运行的会话标记为 completed。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use c2c::backend::create_backend_from_config;
use c2c::config::load_config;
use c2c::core::{
    run_with_graceful_shutdown, ConversationRegistry, RegistryCleanup, RegistryOptions,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use c2c::storage::ConversationStore;
use c2c::tools::{register_conversation_tools, ToolExecutor, ToolRegistry};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "c2c")]
#[command(about = "C2C - agent conversation relay, JSON-lines requests on stdin", long_about = None)]
struct Cli {
    /// 配置文件路径，覆盖 config/default.toml 中的同名键
    #[arg(long, env = "C2C_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    c2c::observability::init();

    let cfg = load_config(cli.config).context("Failed to load configuration")?;
    let store_dir = cfg.storage.resolved_dir();
    let store = ConversationStore::open(&store_dir)
        .await
        .with_context(|| format!("Failed to open conversation store at {}", store_dir.display()))?;
    tracing::info!("Conversation store: {}", store_dir.display());

    let backend = create_backend_from_config(&cfg.backend);
    let registry = Arc::new(ConversationRegistry::new(
        RegistryOptions::from_config(&cfg),
        backend,
        store,
    ));

    let mut tools = ToolRegistry::new();
    register_conversation_tools(&mut tools, registry.clone());
    let executor = Arc::new(ToolExecutor::new(tools));
    tracing::info!("Tools: {}", executor.tool_names().join(", "));

    let manager = Arc::new(ShutdownManager::new());
    // 所有会话并发关闭，单个会话最多 end_timeout
    let mut coordinator = ShutdownCoordinator::new(cfg.limits.end_timeout() * 2);
    coordinator.register(RegistryCleanup::new(registry));

    run_with_graceful_shutdown(manager.clone(), serve_stdio(executor), &coordinator).await;
    tracing::info!(reason = ?manager.reason(), "Exited");
    // stdin 的阻塞读取不会自行结束，因信号退出时 runtime 无法正常 drop
    if manager.reason() != Some(ShutdownReason::InputClosed) {
        std::process::exit(0);
    }
    Ok(())
}

/// 逐行读取请求，并发处理，响应由单独的写任务按完成顺序逐行输出；stdin 关闭后等待处理中的请求结束
async fn serve_stdio(executor: Arc<ToolExecutor>) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = out_rx.recv().await {
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                tracing::error!("Failed to write response: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            next = lines.next_line() => match next {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let executor = executor.clone();
                    let out_tx = out_tx.clone();
                    in_flight.spawn(async move {
                        let response = executor.handle_line(&line).await;
                        let _ = out_tx.send(response);
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read request: {}", e);
                    break;
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Request task failed: {}", e);
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Request task failed: {}", e);
        }
    }
    drop(out_tx);
    let _ = writer.await;
}
