//! Stdio 后端：为每个会话启动一个 Agent CLI 子进程，按行交换 JSON（stream-json）
//!
//! 输入：每条消息写一行 `{"type":"user","message":{"role":"user","content":"..."}}`
//! 输出：逐行解析
//! - `type = "assistant"`：message.content 中的 text 块 → Content；tool_use 块各输出一条审计日志
//! - `type = "result"`：subtype 为 success / error* → Terminal
//! - 其他类型或无法解析的行 → Event

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::traits::{
    BackendConnection, BackendError, BackendFactory, ResponseStream, ResponseUnit, TerminalStatus,
};

/// 关闭 stdin 后等待子进程自行退出的时间，超时则强制 kill
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Stdio 后端工厂
#[derive(Debug, Clone)]
pub struct StdioBackend {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl StdioBackend {
    pub fn new(command: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            working_dir,
        }
    }
}

impl BackendFactory for StdioBackend {
    fn open(&self) -> Box<dyn BackendConnection> {
        Box::new(StdioConnection {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            child: None,
            stdin: None,
            stdout: None,
        })
    }
}

struct StdioConnection {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
}

#[async_trait]
impl BackendConnection for StdioConnection {
    async fn connect(&mut self) -> Result<(), BackendError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| BackendError::Connect("empty backend command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Connect(format!("failed to spawn '{program}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Connect("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Connect("failed to capture stdout".into()))?;

        tracing::debug!(program = %program, pid = ?child.id(), "backend process started");
        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }

    async fn query(&mut self, text: &str) -> Result<(), BackendError> {
        let stdin = self.stdin.as_mut().ok_or(BackendError::NotConnected)?;
        let mut line = serde_json::to_string(&serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        }))
        .map_err(|e| BackendError::Protocol(e.to_string()))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn receive_response(&mut self) -> ResponseStream<'_> {
        let Some(lines) = self.stdout.as_mut() else {
            return Box::pin(stream::once(async { Err::<ResponseUnit, _>(BackendError::NotConnected) }));
        };
        Box::pin(stream::unfold(Some(lines), |state| async move {
            let Some(lines) = state else {
                return None;
            };
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => return Some((Ok(parse_stream_line(&line)), Some(lines))),
                    Ok(None) => return Some((Err(BackendError::Closed), None)),
                    Err(e) => return Some((Err(BackendError::Io(e)), None)),
                }
            }
        }))
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        drop(self.stdin.take());
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "backend process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::debug!("backend process did not exit in time, killing");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Assistant { message: AssistantMessage },
    Result { subtype: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

fn parse_stream_line(line: &str) -> ResponseUnit {
    match serde_json::from_str::<StreamLine>(line) {
        Ok(StreamLine::Assistant { message }) => {
            let blocks: Vec<String> = message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        audit_tool_use(&id, &name, &input);
                        None
                    }
                    ContentBlock::Other => None,
                })
                .collect();
            if blocks.is_empty() {
                ResponseUnit::Event
            } else {
                ResponseUnit::Content { blocks }
            }
        }
        Ok(StreamLine::Result { subtype }) => ResponseUnit::Terminal {
            status: if subtype.starts_with("error") {
                TerminalStatus::Error
            } else {
                TerminalStatus::Success
            },
            text: None,
        },
        Ok(StreamLine::Other) => ResponseUnit::Event,
        Err(e) => {
            tracing::debug!("Ignoring unparseable backend line: {}", e);
            ResponseUnit::Event
        }
    }
}

/// Agent 每次调用工具输出一条 JSON 审计日志
fn audit_tool_use(id: &str, name: &str, input: &serde_json::Value) -> serde_json::Value {
    let input = input.to_string();
    let input_preview = if input.chars().count() > 200 {
        format!("{}...", input.chars().take(200).collect::<String>())
    } else {
        input
    };
    let audit = serde_json::json!({
        "event": "backend_tool_use",
        "tool_use_id": id,
        "tool": name,
        "input_preview": input_preview,
    });
    tracing::info!(audit = %audit.to_string(), "backend tool");
    audit
}
