//! 会话持久化存储
//!
//! 每个会话一个文件 `<dir>/<conversation_id>.json`，内容为完整的 ConversationRecord。
//! 写入走「临时文件 + rename」，读者永远看不到写了一半的文档。
//! 所有写操作（含 load-修改-save）在同一把锁下串行，并发的追加与状态更新不会互相覆盖。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::record::{ConversationRecord, SearchHit, StoreStats, StoredMessage};
use crate::core::conversation::{advance_timestamp, is_valid_conversation_id, new_message_id, now_timestamp};
use crate::core::{ConversationStatus, Role};

const RECORD_EXTENSION: &str = "json";

/// 搜索片段中消息内容的最大字符数
const SNIPPET_CHARS: usize = 100;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 文件型会话存储；clone 后共享同一把写锁
#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ConversationStore {
    /// 打开（必要时创建）存储目录
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 非法 ID 返回 None，所有按 ID 的操作都把它当作「不存在」
    fn record_path(&self, conversation_id: &str) -> Option<PathBuf> {
        is_valid_conversation_id(conversation_id)
            .then(|| self.dir.join(format!("{conversation_id}.{RECORD_EXTENSION}")))
    }

    pub async fn exists(&self, conversation_id: &str) -> bool {
        match self.record_path(conversation_id) {
            Some(path) => fs::try_exists(&path).await.unwrap_or(false),
            None => false,
        }
    }

    /// 整体写入一条记录
    pub async fn save(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        let _write = self.write_lock.lock().await;
        self.write_record(record).await
    }

    async fn write_record(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        let id = &record.metadata.conversation_id;
        let path = self.record_path(id).ok_or_else(|| invalid_id(id))?;
        let data = serde_json::to_vec_pretty(record)?;

        let tmp = path.with_extension(format!(
            "{RECORD_EXTENSION}.{}.tmp",
            uuid::Uuid::new_v4().simple()
        ));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// 读取记录；文件不存在时返回 None，内容损坏时返回 Json 错误
    pub async fn load(&self, conversation_id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let Some(path) = self.record_path(conversation_id) else {
            return Ok(None);
        };
        let data = match fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// 列出所有记录，按 last_updated 倒序；损坏的文件跳过
    pub async fn list(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Skipping unreadable conversation record {:?}: {}", path, e);
                }
            }
        }
        records.sort_by(|a, b| b.metadata.last_updated.cmp(&a.metadata.last_updated));
        Ok(records)
    }

    /// 更新状态与 last_updated；记录不存在时返回 false
    pub async fn update_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<bool, StoreError> {
        let _write = self.write_lock.lock().await;
        let Some(mut record) = self.load(conversation_id).await? else {
            return Ok(false);
        };
        record.metadata.status = status;
        record.metadata.last_updated = advance_timestamp(&record.metadata.last_updated, &now_timestamp());
        self.write_record(&record).await?;
        Ok(true)
    }

    /// 删除记录文件；不存在时返回 false
    pub async fn delete(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let Some(path) = self.record_path(conversation_id) else {
            return Ok(false);
        };
        let _write = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 追加一条新消息（自动生成 message_id 与时间戳）
    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        message: &str,
    ) -> Result<bool, StoreError> {
        let stored = StoredMessage {
            role,
            message: message.to_string(),
            timestamp: now_timestamp(),
            message_id: Some(new_message_id()),
        };
        self.append_messages(conversation_id, vec![stored]).await
    }

    /// 一次重写追加多条消息：要么全部落盘，要么都不落盘。
    /// completed 记录会被重新打开为 active；记录不存在时返回 false
    pub async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<StoredMessage>,
    ) -> Result<bool, StoreError> {
        let _write = self.write_lock.lock().await;
        let Some(mut record) = self.load(conversation_id).await? else {
            return Ok(false);
        };
        let mut last_updated = record.metadata.last_updated.clone();
        for message in &messages {
            last_updated = advance_timestamp(&last_updated, &message.timestamp);
        }
        record.messages.extend(messages);
        record.metadata.message_count = record.messages.len();
        record.metadata.last_updated = advance_timestamp(&last_updated, &now_timestamp());
        if record.metadata.status == ConversationStatus::Completed {
            record.metadata.status = ConversationStatus::Active;
        }
        self.write_record(&record).await?;
        Ok(true)
    }

    /// 按内容搜索（不区分大小写）：初始任务与每条消息
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, StoreError> {
        let needle = query.to_lowercase();
        let hits = self
            .list()
            .await?
            .into_iter()
            .filter_map(|record| {
                let mut matches = Vec::new();
                if record.metadata.initial_task.to_lowercase().contains(&needle) {
                    matches.push(format!("Task: {}", record.metadata.initial_task));
                }
                for message in &record.messages {
                    if message.message.to_lowercase().contains(&needle) {
                        let snippet: String = message.message.chars().take(SNIPPET_CHARS).collect();
                        matches.push(format!("{}: {}...", message.role.as_str(), snippet));
                    }
                }
                (!matches.is_empty()).then_some(SearchHit { record, matches })
            })
            .collect();
        Ok(hits)
    }

    /// 统计：会话总数、消息总数、各状态数量、存储位置
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.list().await?;
        let mut status_counts = BTreeMap::new();
        for record in &records {
            *status_counts.entry(record.metadata.status).or_insert(0) += 1;
        }
        Ok(StoreStats {
            total_conversations: records.len(),
            total_messages: records.iter().map(|r| r.metadata.message_count).sum(),
            status_counts,
            storage_location: self.dir.clone(),
        })
    }
}

fn invalid_id(id: &str) -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("invalid conversation id: {id:?}"),
    ))
}
