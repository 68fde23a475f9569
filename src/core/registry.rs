//! 会话注册表：活跃会话的唯一所有者
//!
//! 每个活跃会话 = 内存状态（Conversation）+ 独占的执行上下文。Store 只是镜像，存储失败记日志后继续。
//! create / send / end 各有独立超时；create 任一步失败都会回滚，不留下执行上下文或注册项。
//! ended 的会话立即从表中移除，之后 send 返回 NotFound，resume 也会拒绝。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, RwLock};

use super::conversation::{
    generate_conversation_id, new_session_id, sanitize_task_name, Conversation,
    ConversationStatus, Turn,
};
use super::error::ConversationError;
use super::execution::{Connection, ExecutionContext};
use super::rate_limit::RateLimiter;
use crate::backend::{collect_response, BackendFactory, CollectorPolicy};
use crate::config::AppConfig;
use crate::storage::{ConversationRecord, ConversationStore, SearchHit, StoreStats, StoredMessage};

/// 注册表参数：各操作超时、最小发送间隔与收集策略
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    pub create_timeout: Duration,
    pub send_timeout: Duration,
    pub end_timeout: Duration,
    pub min_message_interval: Duration,
    pub collector: CollectorPolicy,
}

impl RegistryOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            create_timeout: cfg.limits.create_timeout(),
            send_timeout: cfg.limits.send_timeout(),
            end_timeout: cfg.limits.end_timeout(),
            min_message_interval: cfg.limits.min_message_interval(),
            collector: CollectorPolicy::from_config(&cfg.collector),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// list() 返回的活跃会话摘要
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub task_name: String,
    pub task_description: String,
    pub status: ConversationStatus,
    pub message_count: usize,
    pub created_at: String,
    pub last_updated: String,
}

impl From<&Conversation> for ConversationSummary {
    fn from(c: &Conversation) -> Self {
        Self {
            conversation_id: c.id.clone(),
            task_name: c.task_name.clone(),
            task_description: c.task_description.clone(),
            status: c.status,
            message_count: c.message_count(),
            created_at: c.created_at.clone(),
            last_updated: c.last_updated().to_string(),
        }
    }
}

struct LiveConversation {
    context: Arc<ExecutionContext>,
    conversation: Conversation,
    /// 同一会话的 send 依次执行，历史与 Store 中的顺序即调用顺序
    turn_lock: Arc<tokio::sync::Mutex<()>>,
}

/// 活跃会话注册表
pub struct ConversationRegistry {
    options: RegistryOptions,
    backend: Arc<dyn BackendFactory>,
    store: ConversationStore,
    limiter: RateLimiter,
    live: RwLock<HashMap<String, LiveConversation>>,
    /// create 进行中、尚未注册的 ID
    pending_ids: Mutex<HashSet<String>>,
}

impl ConversationRegistry {
    pub fn new(
        options: RegistryOptions,
        backend: Arc<dyn BackendFactory>,
        store: ConversationStore,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(options.min_message_interval),
            options,
            backend,
            store,
            live: RwLock::new(HashMap::new()),
            pending_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// 创建会话：分配执行上下文、提交初始任务（不等待回复）、注册并落盘，返回会话 ID
    pub async fn create(
        &self,
        task_name: &str,
        task_description: &str,
    ) -> Result<String, ConversationError> {
        let limit = self.options.create_timeout;
        let (id, record, _turn) =
            tokio::time::timeout(limit, self.create_inner(task_name, task_description))
                .await
                .map_err(|_| ConversationError::timeout("Conversation creation", limit))??;

        // 落盘在超时之外，且持有 turn 锁：超时不会留下孤立记录，send 的追加也只会排在它之后
        if let Err(e) = self.store.save(&record).await {
            tracing::warn!(conversation = %id, "Failed to save conversation to storage: {}", e);
        }
        Ok(id)
    }

    async fn create_inner(
        &self,
        task_name: &str,
        task_description: &str,
    ) -> Result<(String, ConversationRecord, OwnedMutexGuard<()>), ConversationError> {
        let reservation = self.reserve_id(&sanitize_task_name(task_name)).await;
        let id = reservation.id.clone();

        let context = ExecutionContext::start(&id, self.backend.open()).await?;
        let task = task_description.to_string();
        if let Err(e) = context
            .submit(move |conn| Box::pin(submit_initial_task(conn, task)))
            .await
        {
            tracing::warn!(conversation = %id, "Initial task failed, rolling back: {}", e);
            self.teardown(&context).await;
            return Err(e);
        }

        let conversation = Conversation::new(id.clone(), new_session_id(), task_name, task_description);
        let record = conversation.to_record();
        let turn_lock = Arc::new(tokio::sync::Mutex::new(()));
        let turn = turn_lock.clone().lock_owned().await;

        self.live.write().await.insert(
            id.clone(),
            LiveConversation {
                context: Arc::new(context),
                conversation,
                turn_lock,
            },
        );
        tracing::info!(conversation = %id, task = %task_name, "Conversation created");
        Ok((id, record, turn))
    }

    /// 生成不与活跃会话、进行中的 create 和已存储记录冲突的 ID
    async fn reserve_id(&self, sanitized: &str) -> IdReservation<'_> {
        loop {
            let candidate = generate_conversation_id(sanitized);
            let reserved = self
                .pending_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(candidate.clone());
            if !reserved {
                continue;
            }
            let reservation = IdReservation {
                ids: &self.pending_ids,
                id: candidate,
            };
            if self.live.read().await.contains_key(&reservation.id)
                || self.store.exists(&reservation.id).await
            {
                tracing::debug!(candidate = %reservation.id, "Conversation id collision, retrying");
                continue;
            }
            return reservation;
        }
    }

    /// 发送消息并收集回复；message 为空时只收集尚未读取的回复
    pub async fn send(&self, id: &str, message: &str) -> Result<String, ConversationError> {
        let (context, turn_lock) = {
            let live = self.live.read().await;
            let entry = live.get(id).ok_or_else(|| not_found(id))?;
            (entry.context.clone(), entry.turn_lock.clone())
        };
        let _turn = turn_lock.lock().await;
        // 等锁期间会话可能已被 end / complete
        let still_live = self
            .live
            .read()
            .await
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.context, &context));
        if !still_live {
            return Err(not_found(id));
        }

        self.limiter.acquire(id).await;

        let limit = self.options.send_timeout;
        let request = message.to_string();
        let policy = self.options.collector;
        let response = tokio::time::timeout(
            limit,
            context.submit(move |conn| Box::pin(exchange(conn, request, policy))),
        )
        .await
        .map_err(|_| ConversationError::timeout("Message sending", limit))??;

        let mut turns = Vec::with_capacity(2);
        if !message.is_empty() {
            turns.push(Turn::user(message));
        }
        turns.push(Turn::agent(response.as_str()));
        if !self.record_turns(id, turns).await {
            return Err(ConversationError::InvalidState(format!(
                "Conversation {id} was closed before the reply could be recorded"
            )));
        }

        Ok(response)
    }

    /// 写入内存历史并追加到 Store；会话已不在表中时什么都不写，返回 false
    async fn record_turns(&self, id: &str, turns: Vec<Turn>) -> bool {
        let stored: Vec<StoredMessage> = turns.iter().map(Turn::to_stored).collect();
        {
            let mut live = self.live.write().await;
            let Some(entry) = live.get_mut(id) else {
                tracing::warn!(conversation = %id, "Conversation closed while a message was in flight");
                return false;
            };
            turns.into_iter().for_each(|t| entry.conversation.push(t));
        }

        match self.store.append_messages(id, stored).await {
            Ok(true) => {}
            Ok(false) => {
                // 创建时落盘失败过：用内存状态补写整条记录
                let snapshot = self
                    .live
                    .read()
                    .await
                    .get(id)
                    .map(|entry| entry.conversation.to_record());
                if let Some(record) = snapshot {
                    if let Err(e) = self.store.save(&record).await {
                        tracing::warn!(conversation = %id, "Failed to save conversation to storage: {}", e);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(conversation = %id, "Failed to update conversation in storage: {}", e);
            }
        }
        true
    }

    /// 结束会话：关闭执行上下文，记录标记为 ended，从注册表移除
    pub async fn end(&self, id: &str) -> Result<(), ConversationError> {
        self.finish(id, ConversationStatus::Ended, "Conversation ending")
            .await
    }

    /// 完成会话：同 end，但记录标记为 completed，之后可以 resume
    pub async fn complete(&self, id: &str) -> Result<(), ConversationError> {
        self.finish(id, ConversationStatus::Completed, "Conversation completion")
            .await
    }

    async fn finish(
        &self,
        id: &str,
        status: ConversationStatus,
        operation: &'static str,
    ) -> Result<(), ConversationError> {
        let limit = self.options.end_timeout;
        let deadline = tokio::time::Instant::now() + limit;
        let turn_lock = {
            let live = self.live.read().await;
            live.get(id).ok_or_else(|| not_found(id))?.turn_lock.clone()
        };
        // 等进行中的 send 记录完毕；拿不到锁说明通道被占住，到期后强制关闭
        let turn = tokio::time::timeout_at(deadline, turn_lock.lock_owned()).await.ok();

        // 先移除，之后不会再有新的 submit 找到这个上下文
        let mut entry = self
            .live
            .write()
            .await
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        self.limiter.forget(id);

        let outcome = match turn {
            Some(_) => match tokio::time::timeout_at(deadline, entry.context.shutdown()).await {
                Ok(result) => result,
                Err(_) => {
                    entry.context.abort();
                    Err(ConversationError::timeout(operation, limit))
                }
            },
            None => {
                entry.context.abort();
                Err(ConversationError::timeout(operation, limit))
            }
        };

        entry.conversation.set_status(status);
        match self.store.update_status(id, status).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.store.save(&entry.conversation.to_record()).await {
                    tracing::warn!(conversation = %id, "Failed to save conversation to storage: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(conversation = %id, "Failed to mark conversation as {}: {}", status, e);
            }
        }

        match &outcome {
            Ok(()) => tracing::info!(conversation = %id, %status, "Conversation closed"),
            Err(e) => tracing::warn!(conversation = %id, %status, "Conversation force-closed: {}", e),
        }
        outcome
    }

    /// 从 Store 恢复一个 completed（或遗留 active）的会话，返回历史消息数
    pub async fn resume(&self, id: &str) -> Result<usize, ConversationError> {
        let limit = self.options.create_timeout;
        tokio::time::timeout(limit, self.resume_inner(id))
            .await
            .map_err(|_| ConversationError::timeout("Conversation resume", limit))?
    }

    async fn resume_inner(&self, id: &str) -> Result<usize, ConversationError> {
        if self.live.read().await.contains_key(id) {
            return Err(already_active(id));
        }
        let record = self.store.load(id).await?.ok_or_else(|| not_found(id))?;
        if record.metadata.status == ConversationStatus::Ended {
            return Err(ConversationError::InvalidState(format!(
                "Conversation {id} has ended and cannot be resumed"
            )));
        }

        let context = ExecutionContext::start(id, self.backend.open()).await?;
        let conversation = Conversation::from_record(&record, new_session_id());
        let message_count = conversation.message_count();

        let mut live = self.live.write().await;
        if live.contains_key(id) {
            drop(live);
            self.teardown(&context).await;
            return Err(already_active(id));
        }
        if let Err(e) = self.store.save(&conversation.to_record()).await {
            tracing::warn!(conversation = %id, "Failed to save resumed session: {}", e);
        }
        live.insert(
            id.to_string(),
            LiveConversation {
                context: Arc::new(context),
                conversation,
                turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        tracing::info!(conversation = %id, message_count, "Conversation resumed");
        Ok(message_count)
    }

    /// 会话详情：活跃会话取内存状态，否则读 Store
    pub async fn get(&self, id: &str) -> Result<ConversationRecord, ConversationError> {
        if let Some(entry) = self.live.read().await.get(id) {
            return Ok(entry.conversation.to_record());
        }
        self.store.load(id).await?.ok_or_else(|| not_found(id))
    }

    /// 活跃会话，最近更新的在前
    pub async fn list(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .live
            .read()
            .await
            .values()
            .map(|entry| ConversationSummary::from(&entry.conversation))
            .collect();
        summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        summaries
    }

    pub async fn active_count(&self) -> usize {
        self.live.read().await.len()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.live.read().await.contains_key(id)
    }

    pub async fn list_stored(&self) -> Result<Vec<ConversationRecord>, ConversationError> {
        Ok(self.store.list().await?)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ConversationError> {
        Ok(self.store.search(query).await?)
    }

    pub async fn stats(&self) -> Result<StoreStats, ConversationError> {
        Ok(self.store.stats().await?)
    }

    /// 删除存储记录；仍在运行的会话需先 end / complete
    pub async fn delete(&self, id: &str) -> Result<(), ConversationError> {
        if self.is_active(id).await {
            return Err(ConversationError::InvalidState(format!(
                "Conversation {id} is still active; end it before deleting"
            )));
        }
        if self.store.delete(id).await? {
            tracing::info!(conversation = %id, "Conversation deleted");
            Ok(())
        } else {
            Err(not_found(id))
        }
    }

    /// 进程退出前把所有活跃会话标记为 completed，返回成功关闭的数量
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.live.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return 0;
        }
        tracing::info!("Completing {} active conversation(s)", ids.len());
        let results = futures_util::future::join_all(ids.iter().map(|id| self.complete(id))).await;
        results
            .into_iter()
            .zip(&ids)
            .filter(|(result, id)| match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(conversation = %id, "Failed to complete during shutdown: {}", e);
                    false
                }
            })
            .count()
    }

    async fn teardown(&self, context: &ExecutionContext) {
        match tokio::time::timeout(self.options.end_timeout, context.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(context = %context.name(), "Teardown failed: {}", e),
            Err(_) => {
                tracing::warn!(context = %context.name(), "Teardown timed out, aborting");
                context.abort();
            }
        }
    }
}

struct IdReservation<'a> {
    ids: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

fn not_found(id: &str) -> ConversationError {
    ConversationError::NotFound(id.to_string())
}

fn already_active(id: &str) -> ConversationError {
    ConversationError::InvalidState(format!("Conversation {id} is already active"))
}

async fn submit_initial_task(conn: &mut Connection, task: String) -> Result<(), ConversationError> {
    conn.query(&task).await.map_err(ConversationError::backend)
}

async fn exchange(
    conn: &mut Connection,
    message: String,
    policy: CollectorPolicy,
) -> Result<String, ConversationError> {
    if !message.is_empty() {
        conn.query(&message).await.map_err(ConversationError::backend)?;
    }
    collect_response(conn.receive_response(), &policy)
        .await
        .map_err(ConversationError::backend)
}
