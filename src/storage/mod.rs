//! 持久化层：会话记录格式与文件存储

pub mod record;
pub mod store;

pub use record::{ConversationMetadata, ConversationRecord, SearchHit, StoreStats, StoredMessage};
pub use store::{ConversationStore, StoreError};
