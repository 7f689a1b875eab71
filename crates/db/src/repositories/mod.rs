use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use motocrm_core::channel::Channel;
use motocrm_core::domain::conversation::{Conversation, ConversationId};
use motocrm_core::domain::lead::{Lead, LeadId};
use motocrm_core::domain::message::Message;
use motocrm_core::domain::sync::{SyncRecord, SyncRecordId, SyncStatus};

pub mod conversation;
pub mod lead;
pub mod memory;
pub mod message;
pub mod sync_queue;

pub use conversation::SqlConversationRepository;
pub use lead::SqlLeadRepository;
pub use memory::{
    InMemoryConversationRepository, InMemoryLeadRepository, InMemoryMessageRepository,
    InMemorySyncQueueRepository,
};
pub use message::SqlMessageRepository;
pub use sync_queue::SqlSyncQueueRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
}

impl RepositoryError {
    /// Classifies a sqlx error, surfacing unique-index violations separately
    /// so callers can treat a concurrent duplicate insert as a replay rather
    /// than a storage failure.
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_error) = error {
            if db_error.message().contains("UNIQUE constraint failed") {
                return Self::DuplicateKey(db_error.message().to_string());
            }
        }
        Self::Database(error)
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError>;

    async fn find_by_subscriber_id(
        &self,
        subscriber_id: &str,
    ) -> Result<Option<Lead>, RepositoryError>;

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Lead>, RepositoryError>;

    /// Leads that already carry a platform subscriber id — the candidate set
    /// for bulk backfills, since the platform has no list-all API.
    async fn list_with_subscriber_id(&self) -> Result<Vec<Lead>, RepositoryError>;

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn find_by_channel_identity(
        &self,
        channel: Channel,
        channel_subscriber_id: &str,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Conversation>, RepositoryError>;

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_platform_id(
        &self,
        conversation_id: &ConversationId,
        platform_msg_id: &str,
    ) -> Result<Option<Message>, RepositoryError>;

    /// Plain insert; the (conversation, platform_msg_id) unique index reports
    /// replays as `RepositoryError::DuplicateKey`.
    async fn insert(&self, message: Message) -> Result<(), RepositoryError>;

    async fn count_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<i64, RepositoryError>;
}

#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    async fn find_by_id(&self, id: &SyncRecordId) -> Result<Option<SyncRecord>, RepositoryError>;

    /// Pending and failed records, oldest first.
    async fn list_retryable(&self) -> Result<Vec<SyncRecord>, RepositoryError>;

    async fn counts_by_status(&self) -> Result<HashMap<SyncStatus, i64>, RepositoryError>;

    async fn save(&self, record: SyncRecord) -> Result<(), RepositoryError>;

    /// Retention helper: removes succeeded records older than the cutoff.
    async fn purge_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError>;
}
