//! In-memory repository implementations for tests and local experiments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use motocrm_core::channel::Channel;
use motocrm_core::domain::conversation::{Conversation, ConversationId};
use motocrm_core::domain::lead::{Lead, LeadId};
use motocrm_core::domain::message::Message;
use motocrm_core::domain::sync::{SyncRecord, SyncRecordId, SyncStatus};

use super::{
    ConversationRepository, LeadRepository, MessageRepository, RepositoryError,
    SyncQueueRepository,
};

#[derive(Default)]
pub struct InMemoryLeadRepository {
    leads: RwLock<HashMap<String, Lead>>,
}

impl InMemoryLeadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.leads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leads.read().await.is_empty()
    }
}

#[async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        Ok(self.leads.read().await.get(&id.0).cloned())
    }

    async fn find_by_subscriber_id(
        &self,
        subscriber_id: &str,
    ) -> Result<Option<Lead>, RepositoryError> {
        Ok(self
            .leads
            .read()
            .await
            .values()
            .find(|lead| lead.subscriber_id.as_deref() == Some(subscriber_id))
            .cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Lead>, RepositoryError> {
        Ok(self
            .leads
            .read()
            .await
            .values()
            .find(|lead| lead.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn list_with_subscriber_id(&self) -> Result<Vec<Lead>, RepositoryError> {
        let mut leads: Vec<Lead> = self
            .leads
            .read()
            .await
            .values()
            .filter(|lead| lead.subscriber_id.as_deref().is_some_and(|id| !id.is_empty()))
            .cloned()
            .collect();
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(leads)
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        let mut leads = self.leads.write().await;
        if let Some(subscriber_id) = lead.subscriber_id.as_deref().filter(|id| !id.is_empty()) {
            let taken = leads.values().any(|existing| {
                existing.id != lead.id && existing.subscriber_id.as_deref() == Some(subscriber_id)
            });
            if taken {
                return Err(RepositoryError::DuplicateKey(format!(
                    "lead.subscriber_id `{subscriber_id}`"
                )));
            }
        }
        leads.insert(lead.id.0.clone(), lead);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversations.read().await.get(&id.0).cloned())
    }

    async fn find_by_channel_identity(
        &self,
        channel: Channel,
        channel_subscriber_id: &str,
    ) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self
            .conversations
            .read()
            .await
            .values()
            .find(|conversation| {
                conversation.channel == channel
                    && conversation.channel_subscriber_id == channel_subscriber_id
            })
            .cloned())
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Conversation>, RepositoryError> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .read()
            .await
            .values()
            .filter(|conversation| conversation.lead_id == *lead_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(conversations)
    }

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let taken = conversations.values().any(|existing| {
            existing.id != conversation.id
                && existing.channel == conversation.channel
                && existing.channel_subscriber_id == conversation.channel_subscriber_id
        });
        if taken {
            return Err(RepositoryError::DuplicateKey(format!(
                "conversation ({}, {})",
                conversation.channel.as_str(),
                conversation.channel_subscriber_id
            )));
        }
        conversations.insert(conversation.id.0.clone(), conversation);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<HashMap<String, Message>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn find_by_platform_id(
        &self,
        conversation_id: &ConversationId,
        platform_msg_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .find(|message| {
                message.conversation_id == *conversation_id
                    && message.platform_msg_id == platform_msg_id
            })
            .cloned())
    }

    async fn insert(&self, message: Message) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;
        let replay = messages.values().any(|existing| {
            existing.conversation_id == message.conversation_id
                && existing.platform_msg_id == message.platform_msg_id
        });
        if replay {
            return Err(RepositoryError::DuplicateKey(format!(
                "message ({}, {})",
                message.conversation_id.0, message.platform_msg_id
            )));
        }
        messages.insert(message.id.0.clone(), message);
        Ok(())
    }

    async fn count_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<i64, RepositoryError> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .filter(|message| message.conversation_id == *conversation_id)
            .count() as i64)
    }
}

#[derive(Default)]
pub struct InMemorySyncQueueRepository {
    records: RwLock<HashMap<String, SyncRecord>>,
}

impl InMemorySyncQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SyncQueueRepository for InMemorySyncQueueRepository {
    async fn find_by_id(&self, id: &SyncRecordId) -> Result<Option<SyncRecord>, RepositoryError> {
        Ok(self.records.read().await.get(&id.0).cloned())
    }

    async fn list_retryable(&self) -> Result<Vec<SyncRecord>, RepositoryError> {
        let mut records: Vec<SyncRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.is_retryable())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn counts_by_status(&self) -> Result<HashMap<SyncStatus, i64>, RepositoryError> {
        let mut counts = HashMap::new();
        for record in self.records.read().await.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn save(&self, record: SyncRecord) -> Result<(), RepositoryError> {
        self.records.write().await.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn purge_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            record.status != SyncStatus::Succeeded || record.updated_at >= cutoff
        });
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use motocrm_core::channel::Channel;
    use motocrm_core::domain::conversation::Conversation;
    use motocrm_core::domain::lead::Lead;
    use motocrm_core::domain::message::{Direction, Message, MessageContent};

    use super::{InMemoryConversationRepository, InMemoryLeadRepository, InMemoryMessageRepository};
    use crate::repositories::{ConversationRepository, LeadRepository, MessageRepository};

    #[tokio::test]
    async fn in_memory_leads_enforce_subscriber_uniqueness() {
        let repo = InMemoryLeadRepository::new();

        let mut first = Lead::new("First");
        first.subscriber_id = Some("dup".to_string());
        let mut second = Lead::new("Second");
        second.subscriber_id = Some("dup".to_string());

        repo.save(first.clone()).await.expect("first save");
        let error = repo.save(second).await.expect_err("duplicate must fail");
        assert!(error.is_duplicate_key());

        // Re-saving the same lead is an update, not a collision.
        repo.save(first).await.expect("upsert same lead");
    }

    #[tokio::test]
    async fn in_memory_messages_reject_replays() {
        let lead = Lead::new("María");
        let conversation = Conversation::new(lead.id, Channel::Whatsapp, "987");
        InMemoryConversationRepository::new()
            .save(conversation.clone())
            .await
            .expect("save conversation");

        let repo = InMemoryMessageRepository::new();
        let message = Message::new(
            conversation.id.clone(),
            Direction::Inbound,
            MessageContent::Text { text: "Hola".to_string() },
            "msg_1",
            Utc::now(),
        );
        repo.insert(message).await.expect("first insert");

        let replay = Message::new(
            conversation.id.clone(),
            Direction::Inbound,
            MessageContent::Text { text: "Hola".to_string() },
            "msg_1",
            Utc::now(),
        );
        let error = repo.insert(replay).await.expect_err("replay must fail");
        assert!(error.is_duplicate_key());
        assert_eq!(repo.count_for_conversation(&conversation.id).await.expect("count"), 1);
    }
}
