use sqlx::{sqlite::SqliteRow, Row};

use motocrm_core::channel::Channel;
use motocrm_core::domain::conversation::{Conversation, ConversationId, ConversationStatus};
use motocrm_core::domain::lead::LeadId;

use super::lead::{parse_optional_timestamp, parse_timestamp};
use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CONVERSATION_COLUMNS: &str = "id, lead_id, channel, channel_subscriber_id, \
     last_message_at, status, assigned_agent, created_at, updated_at";

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        row.map(conversation_from_row).transpose()
    }

    async fn find_by_channel_identity(
        &self,
        channel: Channel,
        channel_subscriber_id: &str,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation \
             WHERE channel = ? AND channel_subscriber_id = ?"
        ))
        .bind(channel.as_str())
        .bind(channel_subscriber_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        row.map(conversation_from_row).transpose()
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Conversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation \
             WHERE lead_id = ? \
             ORDER BY created_at ASC"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        rows.into_iter().map(conversation_from_row).collect()
    }

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation (
                id, lead_id, channel, channel_subscriber_id, last_message_at,
                status, assigned_agent, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                lead_id = excluded.lead_id,
                channel = excluded.channel,
                channel_subscriber_id = excluded.channel_subscriber_id,
                last_message_at = excluded.last_message_at,
                status = excluded.status,
                assigned_agent = excluded.assigned_agent,
                updated_at = excluded.updated_at",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.lead_id.0)
        .bind(conversation.channel.as_str())
        .bind(&conversation.channel_subscriber_id)
        .bind(conversation.last_message_at.map(|value| value.to_rfc3339()))
        .bind(conversation.status.as_str())
        .bind(conversation.assigned_agent.as_deref())
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        Ok(())
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    let channel_raw = row.try_get::<String, _>("channel")?;
    let channel = Channel::parse(&channel_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown channel `{channel_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = ConversationStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conversation status `{status_raw}`"))
    })?;

    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        channel,
        channel_subscriber_id: row.try_get("channel_subscriber_id")?,
        last_message_at: parse_optional_timestamp(
            "last_message_at",
            row.try_get("last_message_at")?,
        )?,
        status,
        assigned_agent: row.try_get("assigned_agent")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
