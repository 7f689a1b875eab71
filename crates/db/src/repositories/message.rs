use sqlx::{sqlite::SqliteRow, Row};

use motocrm_core::domain::conversation::ConversationId;
use motocrm_core::domain::message::{Direction, Message, MessageId};

use super::lead::parse_timestamp;
use super::{MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn find_by_platform_id(
        &self,
        conversation_id: &ConversationId,
        platform_msg_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, direction, content_json, platform_msg_id,
                    sent_at, created_at
             FROM message
             WHERE conversation_id = ? AND platform_msg_id = ?",
        )
        .bind(&conversation_id.0)
        .bind(platform_msg_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        row.map(message_from_row).transpose()
    }

    async fn insert(&self, message: Message) -> Result<(), RepositoryError> {
        let content_json = serde_json::to_string(&message.content)
            .map_err(|error| RepositoryError::Decode(format!("encode content: {error}")))?;

        sqlx::query(
            "INSERT INTO message (
                id, conversation_id, direction, content_json, platform_msg_id,
                sent_at, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id.0)
        .bind(&message.conversation_id.0)
        .bind(message.direction.as_str())
        .bind(content_json)
        .bind(&message.platform_msg_id)
        .bind(message.sent_at.to_rfc3339())
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        Ok(())
    }

    async fn count_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<i64, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message WHERE conversation_id = ?")
                .bind(&conversation_id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(RepositoryError::from_sqlx)?;

        Ok(count)
    }
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let direction_raw = row.try_get::<String, _>("direction")?;
    let direction = Direction::parse(&direction_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown direction `{direction_raw}`")))?;

    let content_raw = row.try_get::<String, _>("content_json")?;
    let content = serde_json::from_str(&content_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid content_json: {error}")))?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        direction,
        content,
        platform_msg_id: row.try_get("platform_msg_id")?,
        sent_at: parse_timestamp("sent_at", row.try_get("sent_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use motocrm_core::channel::Channel;
    use motocrm_core::domain::conversation::Conversation;
    use motocrm_core::domain::lead::Lead;
    use motocrm_core::domain::message::{Direction, Message, MessageContent};

    use super::SqlMessageRepository;
    use crate::migrations;
    use crate::repositories::{
        ConversationRepository, LeadRepository, MessageRepository, SqlConversationRepository,
        SqlLeadRepository,
    };
    use crate::{connect_with_settings, DbPool};

    async fn setup() -> (DbPool, Conversation) {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");

        let lead = Lead::new("María");
        SqlLeadRepository::new(pool.clone()).save(lead.clone()).await.expect("insert lead");

        let conversation = Conversation::new(lead.id, Channel::Whatsapp, "987654321");
        SqlConversationRepository::new(pool.clone())
            .save(conversation.clone())
            .await
            .expect("insert conversation");

        (pool, conversation)
    }

    fn sample_message(conversation: &Conversation, platform_msg_id: &str) -> Message {
        Message::new(
            conversation.id.clone(),
            Direction::Inbound,
            MessageContent::Text { text: "Hola".to_string() },
            platform_msg_id,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn round_trips_a_message() {
        let (pool, conversation) = setup().await;
        let repo = SqlMessageRepository::new(pool.clone());
        let message = sample_message(&conversation, "msg_1");

        repo.insert(message.clone()).await.expect("insert");

        let found = repo
            .find_by_platform_id(&conversation.id, "msg_1")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, message.id);
        assert_eq!(found.content, message.content);

        assert_eq!(repo.count_for_conversation(&conversation.id).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn replayed_platform_msg_id_is_a_duplicate_key() {
        let (pool, conversation) = setup().await;
        let repo = SqlMessageRepository::new(pool.clone());

        repo.insert(sample_message(&conversation, "msg_1")).await.expect("first insert");
        let error = repo
            .insert(sample_message(&conversation, "msg_1"))
            .await
            .expect_err("replay must hit the unique index");
        assert!(error.is_duplicate_key(), "expected duplicate key, got {error:?}");

        assert_eq!(repo.count_for_conversation(&conversation.id).await.expect("count"), 1);

        pool.close().await;
    }
}
