use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use motocrm_core::domain::lead::{Lead, LeadId, LeadStage};

use super::{LeadRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLeadRepository {
    pool: DbPool,
}

impl SqlLeadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const LEAD_COLUMNS: &str = "id, name, phone, email, subscriber_id, tags_json, \
     custom_fields_json, stage, created_at, updated_at";

#[async_trait::async_trait]
impl LeadRepository for SqlLeadRepository {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from_sqlx)?;

        row.map(lead_from_row).transpose()
    }

    async fn find_by_subscriber_id(
        &self,
        subscriber_id: &str,
    ) -> Result<Option<Lead>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE subscriber_id = ?"))
                .bind(subscriber_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from_sqlx)?;

        row.map(lead_from_row).transpose()
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE phone = ?"))
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from_sqlx)?;

        row.map(lead_from_row).transpose()
    }

    async fn list_with_subscriber_id(&self) -> Result<Vec<Lead>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM lead \
             WHERE subscriber_id IS NOT NULL \
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        rows.into_iter().map(lead_from_row).collect()
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        let tags_json = serde_json::to_string(&lead.tags)
            .map_err(|error| RepositoryError::Decode(format!("encode tags: {error}")))?;
        let custom_fields_json = serde_json::to_string(&lead.custom_fields)
            .map_err(|error| RepositoryError::Decode(format!("encode custom fields: {error}")))?;

        sqlx::query(
            "INSERT INTO lead (
                id, name, phone, email, subscriber_id, tags_json,
                custom_fields_json, stage, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                phone = excluded.phone,
                email = excluded.email,
                subscriber_id = excluded.subscriber_id,
                tags_json = excluded.tags_json,
                custom_fields_json = excluded.custom_fields_json,
                stage = excluded.stage,
                updated_at = excluded.updated_at",
        )
        .bind(&lead.id.0)
        .bind(&lead.name)
        .bind(normalized(lead.phone.as_deref()))
        .bind(normalized(lead.email.as_deref()))
        .bind(normalized(lead.subscriber_id.as_deref()))
        .bind(tags_json)
        .bind(custom_fields_json)
        .bind(lead.stage.as_str())
        .bind(lead.created_at.to_rfc3339())
        .bind(lead.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        Ok(())
    }
}

/// Empty strings are stored as NULL so the partial unique indexes only bind
/// real values.
fn normalized(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn lead_from_row(row: SqliteRow) -> Result<Lead, RepositoryError> {
    let stage_raw = row.try_get::<String, _>("stage")?;
    let stage = LeadStage::parse(&stage_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown lead stage `{stage_raw}`")))?;

    let tags_raw = row.try_get::<String, _>("tags_json")?;
    let tags = serde_json::from_str(&tags_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid tags_json: {error}")))?;

    let custom_fields_raw = row.try_get::<String, _>("custom_fields_json")?;
    let custom_fields = serde_json::from_str(&custom_fields_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid custom_fields_json: {error}")))?;

    Ok(Lead {
        id: LeadId(row.try_get("id")?),
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        subscriber_id: row.try_get("subscriber_id")?,
        tags,
        custom_fields,
        stage,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use motocrm_core::domain::lead::{Lead, LeadStage};

    use super::SqlLeadRepository;
    use crate::migrations;
    use crate::repositories::LeadRepository;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_lead() -> Lead {
        let mut lead = Lead::new("María González");
        lead.phone = Some("+543709876543".to_string());
        lead.email = Some("maria@example.com".to_string());
        lead.subscriber_id = Some("987654321".to_string());
        lead.add_tag("hot");
        lead.add_tag("financing");
        lead.set_custom_field("model", json!("XR 250"));
        lead.stage = LeadStage::Contacted;
        lead
    }

    #[tokio::test]
    async fn round_trips_a_lead_through_all_lookup_paths() {
        let pool = setup_pool().await;
        let repo = SqlLeadRepository::new(pool.clone());
        let lead = sample_lead();

        repo.save(lead.clone()).await.expect("save lead");

        let by_id = repo.find_by_id(&lead.id).await.expect("find by id");
        let by_subscriber =
            repo.find_by_subscriber_id("987654321").await.expect("find by subscriber");
        let by_phone = repo.find_by_phone("+543709876543").await.expect("find by phone");

        for found in [by_id, by_subscriber, by_phone] {
            let found = found.expect("lead present");
            assert_eq!(found.id, lead.id);
            assert_eq!(found.tags, vec!["hot", "financing"]);
            assert_eq!(found.custom_fields.get("model"), Some(&json!("XR 250")));
            assert_eq!(found.stage, LeadStage::Contacted);
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let pool = setup_pool().await;
        let repo = SqlLeadRepository::new(pool.clone());
        let mut lead = sample_lead();

        repo.save(lead.clone()).await.expect("initial save");
        lead.add_tag("test-ride");
        lead.stage = LeadStage::Qualified;
        repo.save(lead.clone()).await.expect("second save");

        let found = repo.find_by_id(&lead.id).await.expect("find").expect("present");
        assert_eq!(found.stage, LeadStage::Qualified);
        assert!(found.tags.contains(&"test-ride".to_string()));

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_subscriber_id_violates_unique_index() {
        let pool = setup_pool().await;
        let repo = SqlLeadRepository::new(pool.clone());

        let mut first = Lead::new("First");
        first.subscriber_id = Some("dup-1".to_string());
        let mut second = Lead::new("Second");
        second.subscriber_id = Some("dup-1".to_string());

        repo.save(first).await.expect("first save");
        let error = repo.save(second).await.expect_err("second save must fail");
        assert!(error.is_duplicate_key(), "expected duplicate key, got {error:?}");

        pool.close().await;
    }

    #[tokio::test]
    async fn empty_phone_stores_null_and_escapes_unique_index() {
        let pool = setup_pool().await;
        let repo = SqlLeadRepository::new(pool.clone());

        let mut first = Lead::new("NoPhone A");
        first.phone = Some("".to_string());
        let mut second = Lead::new("NoPhone B");
        second.phone = Some("  ".to_string());

        repo.save(first).await.expect("first save");
        repo.save(second).await.expect("second save should not collide");

        pool.close().await;
    }

    #[tokio::test]
    async fn lists_only_leads_with_subscriber_ids() {
        let pool = setup_pool().await;
        let repo = SqlLeadRepository::new(pool.clone());

        let with_subscriber = sample_lead();
        let mut without = Lead::new("Walk-in");
        without.phone = Some("+5437011111".to_string());

        repo.save(with_subscriber.clone()).await.expect("save first");
        repo.save(without).await.expect("save second");

        let candidates = repo.list_with_subscriber_id().await.expect("list");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, with_subscriber.id);

        pool.close().await;
    }
}
