use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use motocrm_core::domain::lead::LeadId;
use motocrm_core::domain::sync::{SyncKind, SyncRecord, SyncRecordId, SyncStatus};

use super::lead::parse_timestamp;
use super::{RepositoryError, SyncQueueRepository};
use crate::DbPool;

pub struct SqlSyncQueueRepository {
    pool: DbPool,
}

impl SqlSyncQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SYNC_COLUMNS: &str =
    "id, lead_id, kind, payload_json, status, attempt_count, last_error, created_at, updated_at";

#[async_trait::async_trait]
impl SyncQueueRepository for SqlSyncQueueRepository {
    async fn find_by_id(&self, id: &SyncRecordId) -> Result<Option<SyncRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {SYNC_COLUMNS} FROM sync_record WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from_sqlx)?;

        row.map(record_from_row).transpose()
    }

    async fn list_retryable(&self) -> Result<Vec<SyncRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SYNC_COLUMNS} FROM sync_record \
             WHERE status IN ('pending', 'failed') \
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn counts_by_status(&self) -> Result<HashMap<SyncStatus, i64>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM sync_record GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        let mut counts = HashMap::new();
        for row in rows {
            let status_raw = row.try_get::<String, _>("status")?;
            let status = SyncStatus::parse(&status_raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown sync status `{status_raw}`"))
            })?;
            counts.insert(status, row.try_get::<i64, _>("count")?);
        }

        Ok(counts)
    }

    async fn save(&self, record: SyncRecord) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(&record.payload)
            .map_err(|error| RepositoryError::Decode(format!("encode payload: {error}")))?;

        sqlx::query(
            "INSERT INTO sync_record (
                id, lead_id, kind, payload_json, status, attempt_count,
                last_error, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                lead_id = excluded.lead_id,
                kind = excluded.kind,
                payload_json = excluded.payload_json,
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(&record.id.0)
        .bind(&record.lead_id.0)
        .bind(record.kind.as_str())
        .bind(payload_json)
        .bind(record.status.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(record.last_error.as_deref())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        Ok(())
    }

    async fn purge_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM sync_record WHERE status = 'succeeded' AND updated_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from_sqlx)?;

        Ok(result.rows_affected())
    }
}

fn record_from_row(row: SqliteRow) -> Result<SyncRecord, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = SyncKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sync kind `{kind_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = SyncStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sync status `{status_raw}`")))?;

    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid payload_json: {error}")))?;

    let attempt_count_raw = row.try_get::<i64, _>("attempt_count")?;
    let attempt_count = u32::try_from(attempt_count_raw).map_err(|_| {
        RepositoryError::Decode(format!("invalid attempt_count: {attempt_count_raw}"))
    })?;

    Ok(SyncRecord {
        id: SyncRecordId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        kind,
        payload,
        status,
        attempt_count,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
