use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRecordId(pub String);

impl SyncRecordId {
    pub fn generate() -> Self {
        Self(format!("SY-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    StageChange,
    TagChange,
    ProfileUpdate,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageChange => "stage_change",
            Self::TagChange => "tag_change",
            Self::ProfileUpdate => "profile_update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stage_change" => Some(Self::StageChange),
            "tag_change" => Some(Self::TagChange),
            "profile_update" => Some(Self::ProfileUpdate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Succeeded,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One outbound (CRM → platform) synchronization attempt.
///
/// Lifecycle: `pending → succeeded`, or `pending → failed → … → succeeded`
/// where re-attempts happen only through the queue drain. Records are kept as
/// an audit trail; only the retention purge removes old completed ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: SyncRecordId,
    pub lead_id: LeadId,
    pub kind: SyncKind,
    pub payload: Value,
    pub status: SyncStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(lead_id: LeadId, kind: SyncKind, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: SyncRecordId::generate(),
            lead_id,
            kind,
            payload,
            status: SyncStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_succeeded(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.status = SyncStatus::Succeeded;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.status = SyncStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.status, SyncStatus::Pending | SyncStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::domain::lead::LeadId;

    use super::{SyncKind, SyncRecord, SyncStatus};

    #[test]
    fn fail_then_succeed_accumulates_attempts() {
        let mut record = SyncRecord::new(
            LeadId("LD-1".to_string()),
            SyncKind::StageChange,
            json!({"stage": "qualified"}),
        );
        assert_eq!(record.status, SyncStatus::Pending);

        record.mark_failed("platform timeout");
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.attempt_count, 1);
        assert!(record.is_retryable());

        record.mark_succeeded();
        assert_eq!(record.status, SyncStatus::Succeeded);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.last_error, None);
        assert!(!record.is_retryable());
    }
}
