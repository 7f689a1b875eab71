use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use motocrm_core::domain::lead::LeadId;
use motocrm_core::domain::sync::{SyncKind, SyncRecord, SyncStatus};
use motocrm_db::repositories::{LeadRepository, RepositoryError, SyncQueueRepository};
use motocrm_platform::{PlatformClient, SubscriberUpdate};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub succeeded: i64,
    pub failed: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records already at the attempt cap, left untouched for manual review.
    pub skipped: usize,
}

/// Pushes CRM-side changes out to the platform.
///
/// Enqueueing persists the record first and then makes one immediate attempt;
/// failures stay queued and are only re-attempted by [`SyncQueue::drain`].
/// A platform outage therefore never blocks the calling request path beyond
/// that single attempt.
pub struct SyncQueue {
    records: Arc<dyn SyncQueueRepository>,
    leads: Arc<dyn LeadRepository>,
    platform: Arc<dyn PlatformClient>,
    max_attempts: u32,
    drain_delay: Duration,
}

impl SyncQueue {
    pub fn new(
        records: Arc<dyn SyncQueueRepository>,
        leads: Arc<dyn LeadRepository>,
        platform: Arc<dyn PlatformClient>,
        max_attempts: u32,
        drain_delay: Duration,
    ) -> Self {
        Self { records, leads, platform, max_attempts, drain_delay }
    }

    /// Persists a sync record and makes one immediate delivery attempt.
    pub async fn enqueue(
        &self,
        lead_id: LeadId,
        kind: SyncKind,
        payload: Value,
    ) -> Result<SyncRecord, QueueError> {
        let mut record = SyncRecord::new(lead_id, kind, payload);
        self.records.save(record.clone()).await?;

        self.attempt(&mut record).await?;
        Ok(record)
    }

    /// Re-attempts every pending and failed record, oldest first.
    ///
    /// Per-record failures are isolated; one bad record never stops the rest
    /// of the pass.
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let retryable = self.records.list_retryable().await?;
        let mut report = DrainReport::default();

        for (index, mut record) in retryable.into_iter().enumerate() {
            if record.attempt_count >= self.max_attempts {
                debug!(
                    record_id = %record.id.0,
                    attempts = record.attempt_count,
                    "attempt cap reached, skipping"
                );
                report.skipped += 1;
                continue;
            }

            if index > 0 && !self.drain_delay.is_zero() {
                tokio::time::sleep(self.drain_delay).await;
            }

            report.processed += 1;
            self.attempt(&mut record).await?;
            match record.status {
                SyncStatus::Succeeded => report.succeeded += 1,
                _ => report.failed += 1,
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            event_name = "sync.queue.drained",
            "queue drain finished"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.records.counts_by_status().await?;
        Ok(QueueStats {
            pending: counts.get(&SyncStatus::Pending).copied().unwrap_or(0),
            succeeded: counts.get(&SyncStatus::Succeeded).copied().unwrap_or(0),
            failed: counts.get(&SyncStatus::Failed).copied().unwrap_or(0),
        })
    }

    pub async fn purge_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        Ok(self.records.purge_completed_before(cutoff).await?)
    }

    async fn attempt(&self, record: &mut SyncRecord) -> Result<(), QueueError> {
        match self.dispatch(record).await {
            Ok(()) => record.mark_succeeded(),
            Err(reason) => {
                warn!(
                    record_id = %record.id.0,
                    kind = record.kind.as_str(),
                    attempt = record.attempt_count + 1,
                    error = %reason,
                    event_name = "sync.queue.attempt_failed",
                    "sync attempt failed"
                );
                record.mark_failed(reason);
            }
        }
        self.records.save(record.clone()).await?;
        Ok(())
    }

    /// Delivery failures come back as strings; they are queue state, not
    /// control flow.
    async fn dispatch(&self, record: &SyncRecord) -> Result<(), String> {
        let lead = self
            .leads
            .find_by_id(&record.lead_id)
            .await
            .map_err(|error| format!("lead lookup failed: {error}"))?
            .ok_or_else(|| format!("lead {} not found", record.lead_id.0))?;
        let subscriber_id = lead
            .subscriber_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("lead {} has no platform subscriber", lead.id.0))?;

        match record.kind {
            SyncKind::StageChange => {
                let stage = payload_str(&record.payload, "stage")
                    .ok_or_else(|| "stage_change payload missing `stage`".to_string())?;
                self.platform
                    .set_custom_field(subscriber_id, "lead_stage", &Value::String(stage.clone()))
                    .await
                    .map_err(|error| error.to_string())?;
                // The stage is mirrored as a tag so platform automations can
                // segment on it.
                if let Some(previous) = payload_str(&record.payload, "previous_stage") {
                    self.platform
                        .remove_tag(subscriber_id, &format!("stage:{previous}"))
                        .await
                        .map_err(|error| error.to_string())?;
                }
                self.platform
                    .add_tag(subscriber_id, &format!("stage:{stage}"))
                    .await
                    .map_err(|error| error.to_string())
            }
            SyncKind::TagChange => {
                let tag = payload_str(&record.payload, "tag")
                    .ok_or_else(|| "tag_change payload missing `tag`".to_string())?;
                let action =
                    payload_str(&record.payload, "action").unwrap_or_else(|| "add".to_string());
                match action.as_str() {
                    "add" => self
                        .platform
                        .add_tag(subscriber_id, &tag)
                        .await
                        .map_err(|error| error.to_string()),
                    "remove" => self
                        .platform
                        .remove_tag(subscriber_id, &tag)
                        .await
                        .map_err(|error| error.to_string()),
                    other => Err(format!("unknown tag action `{other}`")),
                }
            }
            SyncKind::ProfileUpdate => {
                let update = SubscriberUpdate {
                    name: payload_str(&record.payload, "name"),
                    phone: payload_str(&record.payload, "phone"),
                    email: payload_str(&record.payload, "email"),
                };
                self.platform
                    .update_subscriber(subscriber_id, update)
                    .await
                    .map_err(|error| error.to_string())
            }
        }
    }
}

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use motocrm_core::domain::lead::Lead;
    use motocrm_core::domain::sync::{SyncKind, SyncStatus};
    use motocrm_db::repositories::{
        InMemoryLeadRepository, InMemorySyncQueueRepository, LeadRepository, SyncQueueRepository,
    };
    use motocrm_platform::fake::RecordedCall;
    use motocrm_platform::FakePlatformClient;

    use super::SyncQueue;

    struct Fixture {
        records: Arc<InMemorySyncQueueRepository>,
        platform: Arc<FakePlatformClient>,
        queue: SyncQueue,
        lead: Lead,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let records = Arc::new(InMemorySyncQueueRepository::new());
        let leads = Arc::new(InMemoryLeadRepository::new());
        let platform = Arc::new(FakePlatformClient::new());

        let mut lead = Lead::new("María");
        lead.subscriber_id = Some("987654321".to_string());
        leads.save(lead.clone()).await.expect("seed lead");

        let queue = SyncQueue::new(
            records.clone() as Arc<dyn SyncQueueRepository>,
            leads.clone() as Arc<dyn LeadRepository>,
            platform.clone(),
            max_attempts,
            Duration::ZERO,
        );
        Fixture { records, platform, queue, lead }
    }

    #[tokio::test]
    async fn enqueue_attempts_immediately() {
        let fx = fixture(5).await;

        let record = fx
            .queue
            .enqueue(
                fx.lead.id.clone(),
                SyncKind::TagChange,
                json!({"tag": "hot", "action": "add"}),
            )
            .await
            .expect("enqueue");

        assert_eq!(record.status, SyncStatus::Succeeded);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(
            fx.platform.calls(),
            vec![RecordedCall::AddTag {
                subscriber_id: "987654321".to_string(),
                tag: "hot".to_string()
            }]
        );

        let stored = fx.records.find_by_id(&record.id).await.expect("find").expect("present");
        assert_eq!(stored.status, SyncStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_record_recovers_on_drain() {
        let fx = fixture(5).await;
        fx.platform.fail_next("platform down");

        let record = fx
            .queue
            .enqueue(fx.lead.id.clone(), SyncKind::TagChange, json!({"tag": "hot"}))
            .await
            .expect("enqueue");
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.last_error.as_deref().map(|e| e.contains("platform down")), Some(true));

        let report = fx.queue.drain().await.expect("drain");
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);

        let stored = fx.records.find_by_id(&record.id).await.expect("find").expect("present");
        assert_eq!(stored.status, SyncStatus::Succeeded);
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn drain_skips_records_at_the_attempt_cap() {
        let fx = fixture(2).await;
        fx.platform.fail_always("still down");

        let record = fx
            .queue
            .enqueue(fx.lead.id.clone(), SyncKind::TagChange, json!({"tag": "hot"}))
            .await
            .expect("enqueue");
        let report = fx.queue.drain().await.expect("second attempt");
        assert_eq!(report.failed, 1);

        // Two attempts made, cap is two: the next drain must not touch it.
        let report = fx.queue.drain().await.expect("capped drain");
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);

        let stored = fx.records.find_by_id(&record.id).await.expect("find").expect("present");
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn one_bad_record_does_not_stop_the_pass() {
        let fx = fixture(5).await;

        fx.platform.fail_next("flaky");
        let failed = fx
            .queue
            .enqueue(fx.lead.id.clone(), SyncKind::TagChange, json!({"tag": "a"}))
            .await
            .expect("enqueue failed record");
        let ok = fx
            .queue
            .enqueue(fx.lead.id.clone(), SyncKind::TagChange, json!({"tag": "b"}))
            .await
            .expect("enqueue ok record");
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(ok.status, SyncStatus::Succeeded);

        fx.platform.fail_subscriber("987654321");
        let report = fx.queue.drain().await.expect("drain");
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        fx.platform.heal();

        let report = fx.queue.drain().await.expect("healed drain");
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn stage_change_sets_field_and_mirrors_tag() {
        let fx = fixture(5).await;

        let record = fx
            .queue
            .enqueue(
                fx.lead.id.clone(),
                SyncKind::StageChange,
                json!({"stage": "qualified", "previous_stage": "contacted"}),
            )
            .await
            .expect("enqueue");
        assert_eq!(record.status, SyncStatus::Succeeded);

        let calls = fx.platform.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(
            &calls[0],
            RecordedCall::SetCustomField { field, .. } if field == "lead_stage"
        ));
        assert!(matches!(
            &calls[1],
            RecordedCall::RemoveTag { tag, .. } if tag == "stage:contacted"
        ));
        assert!(matches!(
            &calls[2],
            RecordedCall::AddTag { tag, .. } if tag == "stage:qualified"
        ));
    }

    #[tokio::test]
    async fn lead_without_subscriber_fails_the_record() {
        let records = Arc::new(InMemorySyncQueueRepository::new());
        let leads = Arc::new(InMemoryLeadRepository::new());
        let platform = Arc::new(FakePlatformClient::new());

        let lead = Lead::new("Walk-in");
        leads.save(lead.clone()).await.expect("seed lead");

        let queue = SyncQueue::new(
            records as Arc<dyn SyncQueueRepository>,
            leads as Arc<dyn LeadRepository>,
            platform.clone(),
            5,
            Duration::ZERO,
        );

        let record = queue
            .enqueue(lead.id, SyncKind::TagChange, json!({"tag": "hot"}))
            .await
            .expect("enqueue");
        assert_eq!(record.status, SyncStatus::Failed);
        assert!(record.last_error.expect("error").contains("no platform subscriber"));
        assert_eq!(platform.call_count(), 0);
    }

    #[tokio::test]
    async fn stats_reflect_queue_state() {
        let fx = fixture(5).await;

        fx.queue
            .enqueue(fx.lead.id.clone(), SyncKind::TagChange, json!({"tag": "ok"}))
            .await
            .expect("succeeded record");
        fx.platform.fail_always("down");
        fx.queue
            .enqueue(fx.lead.id.clone(), SyncKind::TagChange, json!({"tag": "bad"}))
            .await
            .expect("failed record");

        let stats = fx.queue.stats().await.expect("stats");
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }
}
