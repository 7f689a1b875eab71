use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use motocrm_db::repositories::{LeadRepository, RepositoryError};
use motocrm_platform::PlatformClient;

#[derive(Debug, Error)]
pub enum BulkError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkSyncState {
    Running,
    Completed,
    Cancelled,
}

impl BulkSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BulkSyncProgress {
    pub sync_id: String,
    pub state: BulkSyncState,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Leads whose profile actually changed after the merge; a successful
    /// lookup that changes nothing counts as succeeded but not updated.
    pub updated: usize,
    /// First N error messages; the rest only bump `failed`.
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    progress: BulkSyncProgress,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// In-memory registry of bulk sync jobs.
///
/// Finished jobs linger for the retention window so a client can still poll
/// the final state, then get evicted lazily on the next store access.
pub struct ProgressStore {
    jobs: Mutex<HashMap<String, JobEntry>>,
    retention: Duration,
    max_recorded_errors: usize,
}

impl ProgressStore {
    pub fn new(retention: Duration, max_recorded_errors: usize) -> Self {
        Self { jobs: Mutex::new(HashMap::new()), retention, max_recorded_errors }
    }

    pub fn progress(&self, sync_id: &str) -> Option<BulkSyncProgress> {
        let mut jobs = self.jobs.lock().expect("progress store lock");
        Self::evict_expired(&mut jobs, self.retention);
        jobs.get(sync_id).map(|entry| entry.progress.clone())
    }

    /// Flags the job for cancellation. Returns false for unknown jobs and for
    /// jobs that already finished.
    pub fn cancel(&self, sync_id: &str) -> bool {
        let jobs = self.jobs.lock().expect("progress store lock");
        match jobs.get(sync_id) {
            Some(entry) if !entry.progress.state.is_finished() => {
                entry.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn register(&self, progress: BulkSyncProgress, cancel: Arc<AtomicBool>) {
        let mut jobs = self.jobs.lock().expect("progress store lock");
        Self::evict_expired(&mut jobs, self.retention);
        jobs.insert(
            progress.sync_id.clone(),
            JobEntry { progress, cancel, handle: None },
        );
    }

    fn attach_handle(&self, sync_id: &str, handle: JoinHandle<()>) {
        let mut jobs = self.jobs.lock().expect("progress store lock");
        if let Some(entry) = jobs.get_mut(sync_id) {
            entry.handle = Some(handle);
        }
    }

    fn record_item(&self, sync_id: &str, changed: bool, error: Option<String>) {
        let mut jobs = self.jobs.lock().expect("progress store lock");
        let Some(entry) = jobs.get_mut(sync_id) else { return };
        entry.progress.processed += 1;
        if changed {
            entry.progress.updated += 1;
        }
        match error {
            None => entry.progress.succeeded += 1,
            Some(error) => {
                entry.progress.failed += 1;
                if entry.progress.errors.len() < self.max_recorded_errors {
                    entry.progress.errors.push(error);
                }
            }
        }
    }

    fn finish(&self, sync_id: &str, state: BulkSyncState) {
        let mut jobs = self.jobs.lock().expect("progress store lock");
        if let Some(entry) = jobs.get_mut(sync_id) {
            entry.progress.state = state;
            entry.progress.finished_at = Some(Utc::now());
        }
    }

    fn take_handle(&self, sync_id: &str) -> Option<JoinHandle<()>> {
        let mut jobs = self.jobs.lock().expect("progress store lock");
        jobs.get_mut(sync_id).and_then(|entry| entry.handle.take())
    }

    fn evict_expired(jobs: &mut HashMap<String, JobEntry>, retention: Duration) {
        let now = Utc::now();
        jobs.retain(|_, entry| match entry.progress.finished_at {
            Some(finished_at) => {
                let age = now.signed_duration_since(finished_at);
                age.to_std().map_or(true, |age| age < retention)
            }
            None => true,
        });
    }
}

/// Backfills lead profiles from the platform as a background job.
///
/// Only one snapshot of candidate leads is taken at start; leads created
/// while the job runs are picked up by the next run.
pub struct BulkSyncOrchestrator {
    leads: Arc<dyn LeadRepository>,
    platform: Arc<dyn PlatformClient>,
    store: Arc<ProgressStore>,
    item_delay: Duration,
}

impl BulkSyncOrchestrator {
    pub fn new(
        leads: Arc<dyn LeadRepository>,
        platform: Arc<dyn PlatformClient>,
        store: Arc<ProgressStore>,
        item_delay: Duration,
    ) -> Self {
        Self { leads, platform, store, item_delay }
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    /// Snapshots the candidate leads and spawns the background pass.
    pub async fn start(&self) -> Result<String, BulkError> {
        let candidates = self.leads.list_with_subscriber_id().await?;
        let sync_id = format!("BS-{}", Uuid::new_v4().simple());
        let cancel = Arc::new(AtomicBool::new(false));

        self.store.register(
            BulkSyncProgress {
                sync_id: sync_id.clone(),
                state: BulkSyncState::Running,
                total: candidates.len(),
                processed: 0,
                succeeded: 0,
                failed: 0,
                updated: 0,
                errors: Vec::new(),
                started_at: Utc::now(),
                finished_at: None,
            },
            cancel.clone(),
        );
        info!(
            sync_id = %sync_id,
            total = candidates.len(),
            event_name = "sync.bulk.started",
            "bulk sync started"
        );

        let leads = self.leads.clone();
        let platform = self.platform.clone();
        let store = self.store.clone();
        let item_delay = self.item_delay;
        let task_id = sync_id.clone();

        let handle = tokio::spawn(async move {
            let mut cancelled = false;
            for (index, mut lead) in candidates.into_iter().enumerate() {
                if cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    break;
                }
                if index > 0 && !item_delay.is_zero() {
                    tokio::time::sleep(item_delay).await;
                }

                let subscriber_id = match lead.subscriber_id.clone() {
                    Some(id) => id,
                    None => continue,
                };
                let (changed, error) = match platform.find_subscriber(&subscriber_id).await {
                    Ok(Some(profile)) => {
                        let changed = lead.merge_subscriber(&profile);
                        if changed {
                            match leads.save(lead.clone()).await {
                                Ok(()) => (true, None),
                                Err(error) => (
                                    false,
                                    Some(format!("lead {}: save failed: {error}", lead.id.0)),
                                ),
                            }
                        } else {
                            (false, None)
                        }
                    }
                    Ok(None) => (
                        false,
                        Some(format!("subscriber {subscriber_id} not found on platform")),
                    ),
                    Err(error) => {
                        (false, Some(format!("subscriber {subscriber_id}: {error}")))
                    }
                };
                if let Some(message) = &error {
                    warn!(sync_id = %task_id, error = %message, "bulk sync item failed");
                }
                store.record_item(&task_id, changed, error);
            }

            let state =
                if cancelled { BulkSyncState::Cancelled } else { BulkSyncState::Completed };
            store.finish(&task_id, state);
            info!(
                sync_id = %task_id,
                state = state.as_str(),
                event_name = "sync.bulk.finished",
                "bulk sync finished"
            );
        });
        self.store.attach_handle(&sync_id, handle);

        Ok(sync_id)
    }

    pub fn progress(&self, sync_id: &str) -> Option<BulkSyncProgress> {
        self.store.progress(sync_id)
    }

    pub fn cancel(&self, sync_id: &str) -> bool {
        self.store.cancel(sync_id)
    }

    /// Blocks until the background task exits. Test hook; the server never
    /// awaits a job.
    pub async fn wait(&self, sync_id: &str) {
        if let Some(handle) = self.store.take_handle(sync_id) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use motocrm_core::domain::lead::Lead;
    use motocrm_core::event::SubscriberPayload;
    use motocrm_db::repositories::{InMemoryLeadRepository, LeadRepository};
    use motocrm_platform::FakePlatformClient;

    use super::{BulkSyncOrchestrator, BulkSyncState, ProgressStore};

    fn orchestrator(
        leads: Arc<InMemoryLeadRepository>,
        platform: Arc<FakePlatformClient>,
        item_delay: Duration,
    ) -> BulkSyncOrchestrator {
        BulkSyncOrchestrator::new(
            leads as Arc<dyn LeadRepository>,
            platform,
            Arc::new(ProgressStore::new(Duration::from_secs(3600), 25)),
            item_delay,
        )
    }

    async fn seed_lead(leads: &InMemoryLeadRepository, subscriber_id: &str) -> Lead {
        let mut lead = Lead::new("Unknown");
        lead.subscriber_id = Some(subscriber_id.to_string());
        leads.save(lead.clone()).await.expect("seed lead");
        lead
    }

    #[tokio::test]
    async fn backfills_profiles_from_the_platform() {
        let leads = Arc::new(InMemoryLeadRepository::new());
        let platform = Arc::new(FakePlatformClient::new());

        let lead = seed_lead(&leads, "987").await;
        platform.insert_subscriber(SubscriberPayload {
            id: Some("987".to_string()),
            name: Some("María González".to_string()),
            phone: Some("+5437099".to_string()),
            ..Default::default()
        });

        let orchestrator = orchestrator(leads.clone(), platform, Duration::ZERO);
        let sync_id = orchestrator.start().await.expect("start");
        orchestrator.wait(&sync_id).await;

        let progress = orchestrator.progress(&sync_id).expect("progress");
        assert_eq!(progress.state, BulkSyncState::Completed);
        assert_eq!(progress.total, 1);
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, 0);
        assert_eq!(progress.updated, 1);

        let stored = leads.find_by_id(&lead.id).await.expect("find").expect("present");
        assert_eq!(stored.name, "María González");
        assert_eq!(stored.phone.as_deref(), Some("+5437099"));
    }

    #[tokio::test]
    async fn missing_subscriber_is_an_error_but_the_run_completes() {
        let leads = Arc::new(InMemoryLeadRepository::new());
        let platform = Arc::new(FakePlatformClient::new());

        seed_lead(&leads, "gone").await;
        seed_lead(&leads, "987").await;
        seed_lead(&leads, "988").await;
        platform.insert_subscriber(SubscriberPayload {
            id: Some("987".to_string()),
            name: Some("María".to_string()),
            ..Default::default()
        });
        platform.insert_subscriber(SubscriberPayload {
            id: Some("988".to_string()),
            name: Some("Carlos".to_string()),
            ..Default::default()
        });

        let orchestrator = orchestrator(leads, platform, Duration::ZERO);
        let sync_id = orchestrator.start().await.expect("start");
        orchestrator.wait(&sync_id).await;

        let progress = orchestrator.progress(&sync_id).expect("progress");
        assert_eq!(progress.state, BulkSyncState::Completed);
        assert_eq!(progress.processed, 3);
        assert_eq!(progress.succeeded, 2);
        assert_eq!(progress.failed, 1);
        assert!(progress.errors[0].contains("not found"));
    }

    #[tokio::test]
    async fn cancellation_stops_between_items() {
        let leads = Arc::new(InMemoryLeadRepository::new());
        let platform = Arc::new(FakePlatformClient::new());

        for index in 0..50 {
            seed_lead(&leads, &format!("sub-{index}")).await;
        }

        let orchestrator = orchestrator(leads, platform, Duration::from_millis(20));
        let sync_id = orchestrator.start().await.expect("start");
        assert!(orchestrator.cancel(&sync_id));
        orchestrator.wait(&sync_id).await;

        let progress = orchestrator.progress(&sync_id).expect("progress");
        assert_eq!(progress.state, BulkSyncState::Cancelled);
        assert!(progress.processed < progress.total);
        assert!(progress.finished_at.is_some());

        // A finished job cannot be cancelled again.
        assert!(!orchestrator.cancel(&sync_id));
    }

    #[tokio::test]
    async fn unknown_job_has_no_progress() {
        let leads = Arc::new(InMemoryLeadRepository::new());
        let platform = Arc::new(FakePlatformClient::new());
        let orchestrator = orchestrator(leads, platform, Duration::ZERO);

        assert!(orchestrator.progress("BS-missing").is_none());
        assert!(!orchestrator.cancel("BS-missing"));
    }
}
