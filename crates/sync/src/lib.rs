//! Synchronization between the CRM and the messaging platform.
//!
//! Three pieces, layered over the repositories and the platform client:
//!
//! - [`EventProcessor`] applies canonical inbound events to CRM state,
//!   idempotently.
//! - [`SyncQueue`] pushes CRM-side changes (stage, tags, profile edits) out to
//!   the platform with bounded retries.
//! - [`BulkSyncOrchestrator`] backfills lead profiles from the platform as a
//!   cancellable background job.

pub mod bulk;
pub mod processor;
pub mod queue;

pub use bulk::{BulkError, BulkSyncOrchestrator, BulkSyncProgress, BulkSyncState, ProgressStore};
pub use processor::{EventProcessor, ProcessError, ProcessOutcome};
pub use queue::{DrainReport, QueueError, QueueStats, SyncQueue};
