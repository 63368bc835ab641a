//! Job store abstraction.
//!
//! The store owns every job record and is the only place exclusivity is
//! enforced. Each mutating operation is a single conditional update keyed on
//! the record's current `state` and `worker_hostname`; callers never hold a
//! lock across calls. A losing racer sees `false` / `None`, never an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use execq_core::{ExecutionLogEntry, ExecutionLogEntryId, RecordId};

use super::types::{JobRecord, QueueStats, ResetOutcome, StoreOptions};

/// Job store abstraction over one logical queue of payload type `P`.
#[async_trait]
pub trait JobStore<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Policy this store was configured with.
    fn options(&self) -> &StoreOptions;

    /// Insert a new queued record.
    async fn enqueue(&self, payload: P) -> Result<RecordId, JobStoreError>;

    /// Read a record by id.
    async fn get(&self, id: RecordId) -> Result<Option<JobRecord<P>>, JobStoreError>;

    /// Claim the oldest eligible record for `worker_hostname`.
    ///
    /// Eligible: queued (not cancelled, `process_after` reached), or processing
    /// with a stale heartbeat and resets left. Returns `None` if nothing is
    /// eligible. Two concurrent calls never return the same record.
    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<JobRecord<P>>, JobStoreError>;

    /// Refresh liveness for the subset of `ids` still owned by `worker_hostname`
    /// and not cancelled. Returns exactly that subset.
    async fn heartbeat(
        &self,
        worker_hostname: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>, JobStoreError>;

    /// Return an owned, uncancelled processing record to the queue, not
    /// eligible before `after`.
    async fn requeue(
        &self,
        id: RecordId,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Append a log entry to an owned processing record.
    ///
    /// Returns `None` when the ownership/state gate fails.
    async fn add_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<Option<ExecutionLogEntryId>, JobStoreError>;

    /// Replace an existing log entry on an owned processing record.
    async fn update_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry_id: ExecutionLogEntryId,
        entry: &ExecutionLogEntry,
    ) -> Result<bool, JobStoreError>;

    async fn mark_complete(&self, id: RecordId, worker_hostname: &str) -> Result<bool, JobStoreError>;

    async fn mark_errored(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError>;

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError>;

    /// Flag a non-terminal record for cooperative cancellation.
    ///
    /// A queued record fails immediately. A processing record keeps running
    /// until its executor drops it or it stalls.
    async fn cancel(&self, id: RecordId) -> Result<bool, JobStoreError>;

    /// Requeue or error every processing record whose heartbeat is older than
    /// the stall threshold. Stalled cancelled records fail without using a reset.
    async fn reset_stalled(&self) -> Result<ResetOutcome, JobStoreError>;

    async fn stats(&self) -> Result<QueueStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    /// The backing store could not be reached; no state change occurred.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("record payload serialization failed: {0}")]
    Serialization(String),
    #[error("job already exists: {0}")]
    AlreadyExists(RecordId),
}

impl JobStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

#[async_trait]
impl<P, T> JobStore<P> for Arc<T>
where
    P: Send + Sync + 'static,
    T: JobStore<P> + ?Sized,
{
    fn options(&self) -> &StoreOptions {
        (**self).options()
    }

    async fn enqueue(&self, payload: P) -> Result<RecordId, JobStoreError> {
        (**self).enqueue(payload).await
    }

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord<P>>, JobStoreError> {
        (**self).get(id).await
    }

    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<JobRecord<P>>, JobStoreError> {
        (**self).dequeue(worker_hostname).await
    }

    async fn heartbeat(
        &self,
        worker_hostname: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>, JobStoreError> {
        (**self).heartbeat(worker_hostname, ids).await
    }

    async fn requeue(
        &self,
        id: RecordId,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).requeue(id, worker_hostname, after).await
    }

    async fn add_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<Option<ExecutionLogEntryId>, JobStoreError> {
        (**self).add_execution_log_entry(id, worker_hostname, entry).await
    }

    async fn update_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry_id: ExecutionLogEntryId,
        entry: &ExecutionLogEntry,
    ) -> Result<bool, JobStoreError> {
        (**self)
            .update_execution_log_entry(id, worker_hostname, entry_id, entry)
            .await
    }

    async fn mark_complete(&self, id: RecordId, worker_hostname: &str) -> Result<bool, JobStoreError> {
        (**self).mark_complete(id, worker_hostname).await
    }

    async fn mark_errored(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        (**self).mark_errored(id, worker_hostname, reason).await
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        (**self).mark_failed(id, worker_hostname, reason).await
    }

    async fn cancel(&self, id: RecordId) -> Result<bool, JobStoreError> {
        (**self).cancel(id).await
    }

    async fn reset_stalled(&self) -> Result<ResetOutcome, JobStoreError> {
        (**self).reset_stalled().await
    }

    async fn stats(&self) -> Result<QueueStats, JobStoreError> {
        (**self).stats().await
    }
}
