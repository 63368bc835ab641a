//! In-memory job store for tests/dev.
//!
//! Every operation takes the write lock once and applies its conditional
//! update atomically, which gives the same exclusivity guarantees the
//! Postgres store gets from row locks.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use execq_core::{ExecutionLogEntry, ExecutionLogEntryId, RecordId};

use crate::clock::{Clock, SystemClock};

use super::store::{JobStore, JobStoreError};
use super::types::{
    CANCELED_FAILURE_MESSAGE, JobRecord, QueueStats, RecordState, ResetOutcome, StalledRecord, StoreOptions,
};

#[derive(Debug)]
struct Inner<P> {
    next_id: i64,
    records: BTreeMap<RecordId, JobRecord<P>>,
}

/// In-memory job store.
pub struct InMemoryJobStore<P> {
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner<P>>,
}

impl<P> std::fmt::Debug for InMemoryJobStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<P> InMemoryJobStore<P> {
    pub fn new(options: StoreOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            inner: RwLock::new(Inner {
                next_id: 1,
                records: BTreeMap::new(),
            }),
        }
    }

    pub fn arc(options: StoreOptions) -> Arc<Self> {
        Arc::new(Self::new(options))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner<P>>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Unavailable("in-memory job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner<P>>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Unavailable("in-memory job store lock poisoned".to_string()))
    }

    fn is_stale(&self, record: &JobRecord<P>, now: DateTime<Utc>) -> bool {
        match record.last_alive_at() {
            Some(alive) => now - alive > self.options.stalled_max_age_chrono(),
            None => false,
        }
    }

    /// Apply `f` to the record iff `worker_hostname` currently owns it.
    fn with_owned<R>(
        &self,
        id: RecordId,
        worker_hostname: &str,
        f: impl FnOnce(&mut JobRecord<P>, DateTime<Utc>) -> Option<R>,
    ) -> Result<Option<R>, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write()?;
        match inner.records.get_mut(&id) {
            Some(record) if record.is_owned_by(worker_hostname) => Ok(f(record, now)),
            _ => Ok(None),
        }
    }

    fn finish(
        &self,
        id: RecordId,
        worker_hostname: &str,
        state: RecordState,
        reason: Option<&str>,
    ) -> Result<bool, JobStoreError> {
        let done = self.with_owned(id, worker_hostname, |record, now| {
            record.state = state;
            record.finished_at = Some(now);
            record.worker_hostname = None;
            if let Some(reason) = reason {
                record.failure_message = Some(reason.to_string());
                record.num_failures += 1;
            }
            Some(())
        })?;
        Ok(done.is_some())
    }
}

impl<P> Default for InMemoryJobStore<P> {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

#[async_trait]
impl<P> JobStore<P> for InMemoryJobStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn options(&self) -> &StoreOptions {
        &self.options
    }

    async fn enqueue(&self, payload: P) -> Result<RecordId, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write()?;
        let id = RecordId::new(inner.next_id);
        if inner.records.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id));
        }
        inner.next_id += 1;
        inner.records.insert(id, JobRecord::queued(id, payload, now));
        Ok(id)
    }

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord<P>>, JobStoreError> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<JobRecord<P>>, JobStoreError> {
        let now = self.clock.now();
        let max_resets = self.options.max_num_resets;
        let mut inner = self.write()?;

        let candidate = inner
            .records
            .values()
            .filter(|r| !r.cancel)
            .filter(|r| match r.state {
                RecordState::Queued => r.process_after.is_none_or(|after| after <= now),
                RecordState::Processing => r.num_resets < max_resets && self.is_stale(r, now),
                _ => false,
            })
            .min_by_key(|r| (r.queued_at, r.id))
            .map(|r| r.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(None);
        };

        if record.state == RecordState::Processing {
            // Stale-lock takeover counts as a stall-recovery cycle.
            record.num_resets += 1;
        }
        record.state = RecordState::Processing;
        record.worker_hostname = Some(worker_hostname.to_string());
        record.started_at = Some(now);
        record.last_heartbeat_at = None;
        record.finished_at = None;
        record.failure_message = None;
        record.process_after = None;
        record.execution_logs.clear();

        Ok(Some(record.clone()))
    }

    async fn heartbeat(
        &self,
        worker_hostname: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write()?;
        let mut seen = HashSet::new();
        let mut known = Vec::new();

        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(record) = inner.records.get_mut(id) {
                if record.is_owned_by(worker_hostname) && !record.cancel {
                    record.last_heartbeat_at = Some(now);
                    known.push(*id);
                }
            }
        }

        Ok(known)
    }

    async fn requeue(
        &self,
        id: RecordId,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let done = self.with_owned(id, worker_hostname, |record, _now| {
            if record.cancel {
                return None;
            }
            record.state = RecordState::Queued;
            record.worker_hostname = None;
            record.started_at = None;
            record.last_heartbeat_at = None;
            record.process_after = Some(after);
            Some(())
        })?;
        Ok(done.is_some())
    }

    async fn add_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<Option<ExecutionLogEntryId>, JobStoreError> {
        self.with_owned(id, worker_hostname, |record, _now| {
            record.execution_logs.push(entry.clone());
            Some(ExecutionLogEntryId::new(record.execution_logs.len() as i64))
        })
    }

    async fn update_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry_id: ExecutionLogEntryId,
        entry: &ExecutionLogEntry,
    ) -> Result<bool, JobStoreError> {
        let done = self.with_owned(id, worker_hostname, |record, _now| {
            let index = usize::try_from(entry_id.get()).ok()?.checked_sub(1)?;
            let slot = record.execution_logs.get_mut(index)?;
            *slot = entry.clone();
            Some(())
        })?;
        Ok(done.is_some())
    }

    async fn mark_complete(&self, id: RecordId, worker_hostname: &str) -> Result<bool, JobStoreError> {
        self.finish(id, worker_hostname, RecordState::Completed, None)
    }

    async fn mark_errored(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        self.finish(id, worker_hostname, RecordState::Errored, Some(reason))
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        self.finish(id, worker_hostname, RecordState::Failed, Some(reason))
    }

    async fn cancel(&self, id: RecordId) -> Result<bool, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write()?;
        match inner.records.get_mut(&id) {
            Some(record) if !record.state.is_terminal() => {
                record.cancel = true;
                // Queued records have no executor to drop them.
                if record.state == RecordState::Queued {
                    record.state = RecordState::Failed;
                    record.finished_at = Some(now);
                    record.failure_message = Some(CANCELED_FAILURE_MESSAGE.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stalled(&self) -> Result<ResetOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut inner = self.write()?;
        let mut outcome = ResetOutcome::default();

        for record in inner.records.values_mut() {
            if record.state != RecordState::Processing || !self.is_stale(record, now) {
                continue;
            }
            let Some(alive) = record.last_alive_at() else {
                continue;
            };
            let stalled = StalledRecord {
                id: record.id,
                heartbeat_age: (now - alive).to_std().unwrap_or_default(),
            };

            record.worker_hostname = None;
            if record.cancel {
                record.state = RecordState::Failed;
                record.finished_at = Some(now);
                record.failure_message = Some(CANCELED_FAILURE_MESSAGE.to_string());
                outcome.canceled.push(stalled);
            } else if record.num_resets < self.options.max_num_resets {
                record.state = RecordState::Queued;
                record.num_resets += 1;
                record.started_at = None;
                record.last_heartbeat_at = None;
                outcome.reset.push(stalled);
            } else {
                record.state = RecordState::Errored;
                record.finished_at = Some(now);
                record.failure_message = Some(self.options.reset_failure_message.clone());
                outcome.errored.push(stalled);
            }
        }

        Ok(outcome)
    }

    async fn stats(&self) -> Result<QueueStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = QueueStats::default();
        for record in inner.records.values() {
            match record.state {
                RecordState::Queued => stats.queued += 1,
                RecordState::Processing => stats.processing += 1,
                RecordState::Completed => stats.completed += 1,
                RecordState::Errored => stats.errored += 1,
                RecordState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
