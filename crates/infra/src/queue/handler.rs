//! Server side of the executor ↔ queue exchange.
//!
//! A [`QueueHandler`] is stateless: it holds no locks and may be invoked
//! concurrently without limit. Every mutating call carries the caller's
//! claimed identity and the store only applies it if that identity still owns
//! the record, so a zombie executor cannot touch work reassigned elsewhere.
//! Store failures propagate immediately; nothing here retries.

use std::sync::Arc;

use tracing::{debug, info, warn};

use execq_core::{
    ExecutionLogEntry, ExecutionLogEntryId, Job, ProtocolError, RecordId, max_supported_version,
};

use crate::executors::{ExecutorHeartbeat, ExecutorRegistry};
use crate::jobs::{JobRecord, JobStore, JobStoreError, QueueStats};

use super::adapter::{RecordTransformer, ResourceMetadata, TransformContext};
use super::heartbeat::{HeartbeatOutcome, reconcile};

/// Queue handler error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("worker hostname cannot be empty")]
    InvalidExecutorName,
    /// The record does not exist, is not processing, or is owned by someone else.
    #[error("unknown job {0}")]
    UnknownJob(RecordId),
    /// The record was dequeued but could not become a job; it has been marked failed.
    #[error("failed to transform record {id}: {reason}")]
    Transform { id: RecordId, reason: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// A dequeue request.
#[derive(Debug, Clone, Default)]
pub struct DequeueParams {
    pub executor_name: String,
    /// Executor-advertised version; selects the newest job shape it parses.
    pub version: Option<String>,
    pub resources: ResourceMetadata,
}

/// One logical queue's protocol handler.
pub struct QueueHandler<S, T> {
    name: String,
    store: S,
    transformer: T,
    registry: Arc<dyn ExecutorRegistry>,
}

impl<S, T> QueueHandler<S, T>
where
    T: RecordTransformer,
    S: JobStore<T::Record>,
{
    pub fn new(
        name: impl Into<String>,
        store: S,
        transformer: T,
        registry: Arc<dyn ExecutorRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            transformer,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim the next job for `params.executor_name`.
    ///
    /// `Ok(None)` means nothing is queued. A record that cannot be transformed
    /// (or cannot be expressed in a shape the executor parses) is marked failed
    /// before the error is returned.
    pub async fn dequeue(&self, params: DequeueParams) -> Result<Option<Job>, QueueError> {
        let executor = validate_executor_name(&params.executor_name)?;
        let max_version = max_supported_version(params.version.as_deref())?;

        let Some(record) = self.store.dequeue(executor).await? else {
            return Ok(None);
        };

        let ctx = TransformContext {
            max_version,
            resources: params.resources,
        };
        let job = self
            .transformer
            .transform(&record, &ctx)
            .map_err(|e| e.to_string())
            .and_then(|spec| Job::negotiate(spec, max_version).map_err(|e| e.to_string()));

        match job {
            Ok(job) => {
                info!(
                    queue = %self.name,
                    job_id = %record.id,
                    executor = %executor,
                    version = %job.version(),
                    "dequeued job"
                );
                Ok(Some(job))
            }
            Err(err) => {
                let reason = format!("failed to transform record: {err}");
                warn!(queue = %self.name, job_id = %record.id, error = %err, "marking untransformable record failed");

                if !self.store.mark_failed(record.id, executor, &reason).await? {
                    warn!(queue = %self.name, job_id = %record.id, "record changed hands before it could be marked failed");
                }
                Err(QueueError::Transform {
                    id: record.id,
                    reason: err,
                })
            }
        }
    }

    /// Confirm liveness for the jobs the executor claims and tell it which to drop.
    pub async fn heartbeat(
        &self,
        executor: ExecutorHeartbeat,
        version: Option<&str>,
        claimed: &[RecordId],
    ) -> Result<HeartbeatOutcome, QueueError> {
        let name = validate_executor_name(&executor.hostname)?.to_string();
        max_supported_version(version)?;

        let executor = ExecutorHeartbeat {
            hostname: name.clone(),
            ..executor
        };
        if let Err(err) = self.registry.upsert_heartbeat(&executor).await {
            warn!(queue = %self.name, executor = %name, error = %err, "failed to upsert executor heartbeat");
        }

        let known = self.store.heartbeat(&name, claimed).await?;
        let outcome = reconcile(claimed, &known);

        if !outcome.cancel_ids.is_empty() {
            debug!(
                queue = %self.name,
                executor = %name,
                cancel = ?outcome.cancel_ids,
                "executor holds jobs it no longer owns"
            );
        }
        Ok(outcome)
    }

    pub async fn add_execution_log_entry(
        &self,
        executor_name: &str,
        id: RecordId,
        entry: &ExecutionLogEntry,
    ) -> Result<ExecutionLogEntryId, QueueError> {
        let executor = validate_executor_name(executor_name)?;
        self.store
            .add_execution_log_entry(id, executor, entry)
            .await?
            .ok_or(QueueError::UnknownJob(id))
    }

    pub async fn update_execution_log_entry(
        &self,
        executor_name: &str,
        id: RecordId,
        entry_id: ExecutionLogEntryId,
        entry: &ExecutionLogEntry,
    ) -> Result<(), QueueError> {
        let executor = validate_executor_name(executor_name)?;
        if !self
            .store
            .update_execution_log_entry(id, executor, entry_id, entry)
            .await?
        {
            return Err(QueueError::UnknownJob(id));
        }
        Ok(())
    }

    pub async fn mark_complete(&self, executor_name: &str, id: RecordId) -> Result<(), QueueError> {
        let executor = validate_executor_name(executor_name)?;
        if !self.store.mark_complete(id, executor).await? {
            return Err(QueueError::UnknownJob(id));
        }
        info!(queue = %self.name, job_id = %id, executor = %executor, "job completed");
        Ok(())
    }

    pub async fn mark_errored(
        &self,
        executor_name: &str,
        id: RecordId,
        reason: &str,
    ) -> Result<(), QueueError> {
        let executor = validate_executor_name(executor_name)?;
        if !self.store.mark_errored(id, executor, reason).await? {
            return Err(QueueError::UnknownJob(id));
        }
        info!(queue = %self.name, job_id = %id, executor = %executor, "job errored");
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        executor_name: &str,
        id: RecordId,
        reason: &str,
    ) -> Result<(), QueueError> {
        let executor = validate_executor_name(executor_name)?;
        if !self.store.mark_failed(id, executor, reason).await? {
            return Err(QueueError::UnknownJob(id));
        }
        info!(queue = %self.name, job_id = %id, executor = %executor, "job failed");
        Ok(())
    }

    // Operator-facing helpers.

    pub async fn enqueue(&self, record: T::Record) -> Result<RecordId, QueueError> {
        let id = self.store.enqueue(record).await?;
        debug!(queue = %self.name, job_id = %id, "enqueued record");
        Ok(id)
    }

    pub async fn get(&self, id: RecordId) -> Result<Option<JobRecord<T::Record>>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn cancel(&self, id: RecordId) -> Result<(), QueueError> {
        if !self.store.cancel(id).await? {
            return Err(QueueError::UnknownJob(id));
        }
        info!(queue = %self.name, job_id = %id, "cancellation requested");
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats().await?)
    }
}

fn validate_executor_name(name: &str) -> Result<&str, QueueError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(QueueError::InvalidExecutorName);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use execq_core::{JobV2, JobVersion, VirtualFile};

    use super::*;
    use crate::executors::InMemoryExecutorRegistry;
    use crate::jobs::{InMemoryJobStore, RecordState, ResetOutcome, StoreOptions};
    use crate::queue::adapter::{TransformError, transformer_fn};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Build {
        repo: String,
        needs_blob: bool,
    }

    fn build(repo: &str) -> Build {
        Build {
            repo: repo.to_string(),
            needs_blob: false,
        }
    }

    fn transform_build(record: &JobRecord<Build>, _ctx: &TransformContext) -> Result<JobV2, TransformError> {
        if record.id == RecordId::new(42) {
            return Err(TransformError::new("record 42 is poison"));
        }
        let mut job = JobV2::new(record.id);
        job.repository_name = record.payload.repo.clone();
        if record.payload.needs_blob {
            job.files
                .insert("input.tar".into(), VirtualFile::blob("uploads", "input.tar", None));
        }
        Ok(job)
    }

    fn registry() -> Arc<dyn ExecutorRegistry> {
        Arc::new(InMemoryExecutorRegistry::new())
    }

    fn handler<S: JobStore<Build>>(
        store: S,
    ) -> QueueHandler<S, impl RecordTransformer<Record = Build>> {
        QueueHandler::new("builds", store, transformer_fn(transform_build), registry())
    }

    fn params(executor: &str, version: Option<&str>) -> DequeueParams {
        DequeueParams {
            executor_name: executor.to_string(),
            version: version.map(str::to_string),
            resources: ResourceMetadata::default(),
        }
    }

    fn heartbeat_from(executor: &str) -> ExecutorHeartbeat {
        ExecutorHeartbeat {
            hostname: executor.to_string(),
            queue_name: "builds".to_string(),
            ..Default::default()
        }
    }

    /// Store double that hands out one canned record and records mark calls.
    #[derive(Default)]
    struct ScriptedStore {
        options: StoreOptions,
        next: Mutex<Option<JobRecord<Build>>>,
        mark_failed_calls: Mutex<Vec<(RecordId, String, String)>>,
        fail_marks: bool,
    }

    impl ScriptedStore {
        fn with_record(id: i64) -> Self {
            let record = JobRecord::queued(RecordId::new(id), build("r"), Utc::now());
            Self {
                next: Mutex::new(Some(record)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl JobStore<Build> for ScriptedStore {
        fn options(&self) -> &StoreOptions {
            &self.options
        }
        async fn enqueue(&self, _payload: Build) -> Result<RecordId, JobStoreError> {
            Ok(RecordId::new(1))
        }
        async fn get(&self, _id: RecordId) -> Result<Option<JobRecord<Build>>, JobStoreError> {
            Ok(None)
        }
        async fn dequeue(&self, worker_hostname: &str) -> Result<Option<JobRecord<Build>>, JobStoreError> {
            Ok(self.next.lock().unwrap().take().map(|mut r| {
                r.state = RecordState::Processing;
                r.worker_hostname = Some(worker_hostname.to_string());
                r
            }))
        }
        async fn heartbeat(&self, _w: &str, _ids: &[RecordId]) -> Result<Vec<RecordId>, JobStoreError> {
            Ok(Vec::new())
        }
        async fn requeue(&self, _id: RecordId, _w: &str, _after: DateTime<Utc>) -> Result<bool, JobStoreError> {
            Ok(false)
        }
        async fn add_execution_log_entry(
            &self,
            _id: RecordId,
            _w: &str,
            _entry: &ExecutionLogEntry,
        ) -> Result<Option<ExecutionLogEntryId>, JobStoreError> {
            Ok(None)
        }
        async fn update_execution_log_entry(
            &self,
            _id: RecordId,
            _w: &str,
            _entry_id: ExecutionLogEntryId,
            _entry: &ExecutionLogEntry,
        ) -> Result<bool, JobStoreError> {
            Ok(false)
        }
        async fn mark_complete(&self, _id: RecordId, _w: &str) -> Result<bool, JobStoreError> {
            Ok(false)
        }
        async fn mark_errored(&self, _id: RecordId, _w: &str, _reason: &str) -> Result<bool, JobStoreError> {
            Ok(false)
        }
        async fn mark_failed(&self, id: RecordId, w: &str, reason: &str) -> Result<bool, JobStoreError> {
            if self.fail_marks {
                return Err(JobStoreError::Unavailable("connection refused".into()));
            }
            self.mark_failed_calls
                .lock()
                .unwrap()
                .push((id, w.to_string(), reason.to_string()));
            Ok(true)
        }
        async fn cancel(&self, _id: RecordId) -> Result<bool, JobStoreError> {
            Ok(false)
        }
        async fn reset_stalled(&self) -> Result<ResetOutcome, JobStoreError> {
            Ok(ResetOutcome::default())
        }
        async fn stats(&self) -> Result<QueueStats, JobStoreError> {
            Ok(QueueStats::default())
        }
    }

    #[tokio::test]
    async fn transform_failure_marks_the_record_failed_once() {
        let store = Arc::new(ScriptedStore::with_record(42));
        let handler = handler(store.clone());

        let err = handler.dequeue(params("exec-1", None)).await.unwrap_err();

        assert!(matches!(err, QueueError::Transform { id, .. } if id == RecordId::new(42)));
        let calls = store.mark_failed_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, RecordId::new(42));
        assert_eq!(calls[0].1, "exec-1");
        assert_eq!(calls[0].2, "failed to transform record: record 42 is poison");
        assert_eq!(err.to_string(), "failed to transform record 42: record 42 is poison");
    }

    #[tokio::test]
    async fn store_failure_while_marking_is_surfaced() {
        let store = ScriptedStore {
            fail_marks: true,
            ..ScriptedStore::with_record(42)
        };
        let handler = handler(store);

        let err = handler.dequeue(params("exec-1", None)).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(JobStoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn empty_queue_dequeues_nothing() {
        let handler = handler(InMemoryJobStore::<Build>::default());
        assert!(handler.dequeue(params("exec-1", None)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_rejects_empty_executor_name_and_bad_versions() {
        let store = Arc::new(InMemoryJobStore::<Build>::default());
        let handler = handler(store.clone());
        handler.enqueue(build("r")).await.unwrap();

        assert!(matches!(
            handler.dequeue(params("  ", None)).await,
            Err(QueueError::InvalidExecutorName)
        ));
        assert!(matches!(
            handler.dequeue(params("exec-1", Some("\n1.2"))).await,
            Err(QueueError::Protocol(ProtocolError::InvalidExecutorVersion { .. }))
        ));
        // Neither attempt touched the record.
        assert_eq!(store.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn dequeue_serves_the_executors_version() {
        let handler = handler(InMemoryJobStore::<Build>::default());
        handler.enqueue(build("a")).await.unwrap();
        handler.enqueue(build("b")).await.unwrap();

        let old = handler.dequeue(params("old", None)).await.unwrap().unwrap();
        let new = handler.dequeue(params("new", Some("5.2.0"))).await.unwrap().unwrap();

        assert_eq!(old.version(), JobVersion::V1);
        assert_eq!(new.version(), JobVersion::V2);
    }

    #[tokio::test]
    async fn jobs_an_old_executor_cannot_parse_are_failed() {
        let store = Arc::new(InMemoryJobStore::<Build>::default());
        let handler = handler(store.clone());
        let id = handler
            .enqueue(Build {
                repo: "r".into(),
                needs_blob: true,
            })
            .await
            .unwrap();

        let err = handler.dequeue(params("old", Some("V1"))).await.unwrap_err();
        assert!(matches!(err, QueueError::Transform { .. }));

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Failed);
        assert!(record.failure_message.unwrap().starts_with("failed to transform record:"));
    }

    #[tokio::test]
    async fn heartbeat_reports_unknown_ids() {
        let store = Arc::new(InMemoryJobStore::<Build>::default());
        let handler = handler(store.clone());
        let a = handler.enqueue(build("a")).await.unwrap();
        let b = handler.enqueue(build("b")).await.unwrap();
        let c = handler.enqueue(build("c")).await.unwrap();
        handler.dequeue(params("exec-1", None)).await.unwrap();
        handler.dequeue(params("exec-1", None)).await.unwrap();
        handler.dequeue(params("exec-2", None)).await.unwrap();

        let outcome = handler
            .heartbeat(heartbeat_from("exec-1"), Some("V2"), &[a, b, c])
            .await
            .unwrap();

        assert_eq!(outcome.known_ids, vec![a, b]);
        assert_eq!(outcome.cancel_ids, vec![c]);
    }

    #[tokio::test]
    async fn cancellation_surfaces_on_next_heartbeat() {
        let handler = handler(InMemoryJobStore::<Build>::default());
        let a = handler.enqueue(build("a")).await.unwrap();
        handler.dequeue(params("exec-1", None)).await.unwrap();

        handler.cancel(a).await.unwrap();
        let outcome = handler.heartbeat(heartbeat_from("exec-1"), None, &[a]).await.unwrap();

        assert!(outcome.known_ids.is_empty());
        assert_eq!(outcome.cancel_ids, vec![a]);
    }

    #[tokio::test]
    async fn heartbeat_registers_the_executor() {
        let registry = Arc::new(InMemoryExecutorRegistry::new());
        let handler = QueueHandler::new(
            "builds",
            InMemoryJobStore::<Build>::default(),
            transformer_fn(transform_build),
            registry.clone(),
        );

        handler.heartbeat(heartbeat_from("exec-9"), None, &[]).await.unwrap();
        handler.heartbeat(heartbeat_from("  exec-9 "), None, &[]).await.unwrap();

        let all = registry.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].heartbeat.hostname, "exec-9");
    }

    #[tokio::test]
    async fn mark_by_non_owner_is_unknown_job() {
        let store = Arc::new(InMemoryJobStore::<Build>::default());
        let handler = handler(store.clone());
        let a = handler.enqueue(build("a")).await.unwrap();
        handler.dequeue(params("exec-1", None)).await.unwrap();

        let err = handler.mark_complete("exec-2", a).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownJob(id) if id == a));
        assert_eq!(store.get(a).await.unwrap().unwrap().state, RecordState::Processing);

        handler.mark_errored("exec-1", a, "exit 1").await.unwrap();
        assert!(matches!(
            handler.mark_failed("exec-1", a, "late").await,
            Err(QueueError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn execution_log_round() {
        let handler = handler(InMemoryJobStore::<Build>::default());
        let a = handler.enqueue(build("a")).await.unwrap();
        handler.dequeue(params("exec-1", None)).await.unwrap();

        let entry = ExecutionLogEntry::new("setup", vec!["git".into(), "clone".into()], Utc::now());
        let entry_id = handler.add_execution_log_entry("exec-1", a, &entry).await.unwrap();
        assert_eq!(entry_id, ExecutionLogEntryId::new(1));

        let finished = entry.clone().finished(0, Utc::now());
        handler
            .update_execution_log_entry("exec-1", a, entry_id, &finished)
            .await
            .unwrap();

        assert!(matches!(
            handler.add_execution_log_entry("intruder", a, &entry).await,
            Err(QueueError::UnknownJob(_))
        ));
        assert!(matches!(
            handler
                .update_execution_log_entry("exec-1", a, ExecutionLogEntryId::new(9), &finished)
                .await,
            Err(QueueError::UnknownJob(_))
        ));
    }
}
