//! Postgres-backed job store implementation.
//!
//! All logical queues share the `executor_jobs` table, partitioned by its
//! `queue` column. The domain record is stored as `payload JSONB` and the
//! execution log as a JSONB array.
//!
//! ## Exclusivity
//!
//! - `dequeue` selects its candidate with `FOR UPDATE SKIP LOCKED`, so two
//!   concurrent claims can never pick the same row.
//! - Every other mutation is a single `UPDATE ... WHERE state = 'processing'
//!   AND worker_hostname = $owner`. A caller that lost the race (or a zombie
//!   executor whose record was reassigned) matches zero rows and gets `false`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | PoolClosed, PoolTimedOut, Io, Tls | `Unavailable` |
//! | Database (any code) | `Storage` |
//! | Other | `Storage` |

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use execq_core::{ExecutionLogEntry, ExecutionLogEntryId, RecordId};

use super::store::{JobStore, JobStoreError};
use super::types::{
    CANCELED_FAILURE_MESSAGE, JobRecord, QueueStats, RecordState, ResetOutcome, StalledRecord, StoreOptions,
};

/// DDL for the job and executor tables. Safe to apply repeatedly.
pub const SCHEMA: &str = include_str!("../../migrations/0001_executor_queue.sql");

/// Apply [`SCHEMA`] to the database behind `pool`.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), JobStoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    Ok(())
}

/// Postgres-backed job store for payload type `P`.
pub struct PostgresJobStore<P> {
    pool: Arc<PgPool>,
    options: StoreOptions,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for PostgresJobStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for PostgresJobStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<P> PostgresJobStore<P> {
    /// Create a new store over the given connection pool.
    pub fn new(pool: PgPool, options: StoreOptions) -> Self {
        Self::from_shared(Arc::new(pool), options)
    }

    pub fn from_shared(pool: Arc<PgPool>, options: StoreOptions) -> Self {
        Self {
            pool,
            options,
            _payload: PhantomData,
        }
    }

    fn stalled_secs(&self) -> f64 {
        self.options.stalled_max_age.as_secs_f64()
    }

    fn max_num_resets(&self) -> i32 {
        i32::try_from(self.options.max_num_resets).unwrap_or(i32::MAX)
    }

    async fn finish(
        &self,
        operation: &'static str,
        id: RecordId,
        worker_hostname: &str,
        state: RecordState,
        reason: Option<&str>,
    ) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE executor_jobs
            SET state = $4,
                finished_at = now(),
                worker_hostname = NULL,
                failure_message = COALESCE($5::text, failure_message),
                num_failures = num_failures + CASE WHEN $5::text IS NULL THEN 0 ELSE 1 END
            WHERE queue = $1
              AND id = $2
              AND state = 'processing'
              AND worker_hostname = $3
            RETURNING id
            "#,
        )
        .bind(&self.options.queue)
        .bind(id.get())
        .bind(worker_hostname)
        .bind(state.as_str())
        .bind(reason)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        Ok(row.is_some())
    }
}

#[async_trait]
impl<P> JobStore<P> for PostgresJobStore<P>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn options(&self) -> &StoreOptions {
        &self.options
    }

    #[instrument(skip(self, payload), fields(queue = %self.options.queue), err)]
    async fn enqueue(&self, payload: P) -> Result<RecordId, JobStoreError> {
        let payload =
            serde_json::to_value(&payload).map_err(|e| JobStoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO executor_jobs (queue, payload)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(&self.options.queue)
        .bind(payload)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(RecordId::new(id))
    }

    #[instrument(skip(self), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn get(&self, id: RecordId) -> Result<Option<JobRecord<P>>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT *
            FROM executor_jobs
            WHERE queue = $1 AND id = $2
            "#,
        )
        .bind(&self.options.queue)
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_record(&row)).transpose()
    }

    #[instrument(skip(self), fields(queue = %self.options.queue, job_id), err)]
    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<JobRecord<P>>, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id
                FROM executor_jobs
                WHERE queue = $1
                  AND NOT cancel
                  AND (
                        (state = 'queued' AND (process_after IS NULL OR process_after <= now()))
                     OR (state = 'processing'
                         AND num_resets < $3
                         AND COALESCE(last_heartbeat_at, started_at) < now() - make_interval(secs => $4))
                  )
                ORDER BY queued_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executor_jobs j
            SET state = 'processing',
                num_resets = CASE WHEN j.state = 'processing' THEN j.num_resets + 1 ELSE j.num_resets END,
                worker_hostname = $2,
                started_at = now(),
                last_heartbeat_at = NULL,
                finished_at = NULL,
                failure_message = NULL,
                process_after = NULL,
                execution_logs = '[]'::jsonb
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING j.*
            "#,
        )
        .bind(&self.options.queue)
        .bind(worker_hostname)
        .bind(self.max_num_resets())
        .bind(self.stalled_secs())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dequeue", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("dequeue", e))?;
        Span::current().record("job_id", id);

        match decode_record(&row) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // Claimed but unreadable: fail it under the same owner gate.
                self.finish(
                    "dequeue",
                    RecordId::new(id),
                    worker_hostname,
                    RecordState::Failed,
                    Some(&format!("failed to decode record: {err}")),
                )
                .await?;
                Err(err)
            }
        }
    }

    #[instrument(skip(self, ids), fields(queue = %self.options.queue, claimed = ids.len()), err)]
    async fn heartbeat(
        &self,
        worker_hostname: &str,
        ids: &[RecordId],
    ) -> Result<Vec<RecordId>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();

        let rows = sqlx::query(
            r#"
            UPDATE executor_jobs
            SET last_heartbeat_at = now()
            WHERE queue = $1
              AND id = ANY($2)
              AND state = 'processing'
              AND worker_hostname = $3
              AND NOT cancel
            RETURNING id
            "#,
        )
        .bind(&self.options.queue)
        .bind(&raw)
        .bind(worker_hostname)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        let mut touched = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("heartbeat", e))?;
            touched.insert(RecordId::new(id));
        }

        // Preserve the caller's order.
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| touched.contains(id) && seen.insert(*id))
            .collect())
    }

    #[instrument(skip(self), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn requeue(
        &self,
        id: RecordId,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE executor_jobs
            SET state = 'queued',
                worker_hostname = NULL,
                started_at = NULL,
                last_heartbeat_at = NULL,
                process_after = $4
            WHERE queue = $1
              AND id = $2
              AND state = 'processing'
              AND worker_hostname = $3
              AND NOT cancel
            RETURNING id
            "#,
        )
        .bind(&self.options.queue)
        .bind(id.get())
        .bind(worker_hostname)
        .bind(after)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self, entry), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn add_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<Option<ExecutionLogEntryId>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE executor_jobs
            SET execution_logs = execution_logs || jsonb_build_array($4::jsonb)
            WHERE queue = $1
              AND id = $2
              AND state = 'processing'
              AND worker_hostname = $3
            RETURNING jsonb_array_length(execution_logs)::bigint AS entry_id
            "#,
        )
        .bind(&self.options.queue)
        .bind(id.get())
        .bind(worker_hostname)
        .bind(Json(entry))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_execution_log_entry", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entry_id: i64 = row
            .try_get("entry_id")
            .map_err(|e| map_sqlx_error("add_execution_log_entry", e))?;
        Ok(Some(ExecutionLogEntryId::new(entry_id)))
    }

    #[instrument(skip(self, entry), fields(queue = %self.options.queue, job_id = %id, entry_id = %entry_id), err)]
    async fn update_execution_log_entry(
        &self,
        id: RecordId,
        worker_hostname: &str,
        entry_id: ExecutionLogEntryId,
        entry: &ExecutionLogEntry,
    ) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE executor_jobs
            SET execution_logs = jsonb_set(execution_logs, ARRAY[($4::bigint - 1)::text], $5::jsonb)
            WHERE queue = $1
              AND id = $2
              AND state = 'processing'
              AND worker_hostname = $3
              AND $4::bigint >= 1
              AND jsonb_array_length(execution_logs) >= $4::bigint
            RETURNING id
            "#,
        )
        .bind(&self.options.queue)
        .bind(id.get())
        .bind(worker_hostname)
        .bind(entry_id.get())
        .bind(Json(entry))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_execution_log_entry", e))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn mark_complete(&self, id: RecordId, worker_hostname: &str) -> Result<bool, JobStoreError> {
        self.finish("mark_complete", id, worker_hostname, RecordState::Completed, None)
            .await
    }

    #[instrument(skip(self, reason), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn mark_errored(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        self.finish("mark_errored", id, worker_hostname, RecordState::Errored, Some(reason))
            .await
    }

    #[instrument(skip(self, reason), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: RecordId,
        worker_hostname: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        self.finish("mark_failed", id, worker_hostname, RecordState::Failed, Some(reason))
            .await
    }

    #[instrument(skip(self), fields(queue = %self.options.queue, job_id = %id), err)]
    async fn cancel(&self, id: RecordId) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE executor_jobs
            SET cancel = TRUE,
                state = CASE WHEN state = 'queued' THEN 'failed' ELSE state END,
                finished_at = CASE WHEN state = 'queued' THEN now() ELSE finished_at END,
                failure_message = CASE WHEN state = 'queued' THEN $3 ELSE failure_message END
            WHERE queue = $1
              AND id = $2
              AND state IN ('queued', 'processing')
            RETURNING id
            "#,
        )
        .bind(&self.options.queue)
        .bind(id.get())
        .bind(CANCELED_FAILURE_MESSAGE)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(queue = %self.options.queue, reset, errored, canceled), err)]
    async fn reset_stalled(&self) -> Result<ResetOutcome, JobStoreError> {
        let rows = sqlx::query(
            r#"
            WITH stalled AS (
                SELECT id,
                       num_resets,
                       cancel,
                       EXTRACT(EPOCH FROM now() - COALESCE(last_heartbeat_at, started_at))::float8 AS age_secs
                FROM executor_jobs
                WHERE queue = $1
                  AND state = 'processing'
                  AND COALESCE(last_heartbeat_at, started_at) < now() - make_interval(secs => $2)
                FOR UPDATE SKIP LOCKED
            ),
            reset AS (
                UPDATE executor_jobs j
                SET state = 'queued',
                    num_resets = j.num_resets + 1,
                    worker_hostname = NULL,
                    started_at = NULL,
                    last_heartbeat_at = NULL
                FROM stalled s
                WHERE j.id = s.id AND NOT s.cancel AND s.num_resets < $3
                RETURNING j.id, s.age_secs
            ),
            errored AS (
                UPDATE executor_jobs j
                SET state = 'errored',
                    finished_at = now(),
                    failure_message = $4,
                    worker_hostname = NULL
                FROM stalled s
                WHERE j.id = s.id AND NOT s.cancel AND s.num_resets >= $3
                RETURNING j.id, s.age_secs
            ),
            canceled AS (
                UPDATE executor_jobs j
                SET state = 'failed',
                    finished_at = now(),
                    failure_message = $5,
                    worker_hostname = NULL
                FROM stalled s
                WHERE j.id = s.id AND s.cancel
                RETURNING j.id, s.age_secs
            )
            SELECT 'reset' AS outcome, id, age_secs FROM reset
            UNION ALL
            SELECT 'errored' AS outcome, id, age_secs FROM errored
            UNION ALL
            SELECT 'canceled' AS outcome, id, age_secs FROM canceled
            "#,
        )
        .bind(&self.options.queue)
        .bind(self.stalled_secs())
        .bind(self.max_num_resets())
        .bind(&self.options.reset_failure_message)
        .bind(CANCELED_FAILURE_MESSAGE)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stalled", e))?;

        let mut outcome = ResetOutcome::default();
        for row in rows {
            let outcome_kind: String = row.try_get("outcome").map_err(|e| map_sqlx_error("reset_stalled", e))?;
            let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("reset_stalled", e))?;
            let age_secs: f64 = row.try_get("age_secs").map_err(|e| map_sqlx_error("reset_stalled", e))?;
            let stalled = StalledRecord {
                id: RecordId::new(id),
                heartbeat_age: Duration::try_from_secs_f64(age_secs).unwrap_or_default(),
            };
            match outcome_kind.as_str() {
                "reset" => outcome.reset.push(stalled),
                "canceled" => outcome.canceled.push(stalled),
                _ => outcome.errored.push(stalled),
            }
        }

        let span = Span::current();
        span.record("reset", outcome.reset.len());
        span.record("errored", outcome.errored.len());
        span.record("canceled", outcome.canceled.len());
        Ok(outcome)
    }

    #[instrument(skip(self), fields(queue = %self.options.queue), err)]
    async fn stats(&self) -> Result<QueueStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n
            FROM executor_jobs
            WHERE queue = $1
            GROUP BY state
            "#,
        )
        .bind(&self.options.queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = usize::try_from(n).unwrap_or_default();
            match RecordState::parse(&state) {
                Some(RecordState::Queued) => stats.queued = n,
                Some(RecordState::Processing) => stats.processing = n,
                Some(RecordState::Completed) => stats.completed = n,
                Some(RecordState::Errored) => stats.errored = n,
                Some(RecordState::Failed) => stats.failed = n,
                None => {}
            }
        }
        Ok(stats)
    }
}

fn decode_record<P: DeserializeOwned>(row: &PgRow) -> Result<JobRecord<P>, JobStoreError> {
    let row = JobRecordRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to read job row: {e}")))?;
    row.try_into()
}

/// Map sqlx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("timed out acquiring connection in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => JobStoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRecordRow {
    id: i64,
    state: String,
    payload: serde_json::Value,
    failure_message: Option<String>,
    worker_hostname: Option<String>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    process_after: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    num_resets: i32,
    num_failures: i32,
    cancel: bool,
    execution_logs: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for JobRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRecordRow {
            id: row.try_get("id")?,
            state: row.try_get("state")?,
            payload: row.try_get("payload")?,
            failure_message: row.try_get("failure_message")?,
            worker_hostname: row.try_get("worker_hostname")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            process_after: row.try_get("process_after")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            num_resets: row.try_get("num_resets")?,
            num_failures: row.try_get("num_failures")?,
            cancel: row.try_get("cancel")?,
            execution_logs: row.try_get("execution_logs")?,
        })
    }
}

impl<P: DeserializeOwned> TryFrom<JobRecordRow> for JobRecord<P> {
    type Error = JobStoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        let state = RecordState::parse(&row.state)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown record state {:?}", row.state)))?;
        let payload = serde_json::from_value(row.payload)
            .map_err(|e| JobStoreError::Serialization(format!("job {}: {}", row.id, e)))?;
        let execution_logs = serde_json::from_value(row.execution_logs)
            .map_err(|e| JobStoreError::Serialization(format!("job {} execution logs: {}", row.id, e)))?;

        Ok(JobRecord {
            id: RecordId::new(row.id),
            state,
            payload,
            failure_message: row.failure_message,
            worker_hostname: row.worker_hostname,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            process_after: row.process_after,
            last_heartbeat_at: row.last_heartbeat_at,
            num_resets: u32::try_from(row.num_resets).unwrap_or_default(),
            num_failures: u32::try_from(row.num_failures).unwrap_or_default(),
            cancel: row.cancel,
            execution_logs,
        })
    }
}
