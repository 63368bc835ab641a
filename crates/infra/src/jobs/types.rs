//! Job record types and store policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use execq_core::{ExecutionLogEntry, RecordId};

/// Default stall threshold: a processing record without a heartbeat for this
/// long is assumed to have lost its executor.
pub const DEFAULT_STALLED_MAX_AGE: Duration = Duration::from_secs(25);

/// Default number of automatic stall resets before a record is errored.
pub const DEFAULT_MAX_NUM_RESETS: u32 = 3;

pub const DEFAULT_RESET_FAILURE_MESSAGE: &str =
    "job processor died while handling this message too many times";

/// Failure message for cancelled records that no executor will finish.
pub const CANCELED_FAILURE_MESSAGE: &str = "job was canceled";

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Queued,
    Processing,
    Completed,
    Errored,
    Failed,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Completed | RecordState::Errored | RecordState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Queued => "queued",
            RecordState::Processing => "processing",
            RecordState::Completed => "completed",
            RecordState::Errored => "errored",
            RecordState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RecordState::Queued),
            "processing" => Some(RecordState::Processing),
            "completed" => Some(RecordState::Completed),
            "errored" => Some(RecordState::Errored),
            "failed" => Some(RecordState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A store-owned job record wrapping a domain payload `P`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord<P> {
    pub id: RecordId,
    pub state: RecordState,
    pub payload: P,
    pub failure_message: Option<String>,
    /// Owning executor; set iff `state == Processing`.
    pub worker_hostname: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub num_resets: u32,
    pub num_failures: u32,
    pub cancel: bool,
    pub execution_logs: Vec<ExecutionLogEntry>,
}

impl<P> JobRecord<P> {
    /// A fresh queued record.
    pub fn queued(id: RecordId, payload: P, queued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: RecordState::Queued,
            payload,
            failure_message: None,
            worker_hostname: None,
            queued_at,
            started_at: None,
            finished_at: None,
            process_after: None,
            last_heartbeat_at: None,
            num_resets: 0,
            num_failures: 0,
            cancel: false,
            execution_logs: Vec::new(),
        }
    }

    pub fn is_owned_by(&self, worker_hostname: &str) -> bool {
        self.state == RecordState::Processing && self.worker_hostname.as_deref() == Some(worker_hostname)
    }

    /// Time of the last liveness signal (heartbeat, or the claim itself).
    pub fn last_alive_at(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_at.or(self.started_at)
    }
}

/// Per-queue store policy.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Logical queue name (partition key in shared tables, label in logs).
    pub queue: String,
    pub stalled_max_age: Duration,
    pub max_num_resets: u32,
    pub reset_failure_message: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            stalled_max_age: DEFAULT_STALLED_MAX_AGE,
            max_num_resets: DEFAULT_MAX_NUM_RESETS,
            reset_failure_message: DEFAULT_RESET_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl StoreOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn with_stalled_max_age(mut self, age: Duration) -> Self {
        self.stalled_max_age = age;
        self
    }

    pub fn with_max_num_resets(mut self, max: u32) -> Self {
        self.max_num_resets = max;
        self
    }

    pub fn with_reset_failure_message(mut self, message: impl Into<String>) -> Self {
        self.reset_failure_message = message.into();
        self
    }

    pub(crate) fn stalled_max_age_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stalled_max_age).unwrap_or(chrono::Duration::MAX)
    }
}

/// One record touched by a stall-reset pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StalledRecord {
    pub id: RecordId,
    /// Time since the record's last liveness signal.
    pub heartbeat_age: Duration,
}

/// Result of one `reset_stalled` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResetOutcome {
    /// Returned to `queued` with `num_resets` incremented.
    pub reset: Vec<StalledRecord>,
    /// Out of resets; moved to `errored`.
    pub errored: Vec<StalledRecord>,
    /// Cancelled while processing; moved to `failed` without using a reset.
    pub canceled: Vec<StalledRecord>,
}

impl ResetOutcome {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.errored.is_empty() && self.canceled.is_empty()
    }

    pub fn reset_ids(&self) -> Vec<RecordId> {
        self.reset.iter().map(|r| r.id).collect()
    }

    pub fn errored_ids(&self) -> Vec<RecordId> {
        self.errored.iter().map(|r| r.id).collect()
    }

    pub fn canceled_ids(&self) -> Vec<RecordId> {
        self.canceled.iter().map(|r| r.id).collect()
    }
}

/// Snapshot of record counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub errored: usize,
    pub failed: usize,
}
