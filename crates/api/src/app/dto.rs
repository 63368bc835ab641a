use serde::{Deserialize, Serialize};

use execq_core::{ExecutionLogEntry, ExecutionLogEntryId, RecordId};
use execq_infra::ExecutorHeartbeat;
use execq_infra::queue::{DequeueParams, HeartbeatOutcome, ResourceMetadata};

// -------------------------
// Executor request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    pub executor_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "numCPUs")]
    pub num_cpus: Option<u32>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub disk_space: Option<String>,
}

impl DequeueRequest {
    pub fn into_params(self) -> DequeueParams {
        DequeueParams {
            executor_name: self.executor_name,
            version: self.version,
            resources: ResourceMetadata {
                num_cpus: self.num_cpus,
                memory: self.memory,
                disk_space: self.disk_space,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub executor_name: String,
    #[serde(default, alias = "jobIDs")]
    pub job_ids: Vec<RecordId>,
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub executor_version: String,
    #[serde(default)]
    pub git_version: String,
    #[serde(default)]
    pub ignite_version: String,
    #[serde(default)]
    pub src_cli_version: String,

    /// Executor-side metrics in exposition format; only its size is logged.
    #[serde(default)]
    pub prometheus_metrics: String,
}

impl HeartbeatRequest {
    pub fn executor(&self, queue: &str) -> ExecutorHeartbeat {
        ExecutorHeartbeat {
            hostname: self.executor_name.clone(),
            queue_name: queue.to_string(),
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            docker_version: self.docker_version.clone(),
            executor_version: self.executor_version.clone(),
            git_version: self.git_version.clone(),
            ignite_version: self.ignite_version.clone(),
            src_cli_version: self.src_cli_version.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddExecutionLogEntryRequest {
    pub executor_name: String,
    pub job_id: RecordId,
    #[serde(flatten)]
    pub entry: ExecutionLogEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateExecutionLogEntryRequest {
    pub executor_name: String,
    pub job_id: RecordId,
    pub entry_id: ExecutionLogEntryId,
    #[serde(flatten)]
    pub entry: ExecutionLogEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkCompleteRequest {
    pub executor_name: String,
    pub job_id: RecordId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkErroredRequest {
    pub executor_name: String,
    pub job_id: RecordId,
    #[serde(default)]
    pub error_message: String,
}

// -------------------------
// Response DTOs
// -------------------------

/// Heartbeat response; ids travel as strings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub known_ids: Vec<String>,
    pub cancel_ids: Vec<String>,
}

impl From<HeartbeatOutcome> for HeartbeatResponse {
    fn from(outcome: HeartbeatOutcome) -> Self {
        let as_strings = |ids: Vec<RecordId>| ids.into_iter().map(|id| id.to_string()).collect();
        Self {
            known_ids: as_strings(outcome.known_ids),
            cancel_ids: as_strings(outcome.cancel_ids),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: RecordId,
}
