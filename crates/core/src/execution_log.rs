//! Execution log entries captured by executors while running a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step's worth of captured output.
///
/// Entries are appended while the owning executor still holds the job and may
/// be replaced in place (e.g. once a long-running command exits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub key: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub out: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl ExecutionLogEntry {
    pub fn new(key: impl Into<String>, command: Vec<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            command,
            start_time,
            exit_code: None,
            out: String::new(),
            duration_ms: None,
        }
    }

    pub fn with_output(mut self, out: impl Into<String>) -> Self {
        self.out = out.into();
        self
    }

    /// Record the command's exit and derive its duration from `end_time`.
    pub fn finished(mut self, exit_code: i32, end_time: DateTime<Utc>) -> Self {
        self.exit_code = Some(exit_code);
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds().max(0));
        self
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.duration_ms
            .map(|ms| self.start_time + chrono::Duration::milliseconds(ms))
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn finished_entry_reports_end_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let end = start + chrono::Duration::milliseconds(1500);
        let entry = ExecutionLogEntry::new("step.0", vec!["ls".into()], start).finished(0, end);

        assert!(entry.is_finished());
        assert_eq!(entry.duration_ms, Some(1500));
        assert_eq!(entry.end_time(), Some(end));
    }

    #[test]
    fn uses_camel_case_wire_names() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = ExecutionLogEntry::new("k", vec!["echo".into(), "hi".into()], start)
            .with_output("hi\n")
            .finished(1, start);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["startTime"], "2024-01-01T00:00:00Z");
        assert_eq!(json["exitCode"], 1);
        assert_eq!(json["durationMs"], 0);
        assert_eq!(json["out"], "hi\n");
    }
}
