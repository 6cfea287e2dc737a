use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Shown when the backend marks a run failed without saying why
pub const DEFAULT_FAILURE_MESSAGE: &str = "Agent run failed";

/// Server-side identifier of a long-running operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Runs are keyed by UUID strings, older endpoints return integer ids.
impl<'de> Deserialize<'de> for OperationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => OperationId(s),
            RawId::Number(n) => OperationId(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Parse a backend status string. Unknown values map to `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response of the trigger endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RunStarted {
    pub id: OperationId,
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Response of the run status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RunStatusResponse {
    pub status: String,
    #[serde(default)]
    pub output_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// State of one polled operation.
///
/// Once the status is terminal the handle is frozen and every further
/// `apply` / `record_miss` is ignored.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: OperationId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub output: Option<Map<String, Value>>,
    pub error_message: Option<String>,
    /// Consecutive samples lost to query failures
    pub missed_samples: u32,
}

impl JobHandle {
    pub fn new(id: OperationId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            elapsed_seconds: 0,
            output: None,
            error_message: None,
            missed_samples: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn advance_clock(&mut self, elapsed_seconds: u64) {
        self.elapsed_seconds = self.elapsed_seconds.max(elapsed_seconds);
    }

    /// Fold a status sample into the handle. Returns false if the handle
    /// was already terminal and nothing changed.
    pub fn apply(&mut self, response: &RunStatusResponse, elapsed_seconds: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.advance_clock(elapsed_seconds);
        self.missed_samples = 0;

        // Unrecognized statuses leave the last known one in place.
        if let Some(status) = JobStatus::from_wire(&response.status) {
            self.status = status;
        }
        if response.output_data.is_some() {
            self.output = response.output_data.clone();
        }
        self.error_message = match self.status {
            JobStatus::Failed => Some(
                response
                    .error_message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            ),
            _ => response.error_message.clone(),
        };
        true
    }

    /// Note a failed query. The status is left untouched.
    pub fn record_miss(&mut self, elapsed_seconds: u64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.advance_clock(elapsed_seconds);
        self.missed_samples = self.missed_samples.saturating_add(1);
        true
    }

    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            operation_id: self.id.clone(),
            status: self.status,
            started_at: self.started_at,
            elapsed_seconds: self.elapsed_seconds,
            is_complete: self.status == JobStatus::Completed,
            is_failed: self.status == JobStatus::Failed,
            cancelled: false,
            output: self.output.clone(),
            error_message: self.error_message.clone(),
            missed_samples: self.missed_samples,
        }
    }
}

/// Read-only view of a poll for the view layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct PollSnapshot {
    pub operation_id: OperationId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
    pub is_complete: bool,
    pub is_failed: bool,
    pub cancelled: bool,
    pub output: Option<Map<String, Value>>,
    pub error_message: Option<String>,
    pub missed_samples: u32,
}

impl PollSnapshot {
    /// No further updates will follow
    pub fn is_finished(&self) -> bool {
        self.is_complete || self.is_failed || self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(status: &str) -> RunStatusResponse {
        RunStatusResponse {
            status: status.to_string(),
            output_data: None,
            error_message: None,
        }
    }

    #[test]
    fn test_status_from_wire() {
        assert_eq!(JobStatus::from_wire("running"), Some(JobStatus::Running));
        assert_eq!(JobStatus::from_wire("COMPLETED"), Some(JobStatus::Completed));
        assert_eq!(JobStatus::from_wire("queued"), None);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_operation_id_accepts_numbers() {
        let started: RunStarted =
            serde_json::from_str(r#"{"id": 17, "status": "pending", "agent_type": "evidence"}"#)
                .expect("Failed to parse trigger response");
        assert_eq!(started.id, OperationId::new("17"));
        assert_eq!(started.extra.get("agent_type"), Some(&json!("evidence")));

        let started: RunStarted = serde_json::from_str(r#"{"id": "run-1"}"#)
            .expect("Failed to parse trigger response");
        assert_eq!(started.id.as_str(), "run-1");
        assert!(started.status.is_none());
    }

    #[test]
    fn test_terminal_handle_is_frozen() {
        let mut job = JobHandle::new(OperationId::new("run-1"));
        let mut done = response("completed");
        done.output_data = json!({"evidence_count": 7}).as_object().cloned();
        assert!(job.apply(&done, 6));

        let before = job.snapshot();
        assert!(!job.apply(&response("running"), 8));
        assert!(!job.record_miss(10));
        assert_eq!(job.snapshot(), before);
        assert!(before.is_complete);
    }

    #[test]
    fn test_failed_without_message_gets_fallback() {
        let mut job = JobHandle::new(OperationId::new("run-1"));
        job.apply(&response("failed"), 1);
        let snapshot = job.snapshot();
        assert!(snapshot.is_failed);
        assert_eq!(snapshot.error_message.as_deref(), Some(DEFAULT_FAILURE_MESSAGE));

        let mut job = JobHandle::new(OperationId::new("run-2"));
        let mut failed = response("failed");
        failed.error_message = Some("LLM quota exceeded".to_string());
        job.apply(&failed, 1);
        assert_eq!(job.error_message.as_deref(), Some("LLM quota exceeded"));
    }

    #[test]
    fn test_unknown_status_keeps_previous() {
        let mut job = JobHandle::new(OperationId::new("run-1"));
        job.apply(&response("running"), 2);
        job.apply(&response("queued"), 4);
        assert_eq!(job.status, JobStatus::Running);
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_elapsed_never_decreases() {
        let mut job = JobHandle::new(OperationId::new("run-1"));
        job.apply(&response("running"), 5);
        job.apply(&response("running"), 3);
        assert_eq!(job.elapsed_seconds, 5);
        job.record_miss(4);
        assert_eq!(job.elapsed_seconds, 5);
        job.record_miss(7);
        assert_eq!(job.elapsed_seconds, 7);
    }

    #[test]
    fn test_miss_counter_resets_on_sample() {
        let mut job = JobHandle::new(OperationId::new("run-1"));
        job.record_miss(1);
        job.record_miss(2);
        assert_eq!(job.missed_samples, 2);
        assert_eq!(job.status, JobStatus::Pending);
        job.apply(&response("running"), 3);
        assert_eq!(job.missed_samples, 0);
    }
}
