//! The job record that travels through the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a job. Only `Pending` is ever published; `Complete` and
/// `Failed` exist on the consumer side once the handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work addressed to the handler registered for `job_type`.
///
/// Wire format (JSON):
///
/// ```json
/// {
///   "id": "0b6c…",
///   "type": "email",
///   "payload": {"to": "a@b.c"},
///   "status": "pending",
///   "created_at": "2024-05-01T12:00:00Z"
/// }
/// ```
///
/// `completed_at` and `error` are omitted while unset, `attempt` while zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How many times this job has been republished after a failure.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Job {
    /// A fresh pending job with a random id.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            attempt: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn mark_complete(&mut self) {
        self.status = JobStatus::Complete;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl fmt::Display) {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
    }

    /// The job as it should be published again for another attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            status: JobStatus::Pending,
            completed_at: None,
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("email", json!({"to": "a@example.com"}));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_type, "email");
        assert!(job.completed_at.is_none());
        assert!(job.error.is_none());
        assert!(Uuid::parse_str(&job.id).is_ok());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Job::new("email", json!({}));
        let b = Job::new("email", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_wire_field_names() {
        let job = Job::new("email", json!({"subject": "hi"}));
        let value: serde_json::Value = serde_json::from_slice(&job.to_bytes().unwrap()).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object["type"], "email");
        assert_eq!(object["status"], "pending");
        assert_eq!(object["payload"]["subject"], "hi");
        assert!(object.contains_key("id"));
        assert!(object.contains_key("created_at"));
        assert!(!object.contains_key("job_type"));
        assert!(!object.contains_key("completed_at"));
        assert!(!object.contains_key("error"));
        assert!(!object.contains_key("attempt"));
    }

    #[test]
    fn test_decodes_record_from_other_publishers() {
        let raw = br#"{
            "id": "42",
            "type": "email",
            "payload": {"to": "x@y.z"},
            "status": "pending",
            "created_at": "2024-05-01T12:00:00Z"
        }"#;
        let job = Job::from_bytes(raw).unwrap();
        assert_eq!(job.id, "42");
        assert_eq!(job.attempt, 0);
        assert_eq!(job.payload["to"], "x@y.z");
    }

    #[test]
    fn test_rejects_unknown_status() {
        let raw = br#"{"id":"1","type":"t","payload":null,"status":"running","created_at":"2024-05-01T12:00:00Z"}"#;
        assert!(Job::from_bytes(raw).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Job::from_bytes(b"not json").is_err());
        assert!(Job::from_bytes(b"{}").is_err());
    }

    #[test]
    fn test_mark_complete_and_failed() {
        let mut job = Job::new("email", json!({}));
        job.mark_complete();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.completed_at.is_some());

        let mut job = Job::new("email", json!({}));
        job.mark_failed("smtp down");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("smtp down"));
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_next_attempt_resets_status_and_keeps_error() {
        let mut job = Job::new("email", json!({}));
        job.mark_failed("timeout");

        let retry = job.next_attempt();
        assert_eq!(retry.id, job.id);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.status, JobStatus::Pending);
        assert_eq!(retry.error.as_deref(), Some("timeout"));
    }
}
