//! Jobs and throwing events: the two things an instance hands to the outside.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Waiting,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// A unit of externally executed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub element_id: String,
    /// Service, decision or message target declared on the element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Scoped context at schedule time.
    pub data: Value,
    pub status: JobStatus,
    /// Version of the persist that first stores this job.
    pub version: u64,
}

impl Job {
    pub fn new(element_id: &str, action: Option<String>, data: Value, version: u64) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            element_id: element_id.to_string(),
            action,
            data,
            status: JobStatus::Created,
            version,
        }
    }
}

/// A business event raised by a throwing event element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowingEvent {
    pub name: String,
    pub element_id: String,
    pub payload: Value,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_ids_are_unique() {
        let a = Job::new("task", None, json!({}), 0);
        let b = Job::new("task", None, json!({}), 0);
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.status, JobStatus::Created);
        assert!(!a.status.is_resolved());
        assert!(JobStatus::Error.is_resolved());
    }
}
