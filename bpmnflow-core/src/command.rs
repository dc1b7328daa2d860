//! Commands and queries.
//!
//! [`Command`] and [`Query`] are the caller-facing vocabulary.
//! [`InstanceCommand`] is the orchestrator's internal vocabulary: element
//! handlers send these back to their instance, and the instance raises them
//! against itself while driving the graph.

use crate::job::Job;
use crate::machine::ElementCommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-facing commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CreateInstance,
    RaiseEvent {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    CommitJob {
        job_id: String,
        #[serde(default)]
        result: Value,
    },
    FailJob {
        job_id: String,
        #[serde(default)]
        error: Value,
    },
    StopInstance,
    ContinueInstance,
}

impl Command {
    /// Handler key on the command bus.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateInstance => "CreateInstance",
            Command::RaiseEvent { .. } => "RaiseEvent",
            Command::CommitJob { .. } => "CommitJob",
            Command::FailJob { .. } => "FailJob",
            Command::StopInstance => "StopInstance",
            Command::ContinueInstance => "ContinueInstance",
        }
    }
}

/// Caller-facing queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    Status,
    Data,
    Jobs,
    Throwing,
    Log,
    Element { element_id: String },
    Children,
}

impl Query {
    /// Handler key on the query bus.
    pub fn name(&self) -> &'static str {
        match self {
            Query::Status => "Status",
            Query::Data => "Data",
            Query::Jobs => "Jobs",
            Query::Throwing => "Throwing",
            Query::Log => "Log",
            Query::Element { .. } => "Element",
            Query::Children => "Children",
        }
    }
}

/// Orchestrator messages.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceCommand {
    ActivateDefault,
    RaiseEvent { name: String, payload: Value },
    ActivateElement { element_id: String, message: ElementCommand },
    ActivateNext { element_id: String },
    DeactivateElement { element_id: String },
    ActivateBoundary { element_id: String, error: Value },
    ConditionalNext { element_id: String },
    ContextAdd { element_id: String, input: Option<Value> },
    JobScheduled { job: Job },
    JobCompleted { job_id: String },
    JobFailed { job_id: String },
    EmitThrowing { element_id: String, name: String, payload: Value },
    CheckIdle,
    CheckCompleted,
    Commit { job_id: String, result: Value },
    Failed { job_id: String, error: Value },
    Stop { reason: String },
    Continue,
}

impl InstanceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceCommand::ActivateDefault => "activate.default",
            InstanceCommand::RaiseEvent { .. } => "raise.event",
            InstanceCommand::ActivateElement { .. } => "activate.element",
            InstanceCommand::ActivateNext { .. } => "activate.next",
            InstanceCommand::DeactivateElement { .. } => "deactivate.element",
            InstanceCommand::ActivateBoundary { .. } => "activate.boundary",
            InstanceCommand::ConditionalNext { .. } => "conditional.next",
            InstanceCommand::ContextAdd { .. } => "context.add",
            InstanceCommand::JobScheduled { .. } => "job.scheduled",
            InstanceCommand::JobCompleted { .. } => "job.completed",
            InstanceCommand::JobFailed { .. } => "job.failed",
            InstanceCommand::EmitThrowing { .. } => "emit.throwing",
            InstanceCommand::CheckIdle => "check.idle",
            InstanceCommand::CheckCompleted => "check.completed",
            InstanceCommand::Commit { .. } => "commit",
            InstanceCommand::Failed { .. } => "failed",
            InstanceCommand::Stop { .. } => "stop",
            InstanceCommand::Continue => "continue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_json() {
        let cmd: Command = serde_json::from_value(json!({
            "type": "commit_job",
            "job_id": "j1",
            "result": {"price": 10}
        }))
        .unwrap();
        assert_eq!(cmd.name(), "CommitJob");

        let cmd: Command = serde_json::from_value(json!({"type": "create_instance"})).unwrap();
        assert_eq!(cmd, Command::CreateInstance);

        let cmd: Command =
            serde_json::from_value(json!({"type": "raise_event", "name": "go"})).unwrap();
        assert_eq!(
            cmd,
            Command::RaiseEvent {
                name: "go".to_string(),
                payload: Value::Null
            }
        );
    }

    #[test]
    fn test_query_json() {
        let q: Query =
            serde_json::from_value(json!({"type": "element", "element_id": "task"})).unwrap();
        assert_eq!(q.name(), "Element");
    }
}
