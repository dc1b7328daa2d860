//! Task machine.
//!
//! Service, business rule and send tasks hand their work to the outside as a
//! job and wait for it to be committed or failed. Every other task kind passes
//! straight through.

use super::{common_events, owns_job};
use crate::command::InstanceCommand;
use crate::error::CoreError;
use crate::event::DomainEvent;
use crate::graph::{ElementRef, ProcessDefinition, TaskType};
use crate::job::Job;
use crate::machine::{CommandKind, ElementCommand, ElementState, ElementType, Machine, Scope};
use crate::model::ModelCtx;
use serde_json::Value;

pub const NAME: &str = "task";

const JOB_TYPES: [ElementType; 3] = [
    ElementType::ServiceTask,
    ElementType::BusinessRuleTask,
    ElementType::SendTask,
];

pub fn machine() -> Machine {
    let mut builder = common_events(Machine::builder(NAME, element_type));
    for t in JOB_TYPES {
        builder = builder
            .on_command(Scope::at(t, ElementState::Idle), CommandKind::Activate, schedule)
            .on_command(Scope::at(t, ElementState::Waiting), CommandKind::CommitJob, commit)
            .on_command(Scope::at(t, ElementState::Waiting), CommandKind::FailJob, fail);
    }
    builder
        .on_command(
            Scope::at(ElementType::SimpleTask, ElementState::Idle),
            CommandKind::Activate,
            pass_through,
        )
        .build()
}

fn element_type(_: &ProcessDefinition, element: ElementRef<'_>) -> ElementType {
    match element {
        ElementRef::Task(t) => match t.task_type {
            TaskType::ServiceTask => ElementType::ServiceTask,
            TaskType::BusinessRuleTask => ElementType::BusinessRuleTask,
            TaskType::SendTask => ElementType::SendTask,
            _ => ElementType::SimpleTask,
        },
        _ => ElementType::SimpleTask,
    }
}

fn schedule(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };

    let action = match ctx.element()? {
        ElementRef::Task(t) => t.action.clone().or_else(|| t.decision.clone()),
        _ => None,
    };
    ctx.activated(previous.clone());

    let job = Job::new(&ctx.uid(), action, ctx.model.data().clone(), ctx.version());
    tracing::debug!("Element {} created job {}", job.element_id, job.job_id);
    ctx.apply(DomainEvent::JobCreated { job: job.clone() });
    ctx.send(InstanceCommand::JobScheduled { job });
    Ok(())
}

fn commit(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::CommitJob { job_id, result } = command else {
        return Ok(());
    };
    if !owns_job(ctx.model, job_id) {
        return Err(CoreError::HandlerFailed {
            reason: format!("job {} does not belong to {}", job_id, ctx.uid()),
        });
    }

    let element_id = ctx.uid();
    ctx.apply(DomainEvent::JobCommitted {
        job_id: job_id.clone(),
        result: result.clone(),
    });
    ctx.send(InstanceCommand::JobCompleted {
        job_id: job_id.clone(),
    });
    ctx.send(InstanceCommand::ContextAdd {
        element_id,
        input: Some(result.clone()),
    });
    ctx.complete(result.clone());
    Ok(())
}

fn fail(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::FailJob { job_id, error } = command else {
        return Ok(());
    };
    if !owns_job(ctx.model, job_id) {
        return Err(CoreError::HandlerFailed {
            reason: format!("job {} does not belong to {}", job_id, ctx.uid()),
        });
    }

    ctx.apply(DomainEvent::JobFailed {
        job_id: job_id.clone(),
        error: error.clone(),
    });
    ctx.send(InstanceCommand::JobFailed {
        job_id: job_id.clone(),
    });
    ctx.apply(DomainEvent::ElementFailed {
        error: error.clone(),
    });
    ctx.send(InstanceCommand::ActivateBoundary {
        element_id: ctx.uid(),
        error: error.clone(),
    });
    Ok(())
}

fn pass_through(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    ctx.activated(previous.clone());
    ctx.send(InstanceCommand::ContextAdd {
        element_id: ctx.uid(),
        input: None,
    });
    ctx.complete(Value::Null);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::testing::Harness;
    use crate::model::DispatchOutcome;
    use serde_json::json;

    fn graph() -> Value {
        json!({
            "processId": "p",
            "events": [
                {"id": "start", "position": "start", "outgoing": ["s1"]},
                {"id": "end", "position": "end", "incoming": ["s3"]}
            ],
            "tasks": [
                {"id": "call", "type": "serviceTask", "action": "svc.call",
                 "incoming": ["s1"], "outgoing": ["s2"]},
                {"id": "note", "type": "manualTask", "incoming": ["s2"], "outgoing": ["s3"]}
            ],
            "sequences": [
                {"id": "s1", "fromId": "start", "toId": "call"},
                {"id": "s2", "fromId": "call", "toId": "note"},
                {"id": "s3", "fromId": "note", "toId": "end"}
            ]
        })
    }

    fn job_id(outbox: &[InstanceCommand]) -> String {
        match &outbox[0] {
            InstanceCommand::JobScheduled { job } => job.job_id.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_service_task_commit() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("call");

        let (_, outbox) = h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        let id = job_id(&outbox);
        if let InstanceCommand::JobScheduled { job } = &outbox[0] {
            assert_eq!(job.action.as_deref(), Some("svc.call"));
        }
        assert_eq!(model.state(), ElementState::Waiting);

        let (outcome, outbox) = h.dispatch(
            &mut model,
            ElementCommand::CommitJob {
                job_id: id.clone(),
                result: json!({"ok": true}),
            },
        );
        assert!(matches!(outcome, DispatchOutcome::Handled(_)));
        assert_eq!(model.state(), ElementState::Completed);
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox[0], InstanceCommand::JobCompleted { job_id: id });
        assert!(matches!(outbox[1], InstanceCommand::ContextAdd { .. }));
        assert_eq!(
            outbox[2],
            InstanceCommand::ActivateNext {
                element_id: "call".to_string()
            }
        );
        assert_eq!(model.context()["jobs"][0]["status"], "done");
    }

    #[test]
    fn test_service_task_fail_routes_to_boundary() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("call");
        let (_, outbox) = h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        let id = job_id(&outbox);

        let (_, outbox) = h.dispatch(
            &mut model,
            ElementCommand::FailJob {
                job_id: id,
                error: json!({"code": 500}),
            },
        );
        assert_eq!(model.state(), ElementState::Failed);
        assert!(matches!(
            outbox.last(),
            Some(InstanceCommand::ActivateBoundary { .. })
        ));
    }

    #[test]
    fn test_foreign_job_rejected() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("call");
        h.dispatch(&mut model, ElementCommand::Activate { previous: None });

        let (outcome, outbox) = h.dispatch(
            &mut model,
            ElementCommand::CommitJob {
                job_id: "other".to_string(),
                result: Value::Null,
            },
        );
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));
        assert!(outbox.is_empty());
        assert_eq!(model.state(), ElementState::Waiting);
    }

    #[test]
    fn test_completed_task_ignores_activate() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("note");
        assert_eq!(model.element_type(), ElementType::SimpleTask);

        let (_, outbox) = h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        assert_eq!(model.state(), ElementState::Completed);
        assert_eq!(outbox.len(), 2);

        let (outcome, outbox) = h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert!(outbox.is_empty());
    }
}
