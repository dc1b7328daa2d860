//! Event machine.
//!
//! Start, intermediate, end and boundary events. Catching events wait for a
//! `Raise`; throwing events publish their scoped context as a business event.

use super::common_events;
use crate::command::InstanceCommand;
use crate::error::CoreError;
use crate::event::DomainEvent;
use crate::graph::{ElementRef, EventPosition, EventType, ProcessDefinition};
use crate::machine::{CommandKind, ElementCommand, ElementState, ElementType, Machine, Scope};
use crate::model::ModelCtx;
use serde_json::Value;

pub const NAME: &str = "event";

pub fn machine() -> Machine {
    use ElementState::{Idle, Waiting};
    use ElementType::*;

    common_events(Machine::builder(NAME, element_type))
        .on_command(Scope::at(DefaultStart, Idle), CommandKind::Activate, start)
        .on_command(Scope::at(DefaultStart, Idle), CommandKind::Raise, catch)
        .on_command(Scope::at(MessageStart, Idle), CommandKind::Activate, wait)
        .on_command(Scope::at(MessageStart, Idle), CommandKind::Raise, catch)
        .on_command(Scope::at(MessageStart, Waiting), CommandKind::Raise, catch)
        .on_command(Scope::at(Catching, Idle), CommandKind::Activate, wait)
        .on_command(Scope::at(Catching, Waiting), CommandKind::Raise, catch)
        .on_command(Scope::at(Boundary, Idle), CommandKind::Raise, catch)
        .on_command(Scope::at(Throwing, Idle), CommandKind::Activate, throw)
        .on_command(Scope::at(DefaultEnd, Idle), CommandKind::Activate, end)
        .build()
}

fn element_type(_: &ProcessDefinition, element: ElementRef<'_>) -> ElementType {
    let ElementRef::Event(e) = element else {
        return ElementType::DefaultEnd;
    };
    match e.position {
        EventPosition::Start if e.event_type == EventType::Default && e.name.is_none() => {
            ElementType::DefaultStart
        }
        EventPosition::Start => ElementType::MessageStart,
        EventPosition::Intermediate if e.is_throwing() => ElementType::Throwing,
        EventPosition::Intermediate => ElementType::Catching,
        EventPosition::End if e.is_throwing() => ElementType::Throwing,
        EventPosition::End => ElementType::DefaultEnd,
        EventPosition::Boundary => ElementType::Boundary,
    }
}

fn start(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
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

fn wait(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    ctx.activated(previous.clone());
    ctx.apply(DomainEvent::ElementWaiting);
    Ok(())
}

fn catch(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Raise { payload } = command else {
        return Ok(());
    };
    if ctx.model.state() == ElementState::Idle {
        ctx.activated(None);
    }
    ctx.apply(DomainEvent::EventRaised {
        payload: payload.clone(),
    });
    ctx.send(InstanceCommand::ContextAdd {
        element_id: ctx.uid(),
        input: Some(payload.clone()),
    });
    ctx.complete(payload.clone());
    Ok(())
}

fn throw(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    let name = match ctx.element()? {
        ElementRef::Event(e) => e.name.clone().unwrap_or_else(|| e.id.clone()),
        other => other.id().to_string(),
    };
    ctx.activated(previous.clone());

    let payload = ctx.model.data().clone();
    ctx.apply(DomainEvent::EventThrown {
        name: name.clone(),
        payload: payload.clone(),
    });
    ctx.send(InstanceCommand::EmitThrowing {
        element_id: ctx.uid(),
        name,
        payload: payload.clone(),
    });
    ctx.complete(payload);
    Ok(())
}

fn end(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    ctx.activated(previous.clone());
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
                {"id": "wait", "position": "intermediate", "type": "message", "name": "paid",
                 "incoming": ["s1"], "outgoing": ["s2"]},
                {"id": "notify", "position": "intermediate", "type": "message",
                 "direction": "throwing", "name": "shipped", "incoming": ["s2"], "outgoing": ["s3"]},
                {"id": "end", "position": "end", "incoming": ["s3"]}
            ],
            "sequences": [
                {"id": "s1", "fromId": "start", "toId": "wait"},
                {"id": "s2", "fromId": "wait", "toId": "notify"},
                {"id": "s3", "fromId": "notify", "toId": "end"}
            ]
        })
    }

    #[test]
    fn test_types() {
        let h = Harness::new(graph(), json!({}));
        assert_eq!(h.spawn("start").element_type(), ElementType::DefaultStart);
        assert_eq!(h.spawn("wait").element_type(), ElementType::Catching);
        assert_eq!(h.spawn("notify").element_type(), ElementType::Throwing);
        assert_eq!(h.spawn("end").element_type(), ElementType::DefaultEnd);
    }

    #[test]
    fn test_catching_waits_for_raise() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("wait");

        let (_, outbox) = h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        assert_eq!(model.state(), ElementState::Waiting);
        assert!(outbox.is_empty());

        let (_, outbox) = h.dispatch(
            &mut model,
            ElementCommand::Raise {
                payload: json!({"amount": 3}),
            },
        );
        assert_eq!(model.state(), ElementState::Completed);
        assert_eq!(model.context()["payload"], json!({"amount": 3}));
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_throwing_emits() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("notify");

        let (_, outbox) = h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        assert!(matches!(
            &outbox[0],
            InstanceCommand::EmitThrowing { name, .. } if name == "shipped"
        ));
        assert_eq!(model.state(), ElementState::Completed);
    }

    #[test]
    fn test_completed_event_ignores_raise() {
        let h = Harness::new(graph(), json!({}));
        let mut model = h.spawn("start");
        h.dispatch(&mut model, ElementCommand::Activate { previous: None });
        assert_eq!(model.state(), ElementState::Completed);

        let (outcome, _) = h.dispatch(
            &mut model,
            ElementCommand::Raise {
                payload: Value::Null,
            },
        );
        assert_eq!(outcome, DispatchOutcome::Unhandled);
    }
}
