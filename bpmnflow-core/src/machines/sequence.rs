//! Sequence machine.
//!
//! Sequences are activated like any other element so joins can tell which
//! edge a token arrived on. A conditional sequence only passes when its
//! expression holds; a default sequence always passes.

use super::common_events;
use crate::command::InstanceCommand;
use crate::error::CoreError;
use crate::event::DomainEvent;
use crate::expr::is_truthy;
use crate::graph::{ElementRef, ProcessDefinition};
use crate::machine::{CommandKind, ElementCommand, ElementState, ElementType, Machine, Scope};
use crate::model::ModelCtx;
use serde_json::Value;

pub const NAME: &str = "sequence";

pub fn machine() -> Machine {
    common_events(Machine::builder(NAME, element_type))
        .on_command(
            Scope::at(ElementType::StandardSequence, ElementState::Idle),
            CommandKind::Activate,
            pass,
        )
        .on_command(
            Scope::at(ElementType::DefaultSequence, ElementState::Idle),
            CommandKind::Activate,
            pass,
        )
        .on_command(
            Scope::at(ElementType::ConditionalSequence, ElementState::Idle),
            CommandKind::Activate,
            guarded,
        )
        .build()
}

fn element_type(graph: &ProcessDefinition, element: ElementRef<'_>) -> ElementType {
    let ElementRef::Sequence(s) = element else {
        return ElementType::StandardSequence;
    };
    let is_default = graph
        .element(&s.from_id)
        .and_then(|from| from.default_sequence())
        .map(|d| d == s.id)
        .unwrap_or(false);

    if is_default {
        ElementType::DefaultSequence
    } else if s.is_conditional() {
        ElementType::ConditionalSequence
    } else {
        ElementType::StandardSequence
    }
}

fn pass(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    ctx.activated(previous.clone());
    ctx.complete(Value::Null);
    Ok(())
}

fn guarded(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    let expression = match ctx.element()? {
        ElementRef::Sequence(s) => s.expression.clone(),
        _ => None,
    };
    ctx.activated(previous.clone());

    let holds = match expression {
        Some(expr) => match ctx.evaluate(&expr) {
            Ok(value) => is_truthy(&value),
            Err(e) => {
                tracing::warn!("Condition on {} failed to evaluate: {}", ctx.uid(), e);
                false
            }
        },
        None => true,
    };

    if holds {
        ctx.complete(Value::Null);
    } else {
        tracing::debug!("Condition on {} does not hold; flow stops here", ctx.uid());
        ctx.apply(DomainEvent::ElementCompleted {
            output: Value::Null,
        });
        ctx.send(InstanceCommand::DeactivateElement {
            element_id: ctx.uid(),
        });
        ctx.send(InstanceCommand::CheckCompleted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::testing::Harness;
    use serde_json::json;

    fn graph() -> Value {
        json!({
            "processId": "p",
            "tasks": [{"id": "t", "outgoing": ["big", "small", "other"], "default": "other"}],
            "events": [{"id": "end", "position": "end", "incoming": ["big", "small", "other"]}],
            "sequences": [
                {"id": "big", "type": "conditional", "fromId": "t", "toId": "end",
                 "expression": "amount > 100"},
                {"id": "small", "type": "conditional", "fromId": "t", "toId": "end",
                 "expression": "amount <= 100"},
                {"id": "other", "fromId": "t", "toId": "end"}
            ]
        })
    }

    #[test]
    fn test_types() {
        let h = Harness::new(graph(), json!({}));
        assert_eq!(h.spawn("big").element_type(), ElementType::ConditionalSequence);
        assert_eq!(h.spawn("other").element_type(), ElementType::DefaultSequence);
    }

    #[test]
    fn test_conditional_sequence() {
        let h = Harness::new(graph(), json!({"amount": 150}));

        let mut big = h.spawn("big");
        let (_, outbox) = h.dispatch(&mut big, ElementCommand::Activate { previous: None });
        assert_eq!(
            outbox,
            vec![InstanceCommand::ActivateNext {
                element_id: "big".to_string()
            }]
        );

        let mut small = h.spawn("small");
        let (_, outbox) = h.dispatch(&mut small, ElementCommand::Activate { previous: None });
        assert_eq!(
            outbox,
            vec![
                InstanceCommand::DeactivateElement {
                    element_id: "small".to_string()
                },
                InstanceCommand::CheckCompleted
            ]
        );
    }
}
