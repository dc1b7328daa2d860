//! Gateway machines.
//!
//! An exclusive gateway with one outgoing sequence passes straight through;
//! with several it asks the instance to pick one (`conditional.next`).
//!
//! A parallel gateway joins: it stays `activated` while collecting the
//! distinct incoming sequence ids it has been activated from, and completes
//! once every declared incoming sequence has been seen. Forks are joins with
//! at most one incoming sequence, so they complete on first activation.

use super::{common_events, incoming_seen};
use crate::command::InstanceCommand;
use crate::error::CoreError;
use crate::event::DomainEvent;
use crate::graph::{ElementRef, ProcessDefinition};
use crate::machine::{CommandKind, ElementCommand, ElementState, ElementType, Machine, Scope};
use crate::model::ModelCtx;
use serde_json::Value;

pub const EXCLUSIVE: &str = "exclusiveGateway";
pub const PARALLEL: &str = "parallelGateway";

pub fn exclusive() -> Machine {
    common_events(Machine::builder(EXCLUSIVE, exclusive_type))
        .on_command(
            Scope::at(ElementType::Exclusive, ElementState::Idle),
            CommandKind::Activate,
            route,
        )
        .build()
}

pub fn parallel() -> Machine {
    common_events(Machine::builder(PARALLEL, parallel_type))
        .on_command(
            Scope::at(ElementType::Parallel, ElementState::Idle),
            CommandKind::Activate,
            first_incoming,
        )
        .on_command(
            Scope::at(ElementType::Parallel, ElementState::Activated),
            CommandKind::Activate,
            join,
        )
        .on_command(
            Scope::of_type(ElementType::Parallel),
            CommandKind::Activate,
            ignore,
        )
        .build()
}

fn exclusive_type(_: &ProcessDefinition, _: ElementRef<'_>) -> ElementType {
    ElementType::Exclusive
}

fn parallel_type(_: &ProcessDefinition, _: ElementRef<'_>) -> ElementType {
    ElementType::Parallel
}

fn route(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    let outgoing = ctx.element()?.destinations().len();
    ctx.activated(previous.clone());

    if outgoing <= 1 {
        ctx.complete(Value::Null);
    } else {
        ctx.apply(DomainEvent::ElementCompleted {
            output: Value::Null,
        });
        ctx.send(InstanceCommand::ConditionalNext {
            element_id: ctx.uid(),
        });
    }
    Ok(())
}

fn first_incoming(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    ctx.activated(previous.clone());
    join(ctx, command)
}

fn join(ctx: &mut ModelCtx<'_, '_>, command: &ElementCommand) -> Result<(), CoreError> {
    let ElementCommand::Activate { previous } = command else {
        return Ok(());
    };
    let element = ctx.element()?;

    if let Some(previous) = previous {
        if !incoming_seen(ctx.model).contains(previous) {
            ctx.apply(DomainEvent::IncomingRecorded {
                previous: previous.clone(),
            });
        }
    }

    let seen = incoming_seen(ctx.model);
    let declared = element.incoming();
    if declared.iter().all(|id| seen.iter().any(|s| s == id)) {
        tracing::debug!("Gateway {} joined {} incoming", ctx.uid(), declared.len());
        ctx.complete(Value::Null);
    }
    Ok(())
}

fn ignore(ctx: &mut ModelCtx<'_, '_>, _: &ElementCommand) -> Result<(), CoreError> {
    tracing::debug!("Gateway {} already joined; ignoring activation", ctx.uid());
    Ok(())
}
