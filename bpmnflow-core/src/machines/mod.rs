//! Built-in element machines.

pub mod event;
pub mod gateway;
pub mod sequence;
pub mod task;

use crate::event::{DomainEvent, EventKind};
use crate::graph::{ElementRef, GatewayType};
use crate::machine::{ElementState, Machine, MachineBuilder, Scope};
use crate::model::ElementModel;
use serde_json::Value;

/// Every built-in machine.
pub fn all() -> Vec<Machine> {
    vec![
        task::machine(),
        event::machine(),
        gateway::exclusive(),
        gateway::parallel(),
        sequence::machine(),
    ]
}

/// Name of the machine that runs a graph element.
pub fn machine_for(element: ElementRef<'_>) -> &'static str {
    match element {
        ElementRef::Task(_) => task::NAME,
        ElementRef::Event(_) => event::NAME,
        ElementRef::Gateway(g) => match g.gateway_type {
            GatewayType::Exclusive => gateway::EXCLUSIVE,
            GatewayType::Parallel => gateway::PARALLEL,
        },
        ElementRef::Sequence(_) => sequence::NAME,
    }
}

/// Registers the event rules every element shares.
pub(crate) fn common_events(builder: MachineBuilder) -> MachineBuilder {
    let global = Scope::global();
    builder
        .on_event(global, EventKind::ElementActivated, on_activated)
        .on_event(global, EventKind::IncomingRecorded, on_incoming)
        .on_event(global, EventKind::JobCreated, on_job_created)
        .on_event(global, EventKind::JobCommitted, on_job_committed)
        .on_event(global, EventKind::JobFailed, on_job_failed)
        .on_event(global, EventKind::ElementWaiting, on_waiting)
        .on_event(global, EventKind::EventRaised, on_raised)
        .on_event(global, EventKind::EventThrown, on_thrown)
        .on_event(global, EventKind::ElementCompleted, on_completed)
        .on_event(global, EventKind::ElementFailed, on_failed)
}

fn on_activated(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::ElementActivated { previous, context } = event {
        model.set_state(ElementState::Activated);
        model.set_context("data", context.clone());
        if let Some(previous) = previous {
            model.set_context("previous", Value::String(previous.clone()));
        }
    }
}

fn on_incoming(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::IncomingRecorded { previous } = event {
        model.push_context("incoming", Value::String(previous.clone()));
    }
}

fn on_job_created(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::JobCreated { job } = event {
        model.push_context(
            "jobs",
            serde_json::json!({ "job_id": job.job_id, "status": job.status }),
        );
        model.set_state(ElementState::Waiting);
    }
}

fn on_job_committed(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::JobCommitted { job_id, result } = event {
        mark_job(model, job_id, "done");
        model.set_context("result", result.clone());
    }
}

fn on_job_failed(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::JobFailed { job_id, error } = event {
        mark_job(model, job_id, "error");
        model.set_context("error", error.clone());
    }
}

fn on_waiting(model: &mut ElementModel, _: &DomainEvent) {
    model.set_state(ElementState::Waiting);
}

fn on_raised(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::EventRaised { payload } = event {
        model.set_context("payload", payload.clone());
    }
}

fn on_thrown(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::EventThrown { payload, .. } = event {
        model.set_context("payload", payload.clone());
    }
}

fn on_completed(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::ElementCompleted { output } = event {
        model.set_state(ElementState::Completed);
        if !output.is_null() {
            model.set_context("output", output.clone());
        }
    }
}

fn on_failed(model: &mut ElementModel, event: &DomainEvent) {
    if let DomainEvent::ElementFailed { error } = event {
        model.set_state(ElementState::Failed);
        model.set_context("error", error.clone());
    }
}

/// Returns true if the model created the job.
pub(crate) fn owns_job(model: &ElementModel, job_id: &str) -> bool {
    model
        .context()
        .get("jobs")
        .and_then(Value::as_array)
        .map(|jobs| jobs.iter().any(|j| j["job_id"] == job_id))
        .unwrap_or(false)
}

fn mark_job(model: &mut ElementModel, job_id: &str, status: &str) {
    let mut jobs = model
        .context()
        .get("jobs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for job in jobs.iter_mut().filter(|j| j["job_id"] == job_id) {
        job["status"] = Value::String(status.to_string());
    }
    model.set_context("jobs", Value::Array(jobs));
}

/// Reads the ids a gateway has already seen.
pub(crate) fn incoming_seen(model: &ElementModel) -> Vec<String> {
    model
        .context()
        .get("incoming")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::command::InstanceCommand;
    use crate::event::{ModelMeta, TimeUuidGenerator};
    use crate::expr::ContextExpr;
    use crate::graph::ProcessDefinition;
    use crate::machine::{ElementCommand, MachineRegistry};
    use crate::model::{DispatchOutcome, ElementModel, Env};
    use serde_json::Value;

    /// Minimal harness that drives a single model outside an instance.
    pub struct Harness {
        pub def: ProcessDefinition,
        pub registry: MachineRegistry,
        pub evaluator: ContextExpr,
        pub clock: TimeUuidGenerator,
        pub data: Value,
    }

    impl Harness {
        pub fn new(graph: Value, data: Value) -> Self {
            Self {
                def: ProcessDefinition::from_json(&graph).unwrap(),
                registry: MachineRegistry::standard(),
                evaluator: ContextExpr::new(),
                clock: TimeUuidGenerator::new(),
                data,
            }
        }

        pub fn spawn(&self, id: &str) -> ElementModel {
            let element = self.def.element(id).unwrap();
            let machine = self.registry.get(super::machine_for(element)).unwrap();
            ElementModel::spawn(machine, &self.def, element, ModelMeta::default(), Value::Null)
        }

        pub fn dispatch(
            &self,
            model: &mut ElementModel,
            command: ElementCommand,
        ) -> (DispatchOutcome, Vec<InstanceCommand>) {
            let mut env = Env {
                graph: &self.def,
                evaluator: &self.evaluator,
                clock: &self.clock,
                data: &self.data,
                version: 0,
                outbox: Vec::new(),
            };
            let outcome = model.dispatch(&command, &mut env);
            (outcome, env.outbox)
        }
    }
}
