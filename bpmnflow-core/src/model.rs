//! Element models.
//!
//! An [`ElementModel`] is the live state of one graph element occurrence: a
//! reference to its machine template plus owned type, state, context and the
//! events produced since the last persist.
//!
//! The model context is a JSON object. `data` holds the scoped context
//! computed at spawn time; machines add their own accumulators (`jobs`,
//! `incoming`, `result`, `error`, `payload`).

use crate::command::InstanceCommand;
use crate::error::CoreError;
use crate::event::{DomainEvent, ModelMeta, PersistedEvent, TimeUuidGenerator};
use crate::expr::Evaluator;
use crate::graph::{ElementRef, ProcessDefinition};
use crate::machine::{ElementCommand, ElementState, ElementType, Level, Machine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Result of dispatching a command to a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(Level),
    /// No rule at any scope.
    Unhandled,
    /// A rule matched but its handler returned an error.
    Failed(String),
}

/// What a handler can reach outside its own model.
pub struct Env<'a> {
    pub graph: &'a ProcessDefinition,
    pub evaluator: &'a dyn Evaluator,
    pub clock: &'a TimeUuidGenerator,
    /// Accumulated instance data.
    pub data: &'a Value,
    /// Version stamped on jobs and throwing events created now.
    pub version: u64,
    pub outbox: Vec<InstanceCommand>,
}

/// Handler view of a model and its environment.
pub struct ModelCtx<'a, 'b> {
    pub model: &'a mut ElementModel,
    env: &'a mut Env<'b>,
}

impl<'a, 'b> ModelCtx<'a, 'b> {
    pub fn uid(&self) -> String {
        self.model.uid.clone()
    }

    /// The graph element this model runs for.
    pub fn element(&self) -> Result<ElementRef<'b>, CoreError> {
        let graph: &'b ProcessDefinition = self.env.graph;
        graph.require(&self.model.uid)
    }

    pub fn graph(&self) -> &'b ProcessDefinition {
        self.env.graph
    }

    /// Applies a new event to the model and records it.
    pub fn apply(&mut self, event: DomainEvent) {
        self.model.record(event, self.env.clock);
    }

    /// Sends a command to the owning instance.
    pub fn send(&mut self, command: InstanceCommand) {
        self.env.outbox.push(command);
    }

    /// Evaluates an expression against the instance data.
    pub fn evaluate(&self, expression: &str) -> Result<Value, CoreError> {
        self.env.evaluator.evaluate(expression, self.env.data)
    }

    pub fn version(&self) -> u64 {
        self.env.version
    }

    /// Records activation with the model's current scoped context.
    pub fn activated(&mut self, previous: Option<String>) {
        let context = self.model.data().clone();
        self.apply(DomainEvent::ElementActivated { previous, context });
    }

    /// Completes the element and moves the flow past it.
    pub fn complete(&mut self, output: Value) {
        self.apply(DomainEvent::ElementCompleted { output });
        self.send(InstanceCommand::ActivateNext {
            element_id: self.uid(),
        });
    }
}

/// Saved form of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    #[serde(rename = "machineName")]
    pub machine: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub state: ElementState,
    pub context: Value,
    pub meta: ModelMeta,
}

/// A live element occurrence.
#[derive(Debug)]
pub struct ElementModel {
    uid: String,
    machine: Arc<Machine>,
    element_type: ElementType,
    state: ElementState,
    context: Value,
    meta: ModelMeta,
    local_events: Vec<PersistedEvent>,
}

impl ElementModel {
    /// Creates a model for a graph element, seeded with its scoped context.
    pub fn spawn(
        machine: Arc<Machine>,
        graph: &ProcessDefinition,
        element: ElementRef<'_>,
        meta: ModelMeta,
        scoped: Value,
    ) -> Self {
        let element_type = machine.element_type(graph, element);
        let state = machine.initial_state();
        Self {
            uid: element.id().to_string(),
            machine,
            element_type,
            state,
            context: json!({ "data": scoped }),
            meta,
            local_events: Vec::new(),
        }
    }

    /// Rebuilds a model from its saved form.
    pub fn restore(uid: &str, machine: Arc<Machine>, snapshot: &ModelSnapshot) -> Self {
        Self {
            uid: uid.to_string(),
            machine,
            element_type: snapshot.element_type,
            state: snapshot.state,
            context: snapshot.context.clone(),
            meta: snapshot.meta.clone(),
            local_events: Vec::new(),
        }
    }

    /// Resolves and runs the command handler for the current type and state.
    pub fn dispatch(&mut self, command: &ElementCommand, env: &mut Env<'_>) -> DispatchOutcome {
        let resolved =
            self.machine
                .resolve_command(self.element_type, self.state, command.kind());
        let (level, handler) = match resolved {
            Some(found) => found,
            None => {
                tracing::debug!(
                    "No handler for {:?} on {} ({:?}/{})",
                    command.kind(),
                    self.uid,
                    self.element_type,
                    self.state
                );
                return DispatchOutcome::Unhandled;
            }
        };

        let mut ctx = ModelCtx { model: self, env };
        match handler(&mut ctx, command) {
            Ok(()) => DispatchOutcome::Handled(level),
            Err(e) => {
                tracing::warn!("Handler for {:?} on {} failed: {}", command.kind(), self.uid, e);
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    /// Applies a newly produced event, stamping it with a fresh key.
    pub fn record(&mut self, event: DomainEvent, clock: &TimeUuidGenerator) -> bool {
        let persisted = PersistedEvent::new(
            clock.next(),
            self.machine.name(),
            &self.uid,
            self.meta.clone(),
            event,
        );
        self.apply(persisted)
    }

    /// Applies an event. Replayed events change state but are not recorded.
    pub fn apply(&mut self, event: PersistedEvent) -> bool {
        let resolved = self
            .machine
            .resolve_event(self.element_type, self.state, event.event.kind());
        let Some((_, handler)) = resolved else {
            tracing::debug!(
                "No event rule for {} on {} ({:?}/{})",
                event.event.name(),
                self.uid,
                self.element_type,
                self.state
            );
            return false;
        };

        handler(self, &event.event);
        if !event.replayed {
            self.local_events.push(event);
        }
        true
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn machine_name(&self) -> &'static str {
        self.machine.name()
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn set_state(&mut self, state: ElementState) {
        self.state = state;
    }

    pub fn context(&self) -> &Value {
        &self.context
    }

    /// Sets a top-level context key.
    pub fn set_context(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.context {
            map.insert(key.to_string(), value);
        }
    }

    /// Appends to a context array, creating it if needed.
    pub fn push_context(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.context {
            match map.entry(key.to_string()).or_insert_with(|| json!([])) {
                Value::Array(items) => items.push(value),
                other => *other = json!([value]),
            }
        }
    }

    /// Scoped context.
    pub fn data(&self) -> &Value {
        self.context.get("data").unwrap_or(&Value::Null)
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn local_events(&self) -> &[PersistedEvent] {
        &self.local_events
    }

    pub fn take_local_events(&mut self) -> Vec<PersistedEvent> {
        std::mem::take(&mut self.local_events)
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            machine: self.machine.name().to_string(),
            element_type: self.element_type,
            state: self.state,
            context: self.context.clone(),
            meta: self.meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TimeUuid;
    use crate::expr::ContextExpr;
    use crate::graph::fixtures;
    use crate::machine::MachineRegistry;

    fn task_model(def: &ProcessDefinition, registry: &MachineRegistry) -> ElementModel {
        let element = def.element("price").unwrap();
        ElementModel::spawn(
            registry.get("task").unwrap(),
            def,
            element,
            ModelMeta::default(),
            json!({"order": 1}),
        )
    }

    #[test]
    fn test_dispatch_records_events() {
        let def = ProcessDefinition::from_json(&fixtures::service_flow()).unwrap();
        let registry = MachineRegistry::standard();
        let evaluator = ContextExpr::new();
        let clock = TimeUuidGenerator::new();
        let data = json!({});
        let mut env = Env {
            graph: &def,
            evaluator: &evaluator,
            clock: &clock,
            data: &data,
            version: 0,
            outbox: Vec::new(),
        };

        let mut model = task_model(&def, &registry);
        assert_eq!(model.element_type(), ElementType::ServiceTask);
        assert_eq!(model.state(), ElementState::Idle);

        let outcome = model.dispatch(&ElementCommand::Activate { previous: None }, &mut env);
        assert!(matches!(outcome, DispatchOutcome::Handled(_)));
        assert_eq!(model.state(), ElementState::Waiting);
        assert_eq!(model.local_events().len(), 2);
        assert!(matches!(
            env.outbox.as_slice(),
            [InstanceCommand::JobScheduled { .. }]
        ));

        let keys: Vec<TimeUuid> = model.local_events().iter().map(|e| e.timeuuid).collect();
        assert!(keys[0] < keys[1]);
    }

    #[test]
    fn test_unknown_message_is_unhandled() {
        let def = ProcessDefinition::from_json(&fixtures::service_flow()).unwrap();
        let registry = MachineRegistry::standard();
        let evaluator = ContextExpr::new();
        let clock = TimeUuidGenerator::new();
        let data = json!({});
        let mut env = Env {
            graph: &def,
            evaluator: &evaluator,
            clock: &clock,
            data: &data,
            version: 0,
            outbox: Vec::new(),
        };

        let mut model = task_model(&def, &registry);
        let outcome = model.dispatch(
            &ElementCommand::Raise {
                payload: Value::Null,
            },
            &mut env,
        );
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert!(model.local_events().is_empty());
        assert!(env.outbox.is_empty());
    }

    #[test]
    fn test_replayed_events_not_recorded() {
        let def = ProcessDefinition::from_json(&fixtures::service_flow()).unwrap();
        let registry = MachineRegistry::standard();
        let mut model = task_model(&def, &registry);

        let event = PersistedEvent::new(
            TimeUuid::MIN,
            "task",
            "price",
            ModelMeta::default(),
            DomainEvent::ElementActivated {
                previous: None,
                context: json!({"order": 2}),
            },
        )
        .into_replayed();

        assert!(model.apply(event));
        assert_eq!(model.state(), ElementState::Activated);
        assert_eq!(model.data(), &json!({"order": 2}));
        assert!(model.local_events().is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let def = ProcessDefinition::from_json(&fixtures::service_flow()).unwrap();
        let registry = MachineRegistry::standard();
        let mut model = task_model(&def, &registry);
        model.push_context("jobs", json!({"job_id": "j1"}));

        let snap = model.snapshot();
        assert_eq!(snap.machine, "task");
        let restored = ElementModel::restore("price", registry.get("task").unwrap(), &snap);
        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.uid(), "price");
    }
}
