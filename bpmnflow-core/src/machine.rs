//! Element machine tables.
//!
//! A [`Machine`] is an immutable template shared by every model of one
//! element category. It maps `(type, state, message)` to a handler. Rules can
//! be registered at four scopes and are resolved in this order:
//!
//! 1. `(type, state)`
//! 2. `(type)` for any state
//! 3. `(state)` for any type
//! 4. global
//!
//! The first scope that defines a rule for the message wins. No rule at any
//! scope is not an error: the model simply ignores the message.

use crate::error::CoreError;
use crate::event::{DomainEvent, EventKind};
use crate::graph::{ElementRef, ProcessDefinition};
use crate::model::{ElementModel, ModelCtx};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Element states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    Idle,
    Activated,
    /// Blocked on something external. Idle detection looks for this state.
    Waiting,
    Completed,
    Failed,
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementState::Idle => "idle",
            ElementState::Activated => "activated",
            ElementState::Waiting => "waiting",
            ElementState::Completed => "completed",
            ElementState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Runtime refinement of a graph element's category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    ServiceTask,
    BusinessRuleTask,
    SendTask,
    SimpleTask,
    DefaultStart,
    MessageStart,
    Catching,
    Throwing,
    DefaultEnd,
    Boundary,
    Exclusive,
    Parallel,
    StandardSequence,
    ConditionalSequence,
    DefaultSequence,
}

impl ElementType {
    /// Returns true for task types that hand work to the outside.
    pub fn produces_jobs(&self) -> bool {
        matches!(
            self,
            ElementType::ServiceTask | ElementType::BusinessRuleTask | ElementType::SendTask
        )
    }
}

/// Messages an element model understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementCommand {
    Activate { previous: Option<String> },
    Raise { payload: Value },
    CommitJob { job_id: String, result: Value },
    FailJob { job_id: String, error: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Activate,
    Raise,
    CommitJob,
    FailJob,
}

impl ElementCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ElementCommand::Activate { .. } => CommandKind::Activate,
            ElementCommand::Raise { .. } => CommandKind::Raise,
            ElementCommand::CommitJob { .. } => CommandKind::CommitJob,
            ElementCommand::FailJob { .. } => CommandKind::FailJob,
        }
    }
}

/// Derives an element's runtime type from the graph.
pub type TypeInit = fn(&ProcessDefinition, ElementRef<'_>) -> ElementType;

/// Command handler. May apply events to the model and send instance commands.
pub type CommandHandler = fn(&mut ModelCtx<'_, '_>, &ElementCommand) -> Result<(), CoreError>;

/// Event handler. Pure state change on the model.
pub type EventHandler = fn(&mut ElementModel, &DomainEvent);

/// Where a rule is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub element_type: Option<ElementType>,
    pub state: Option<ElementState>,
}

impl Scope {
    pub fn at(element_type: ElementType, state: ElementState) -> Self {
        Self {
            element_type: Some(element_type),
            state: Some(state),
        }
    }

    pub fn of_type(element_type: ElementType) -> Self {
        Self {
            element_type: Some(element_type),
            state: None,
        }
    }

    pub fn in_state(state: ElementState) -> Self {
        Self {
            element_type: None,
            state: Some(state),
        }
    }

    pub fn global() -> Self {
        Self {
            element_type: None,
            state: None,
        }
    }
}

/// Which scope resolved a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    TypeState,
    Type,
    State,
    Global,
}

/// An immutable machine template.
pub struct Machine {
    name: &'static str,
    initial_state: ElementState,
    init: TypeInit,
    commands: HashMap<(Scope, CommandKind), CommandHandler>,
    events: HashMap<(Scope, EventKind), EventHandler>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("commands", &self.commands.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Machine {
    pub fn builder(name: &'static str, init: TypeInit) -> MachineBuilder {
        MachineBuilder {
            machine: Machine {
                name,
                initial_state: ElementState::Idle,
                init,
                commands: HashMap::new(),
                events: HashMap::new(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn initial_state(&self) -> ElementState {
        self.initial_state
    }

    /// Derives the runtime type for a graph element.
    pub fn element_type(&self, graph: &ProcessDefinition, element: ElementRef<'_>) -> ElementType {
        (self.init)(graph, element)
    }

    pub fn resolve_command(
        &self,
        element_type: ElementType,
        state: ElementState,
        kind: CommandKind,
    ) -> Option<(Level, CommandHandler)> {
        chase(element_type, state)
            .find_map(|(level, scope)| self.commands.get(&(scope, kind)).map(|h| (level, *h)))
    }

    pub fn resolve_event(
        &self,
        element_type: ElementType,
        state: ElementState,
        kind: EventKind,
    ) -> Option<(Level, EventHandler)> {
        chase(element_type, state)
            .find_map(|(level, scope)| self.events.get(&(scope, kind)).map(|h| (level, *h)))
    }
}

fn chase(
    element_type: ElementType,
    state: ElementState,
) -> impl Iterator<Item = (Level, Scope)> {
    [
        (Level::TypeState, Scope::at(element_type, state)),
        (Level::Type, Scope::of_type(element_type)),
        (Level::State, Scope::in_state(state)),
        (Level::Global, Scope::global()),
    ]
    .into_iter()
}

/// Builder for [`Machine`].
pub struct MachineBuilder {
    machine: Machine,
}

impl MachineBuilder {
    pub fn initial(mut self, state: ElementState) -> Self {
        self.machine.initial_state = state;
        self
    }

    pub fn on_command(mut self, scope: Scope, kind: CommandKind, handler: CommandHandler) -> Self {
        self.machine.commands.insert((scope, kind), handler);
        self
    }

    pub fn on_event(mut self, scope: Scope, kind: EventKind, handler: EventHandler) -> Self {
        self.machine.events.insert((scope, kind), handler);
        self
    }

    pub fn build(self) -> Machine {
        self.machine
    }
}

/// Machine templates by name.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: HashMap<String, Arc<Machine>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in machine.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for machine in crate::machines::all() {
            registry.register(machine);
        }
        registry
    }

    pub fn register(&mut self, machine: Machine) {
        self.machines
            .insert(machine.name().to_string(), Arc::new(machine));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Machine>, CoreError> {
        self.machines
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::MachineNotFound {
                machine: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.machines.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut ModelCtx<'_, '_>, _: &ElementCommand) -> Result<(), CoreError> {
        Ok(())
    }

    fn other(_: &mut ModelCtx<'_, '_>, _: &ElementCommand) -> Result<(), CoreError> {
        Err(CoreError::HandlerFailed {
            reason: "marker".to_string(),
        })
    }

    fn simple(_: &ProcessDefinition, _: ElementRef<'_>) -> ElementType {
        ElementType::SimpleTask
    }

    #[test]
    fn test_four_level_chase() {
        let machine = Machine::builder("test", simple)
            .on_command(
                Scope::at(ElementType::Parallel, ElementState::Activated),
                CommandKind::Activate,
                noop,
            )
            .on_command(Scope::of_type(ElementType::Parallel), CommandKind::Activate, other)
            .on_command(Scope::in_state(ElementState::Idle), CommandKind::Raise, noop)
            .on_command(Scope::global(), CommandKind::Raise, other)
            .build();

        let (level, _) = machine
            .resolve_command(ElementType::Parallel, ElementState::Activated, CommandKind::Activate)
            .unwrap();
        assert_eq!(level, Level::TypeState);

        let (level, _) = machine
            .resolve_command(ElementType::Parallel, ElementState::Completed, CommandKind::Activate)
            .unwrap();
        assert_eq!(level, Level::Type);

        let (level, _) = machine
            .resolve_command(ElementType::Parallel, ElementState::Idle, CommandKind::Raise)
            .unwrap();
        assert_eq!(level, Level::State);

        let (level, _) = machine
            .resolve_command(ElementType::Exclusive, ElementState::Waiting, CommandKind::Raise)
            .unwrap();
        assert_eq!(level, Level::Global);

        assert!(machine
            .resolve_command(ElementType::Exclusive, ElementState::Idle, CommandKind::CommitJob)
            .is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = MachineRegistry::standard();
        assert!(registry.contains("task"));
        assert!(registry.contains("event"));
        assert!(registry.contains("exclusiveGateway"));
        assert!(registry.contains("parallelGateway"));
        assert!(registry.contains("sequence"));

        let err = registry.get("subProcess").unwrap_err();
        assert!(err.is_structural());
    }
}
