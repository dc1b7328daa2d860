//! Process graph types.
//!
//! Graphs are produced by an external BPMN parser and handed to the engine as
//! JSON:
//!
//! ```json
//! {
//!   "processId": "order",
//!   "events": [
//!     {"id": "start", "position": "start", "type": "message", "name": "order.placed", "outgoing": ["s1"]},
//!     {"id": "end", "position": "end", "incoming": ["s2"]}
//!   ],
//!   "tasks": [
//!     {"id": "price", "type": "serviceTask", "action": "pricing.calculate",
//!      "incoming": ["s1"], "outgoing": ["s2"],
//!      "output": {"expression": "price", "target": "price"}}
//!   ],
//!   "sequences": [
//!     {"id": "s1", "fromId": "start", "toId": "price"},
//!     {"id": "s2", "fromId": "price", "toId": "end"}
//!   ]
//! }
//! ```

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An expression mapping: evaluate `expression`, store under `target`.
///
/// Without a target the result is merged key by key, which only works for
/// object results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoMapping {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Sequence flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SequenceType {
    #[default]
    Standard,
    Conditional,
}

/// A sequence flow between two elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub id: String,
    #[serde(default, rename = "type")]
    pub sequence_type: SequenceType,
    pub from_id: String,
    pub to_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl Sequence {
    /// Returns true if the sequence only passes when its expression holds.
    pub fn is_conditional(&self) -> bool {
        self.sequence_type == SequenceType::Conditional || self.expression.is_some()
    }
}

/// Task kinds as tagged by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    #[default]
    Task,
    ServiceTask,
    BusinessRuleTask,
    SendTask,
    ReceiveTask,
    UserTask,
    ManualTask,
    ScriptTask,
}

/// A task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<IoMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<IoMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Service or message target for job-producing tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Decision reference for business rule tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPosition {
    Start,
    Intermediate,
    End,
    Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    #[default]
    Default,
    Message,
    Signal,
    Timer,
    Error,
    Escalation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventDirection {
    #[default]
    Catching,
    Throwing,
}

fn default_true() -> bool {
    true
}

/// An event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    /// Trigger name for catching events, business event name for throwing ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub position: EventPosition,
    #[serde(default, rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub direction: EventDirection,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<IoMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<IoMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to_ref: Option<String>,
    #[serde(default = "default_true")]
    pub interrupting: bool,
}

impl Event {
    /// Returns true for intermediate/end events that raise a business event.
    pub fn is_throwing(&self) -> bool {
        self.direction == EventDirection::Throwing && self.name.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GatewayType {
    Exclusive,
    Parallel,
}

/// A gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub id: String,
    #[serde(rename = "type")]
    pub gateway_type: GatewayType,
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Raw process graph as produced by the parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessGraphRaw {
    pub process_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub sequences: Vec<Sequence>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
}

/// Borrowed view of one graph element.
#[derive(Debug, Clone, Copy)]
pub enum ElementRef<'a> {
    Sequence(&'a Sequence),
    Task(&'a Task),
    Event(&'a Event),
    Gateway(&'a Gateway),
}

impl<'a> ElementRef<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            ElementRef::Sequence(s) => &s.id,
            ElementRef::Task(t) => &t.id,
            ElementRef::Event(e) => &e.id,
            ElementRef::Gateway(g) => &g.id,
        }
    }

    /// Destination ids: a sequence's single `toId`, otherwise `outgoing`.
    pub fn destinations(&self) -> Vec<&'a str> {
        match self {
            ElementRef::Sequence(s) => vec![s.to_id.as_str()],
            ElementRef::Task(t) => t.outgoing.iter().map(String::as_str).collect(),
            ElementRef::Event(e) => e.outgoing.iter().map(String::as_str).collect(),
            ElementRef::Gateway(g) => g.outgoing.iter().map(String::as_str).collect(),
        }
    }

    pub fn incoming(&self) -> Vec<&'a str> {
        match self {
            ElementRef::Sequence(s) => vec![s.from_id.as_str()],
            ElementRef::Task(t) => t.incoming.iter().map(String::as_str).collect(),
            ElementRef::Event(e) => e.incoming.iter().map(String::as_str).collect(),
            ElementRef::Gateway(g) => g.incoming.iter().map(String::as_str).collect(),
        }
    }

    pub fn input(&self) -> Option<&'a IoMapping> {
        match self {
            ElementRef::Task(t) => t.input.as_ref(),
            ElementRef::Event(e) => e.input.as_ref(),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&'a IoMapping> {
        match self {
            ElementRef::Task(t) => t.output.as_ref(),
            ElementRef::Event(e) => e.output.as_ref(),
            _ => None,
        }
    }

    pub fn default_sequence(&self) -> Option<&'a str> {
        match self {
            ElementRef::Task(t) => t.default.as_deref(),
            ElementRef::Gateway(g) => g.default.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Sequence(usize),
    Task(usize),
    Event(usize),
    Gateway(usize),
}

/// Validated and indexed process graph.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub process_id: String,
    pub version_id: String,
    index: HashMap<String, Slot>,
    pub raw: ProcessGraphRaw,
    pub checksum: String,
}

impl ProcessDefinition {
    /// Parses and validates a process graph from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: ProcessGraphRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Validates a raw graph and builds its element index.
    pub fn from_raw(raw: ProcessGraphRaw) -> Result<Self, CoreError> {
        if raw.process_id.is_empty() {
            return Err(invalid("processId must not be empty"));
        }

        let mut index = HashMap::new();
        let slots = raw
            .sequences
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), Slot::Sequence(i)))
            .chain(raw.tasks.iter().enumerate().map(|(i, t)| (t.id.as_str(), Slot::Task(i))))
            .chain(raw.events.iter().enumerate().map(|(i, e)| (e.id.as_str(), Slot::Event(i))))
            .chain(
                raw.gateways
                    .iter()
                    .enumerate()
                    .map(|(i, g)| (g.id.as_str(), Slot::Gateway(i))),
            );
        for (id, slot) in slots {
            if index.insert(id.to_string(), slot).is_some() {
                return Err(invalid(format!("duplicate element id '{}'", id)));
            }
        }

        let sequence_ids: HashSet<&str> = raw.sequences.iter().map(|s| s.id.as_str()).collect();

        for s in &raw.sequences {
            for end in [&s.from_id, &s.to_id] {
                match index.get(end) {
                    Some(Slot::Sequence(_)) | None => {
                        return Err(invalid(format!(
                            "sequence '{}' references unknown element '{}'",
                            s.id, end
                        )));
                    }
                    Some(_) => {}
                }
            }
            if s.sequence_type == SequenceType::Conditional && s.expression.is_none() {
                return Err(invalid(format!(
                    "conditional sequence '{}' has no expression",
                    s.id
                )));
            }
        }

        let adjacency = raw
            .tasks
            .iter()
            .map(|t| (&t.id, &t.incoming, &t.outgoing, t.default.as_ref()))
            .chain(
                raw.events
                    .iter()
                    .map(|e| (&e.id, &e.incoming, &e.outgoing, None)),
            )
            .chain(
                raw.gateways
                    .iter()
                    .map(|g| (&g.id, &g.incoming, &g.outgoing, g.default.as_ref())),
            );
        for (id, incoming, outgoing, default) in adjacency {
            for seq in incoming.iter().chain(outgoing.iter()) {
                if !sequence_ids.contains(seq.as_str()) {
                    return Err(invalid(format!(
                        "element '{}' references unknown sequence '{}'",
                        id, seq
                    )));
                }
            }
            if let Some(default) = default {
                if !outgoing.contains(default) {
                    return Err(invalid(format!(
                        "default sequence '{}' of '{}' is not an outgoing sequence",
                        default, id
                    )));
                }
            }
        }

        for e in raw.events.iter().filter(|e| e.position == EventPosition::Boundary) {
            match e.attached_to_ref.as_deref().and_then(|r| index.get(r)) {
                Some(Slot::Task(_)) | Some(Slot::Event(_)) => {}
                _ => {
                    return Err(invalid(format!(
                        "boundary event '{}' is not attached to an activity",
                        e.id
                    )));
                }
            }
        }

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));
        let version_id = raw.version_id.clone().unwrap_or_else(|| checksum.clone());

        Ok(Self {
            process_id: raw.process_id.clone(),
            version_id,
            index,
            raw,
            checksum,
        })
    }

    /// Looks up an element by id.
    pub fn element(&self, id: &str) -> Option<ElementRef<'_>> {
        self.index.get(id).map(|slot| match *slot {
            Slot::Sequence(i) => ElementRef::Sequence(&self.raw.sequences[i]),
            Slot::Task(i) => ElementRef::Task(&self.raw.tasks[i]),
            Slot::Event(i) => ElementRef::Event(&self.raw.events[i]),
            Slot::Gateway(i) => ElementRef::Gateway(&self.raw.gateways[i]),
        })
    }

    /// Looks up an element, treating absence as a structural error.
    pub fn require(&self, id: &str) -> Result<ElementRef<'_>, CoreError> {
        self.element(id).ok_or_else(|| CoreError::ElementNotFound {
            element_id: id.to_string(),
        })
    }

    pub fn sequence(&self, id: &str) -> Option<&Sequence> {
        match self.index.get(id) {
            Some(Slot::Sequence(i)) => Some(&self.raw.sequences[*i]),
            _ => None,
        }
    }

    /// Start events that need no trigger.
    pub fn default_starts(&self) -> impl Iterator<Item = &Event> {
        self.raw.events.iter().filter(|e| {
            e.position == EventPosition::Start
                && e.event_type == EventType::Default
                && e.name.is_none()
        })
    }

    /// Start events eligible for the given trigger name.
    pub fn starts_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.raw
            .events
            .iter()
            .filter(move |e| e.position == EventPosition::Start && e.name.as_deref() == Some(name))
    }

    /// Boundary events attached to an activity, in declaration order.
    pub fn boundaries_of<'a>(
        &'a self,
        activity_id: &'a str,
    ) -> impl Iterator<Item = &'a Event> + 'a {
        self.raw.events.iter().filter(move |e| {
            e.position == EventPosition::Boundary
                && e.attached_to_ref.as_deref() == Some(activity_id)
        })
    }

    /// Number of elements, sequences included.
    pub fn element_count(&self) -> usize {
        self.index.len()
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidGraph {
        reason: reason.into(),
    }
}
