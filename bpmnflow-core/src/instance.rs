//! Instance orchestrator.
//!
//! An [`Instance`] is one execution of a process graph. It owns the live
//! element models (`childs`), the accumulated `data`, pending jobs and raised
//! throwing events, and drives the graph by handling [`InstanceCommand`]s.
//!
//! Commands run on a work queue drained to completion inside one call.
//! Commands raised while handling a command run next, in the order they were
//! raised, before anything queued earlier. This is the order a recursive
//! implementation would produce.
//!
//! Every state change, including the orchestrator's own, is a recorded
//! [`DomainEvent`], so an instance can be rebuilt from a [`Snapshot`] plus the
//! events recorded after it.

use crate::bus::Publisher;
use crate::command::{Command, InstanceCommand, Query};
use crate::error::CoreError;
use crate::event::{
    DomainEvent, ModelMeta, PersistedEvent, TimeUuid, TimeUuidGenerator, INSTANCE_MACHINE,
};
use crate::expr::{is_truthy, Evaluator};
use crate::graph::{ElementRef, ProcessDefinition, Sequence};
use crate::job::{Job, JobStatus, ThrowingEvent};
use crate::machine::{ElementCommand, ElementState, MachineRegistry};
use crate::machines::machine_for;
use crate::model::{DispatchOutcome, ElementModel, Env, ModelSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on commands handled in one call. Guards against graphs that
/// loop without ever waiting on a job.
const MAX_STEPS: usize = 100_000;

/// Instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Running,
    Stopped,
    Completed,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// One line of the diagnostic trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the epoch.
    pub at: i64,
    pub message: String,
}

/// Quiescence timeouts for the `created` and `running` states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub created: Option<Duration>,
    pub running: Option<Duration>,
}

/// Saved orchestrator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub process_id: String,
    pub version_id: String,
    pub created: bool,
    pub status: InstanceStatus,
    pub data: Value,
    pub jobs: BTreeMap<String, Job>,
    pub throwing: Vec<ThrowingEvent>,
}

/// Saved instance: orchestrator state plus every live model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instance: InstanceSnapshot,
    pub models: BTreeMap<String, ModelSnapshot>,
}

/// Shared collaborators of an instance.
#[derive(Clone)]
pub struct Runtime {
    pub graph: Arc<ProcessDefinition>,
    pub registry: Arc<MachineRegistry>,
    pub evaluator: Arc<dyn Evaluator>,
    pub clock: Arc<TimeUuidGenerator>,
}

/// One execution of a process graph.
pub struct Instance {
    id: String,
    rt: Runtime,
    created: bool,
    status: InstanceStatus,
    data: Value,
    childs: BTreeMap<String, ElementModel>,
    jobs: BTreeMap<String, Job>,
    throwing: Vec<ThrowingEvent>,
    log: Vec<LogEntry>,
    local_events: Vec<PersistedEvent>,
    retired_events: Vec<PersistedEvent>,
    published_up_to: TimeUuid,
    version: Option<u64>,
    last_progress: DateTime<Utc>,
    queue: VecDeque<InstanceCommand>,
}

impl Instance {
    /// Creates an instance with no history.
    pub fn new(id: impl Into<String>, rt: Runtime) -> Self {
        Self {
            id: id.into(),
            rt,
            created: false,
            status: InstanceStatus::Created,
            data: json!({}),
            childs: BTreeMap::new(),
            jobs: BTreeMap::new(),
            throwing: Vec::new(),
            log: Vec::new(),
            local_events: Vec::new(),
            retired_events: Vec::new(),
            published_up_to: TimeUuid::MIN,
            version: None,
            last_progress: Utc::now(),
            queue: VecDeque::new(),
        }
    }

    /// Rebuilds an instance from a snapshot and the events recorded after it.
    ///
    /// Tail events are replayed and never recorded again. A model whose
    /// machine is not registered, or whose element is not in the graph, aborts
    /// the restore.
    pub fn restore(
        id: impl Into<String>,
        rt: Runtime,
        version: Option<u64>,
        snapshot: Option<&Snapshot>,
        tail: Vec<PersistedEvent>,
    ) -> Result<Self, CoreError> {
        let mut instance = Self::new(id, rt);
        instance.version = version;

        if let Some(snapshot) = snapshot {
            let saved = &snapshot.instance;
            if saved.version_id != instance.rt.graph.version_id {
                tracing::warn!(
                    "Instance {} was saved against version {} but is loading version {}",
                    instance.id,
                    saved.version_id,
                    instance.rt.graph.version_id
                );
            }
            instance.created = saved.created;
            instance.status = saved.status;
            instance.data = saved.data.clone();
            instance.jobs = saved.jobs.clone();
            instance.throwing = saved.throwing.clone();

            for (uid, model) in &snapshot.models {
                let machine = instance.rt.registry.get(&model.machine)?;
                instance.rt.graph.require(uid)?;
                instance
                    .childs
                    .insert(uid.clone(), ElementModel::restore(uid, machine, model));
            }
        }

        let mut tail = tail;
        tail.sort_by_key(|e| e.timeuuid);
        for event in tail {
            instance.apply(event.into_replayed())?;
        }

        tracing::debug!(
            "Restored instance {} ({}, {} live elements)",
            instance.id,
            instance.status,
            instance.childs.len()
        );
        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn graph(&self) -> &Arc<ProcessDefinition> {
        &self.rt.graph
    }

    pub fn childs(&self) -> &BTreeMap<String, ElementModel> {
        &self.childs
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn throwing(&self) -> &[ThrowingEvent] {
        &self.throwing
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Stored version this instance was loaded at, if any.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Version the next persist will store.
    pub fn pending_version(&self) -> u64 {
        self.version.map_or(0, |v| v + 1)
    }

    /// Pending jobs first stored at or after `version`.
    pub fn get_jobs(&self, version: u64) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|j| j.version >= version)
            .cloned()
            .collect()
    }

    /// Throwing events raised at or after `version`.
    pub fn get_throwing(&self, version: u64) -> Vec<ThrowingEvent> {
        self.throwing
            .iter()
            .filter(|t| t.version >= version)
            .cloned()
            .collect()
    }

    /// Returns true if every live element is waiting on something external.
    pub fn is_idle(&self) -> bool {
        !self.childs.is_empty()
            && self
                .childs
                .values()
                .all(|m| m.state() == ElementState::Waiting)
    }

    /// Runs a caller command to completion.
    ///
    /// An error stops the run part way: models already touched keep their
    /// changes and the remaining internal commands are dropped. Discard the
    /// instance and load it again from the store before sending more commands.
    pub fn execute(&mut self, command: &Command) -> Result<(), CoreError> {
        if self.status == InstanceStatus::Completed {
            return Err(CoreError::InstanceCompleted {
                instance_id: self.id.clone(),
            });
        }

        match command {
            Command::CreateInstance => {
                if !self.created {
                    let graph = self.rt.graph.clone();
                    self.record(DomainEvent::InstanceCreated {
                        process_id: graph.process_id.clone(),
                        version_id: graph.version_id.clone(),
                    });
                }
                if self.status == InstanceStatus::Created {
                    self.start();
                } else {
                    tracing::debug!("Instance {} already started", self.id);
                }
            }
            _ if !self.created => {
                return Err(CoreError::InstanceNotCreated {
                    instance_id: self.id.clone(),
                });
            }
            Command::RaiseEvent { name, payload } => {
                self.resume();
                self.queue.push_back(InstanceCommand::RaiseEvent {
                    name: name.clone(),
                    payload: payload.clone(),
                });
            }
            Command::CommitJob { job_id, .. } | Command::FailJob { job_id, .. }
                if !self.job_resolvable(job_id) =>
            {
                tracing::debug!("Instance {}: job {} is not pending", self.id, job_id);
                return Ok(());
            }
            Command::CommitJob { job_id, result } => {
                self.resume();
                self.queue.push_back(InstanceCommand::Commit {
                    job_id: job_id.clone(),
                    result: result.clone(),
                });
            }
            Command::FailJob { job_id, error } => {
                self.resume();
                self.queue.push_back(InstanceCommand::Failed {
                    job_id: job_id.clone(),
                    error: error.clone(),
                });
            }
            Command::StopInstance => self.queue.push_back(InstanceCommand::Stop {
                reason: "requested".to_string(),
            }),
            Command::ContinueInstance => self.queue.push_back(InstanceCommand::Continue),
        }

        self.last_progress = Utc::now();
        self.drain()
    }

    /// Answers a query from in-memory state.
    pub fn query(&self, query: &Query) -> Result<Value, CoreError> {
        let value = match query {
            Query::Status => json!({
                "instance_id": self.id,
                "process_id": self.rt.graph.process_id,
                "version_id": self.rt.graph.version_id,
                "status": self.status,
                "version": self.version,
                "idle": self.is_idle(),
            }),
            Query::Data => self.data.clone(),
            Query::Jobs => serde_json::to_value(self.jobs.values().collect::<Vec<_>>())?,
            Query::Throwing => serde_json::to_value(&self.throwing)?,
            Query::Log => serde_json::to_value(&self.log)?,
            Query::Element { element_id } => {
                self.rt.graph.require(element_id)?;
                match self.childs.get(element_id) {
                    Some(model) => serde_json::to_value(model.snapshot())?,
                    None => Value::Null,
                }
            }
            Query::Children => {
                let states: Map<String, Value> = self
                    .childs
                    .iter()
                    .map(|(id, m)| (id.clone(), Value::String(m.state().to_string())))
                    .collect();
                Value::Object(states)
            }
        };
        Ok(value)
    }

    /// Applies a stored event. Replayed events are not recorded again.
    pub fn apply(&mut self, event: PersistedEvent) -> Result<(), CoreError> {
        self.rt.clock.observe(event.timeuuid);

        if event.is_instance_event() {
            self.apply_instance_event(&event.event);
            if !event.replayed {
                self.local_events.push(event);
            }
            return Ok(());
        }

        if !self.childs.contains_key(&event.model_id) {
            let machine = self.rt.registry.get(&event.machine)?;
            let graph = self.rt.graph.clone();
            let element = graph.require(&event.model_id)?;
            let model =
                ElementModel::spawn(machine, &graph, element, event.meta.clone(), Value::Null);
            self.childs.insert(event.model_id.clone(), model);
        }
        if let Some(model) = self.childs.get_mut(&event.model_id) {
            model.apply(event);
        }
        Ok(())
    }

    /// Stops a `created` or `running` instance that made no progress within
    /// its timeout. Returns true if the instance was stopped.
    pub fn check_timeout(&mut self, now: DateTime<Utc>, timeouts: &Timeouts) -> bool {
        let limit = match self.status {
            InstanceStatus::Created => timeouts.created,
            InstanceStatus::Running => timeouts.running,
            _ => None,
        };
        let Some(limit) = limit else {
            return false;
        };

        let elapsed = now
            .signed_duration_since(self.last_progress)
            .to_std()
            .unwrap_or_default();
        if elapsed <= limit {
            return false;
        }

        tracing::info!(
            "Instance {} timed out in {} after {:?}",
            self.id,
            self.status,
            elapsed
        );
        self.push_log(format!("timed out in {}", self.status));
        self.record(DomainEvent::InstanceStopped {
            reason: "timeout".to_string(),
        });
        true
    }

    /// Events recorded since the last persist, in recording order.
    pub fn pending_events(&self) -> Vec<PersistedEvent> {
        let mut events: Vec<PersistedEvent> = self
            .local_events
            .iter()
            .chain(self.retired_events.iter())
            .chain(self.childs.values().flat_map(|m| m.local_events().iter()))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timeuuid);
        events
    }

    /// Clears recorded events after they were stored at `version`.
    pub fn mark_persisted(&mut self, version: u64) {
        self.local_events.clear();
        self.retired_events.clear();
        for model in self.childs.values_mut() {
            model.take_local_events();
        }
        self.version = Some(version);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            instance: InstanceSnapshot {
                process_id: self.rt.graph.process_id.clone(),
                version_id: self.rt.graph.version_id.clone(),
                created: self.created,
                status: self.status,
                data: self.data.clone(),
                jobs: self.jobs.clone(),
                throwing: self.throwing.clone(),
            },
            models: self
                .childs
                .iter()
                .map(|(id, m)| (id.clone(), m.snapshot()))
                .collect(),
        }
    }

    fn start(&mut self) {
        self.record(DomainEvent::InstanceStarted);
        self.push_log("started".to_string());
        tracing::info!("Instance {} running", self.id);
        if self.childs.is_empty() {
            self.queue.push_back(InstanceCommand::ActivateDefault);
        }
    }

    fn resume(&mut self) {
        if self.status == InstanceStatus::Stopped {
            self.record(DomainEvent::InstanceContinued);
            self.push_log("continued".to_string());
            tracing::info!("Instance {} continued", self.id);
        }
    }

    fn drain(&mut self) -> Result<(), CoreError> {
        let mut steps = 0;
        while let Some(command) = self.queue.pop_front() {
            steps += 1;
            if steps > MAX_STEPS {
                self.queue.clear();
                return Err(CoreError::HandlerFailed {
                    reason: format!("instance {} exceeded {} steps", self.id, MAX_STEPS),
                });
            }

            tracing::debug!("Instance {} handling {}", self.id, command.name());
            let raised = match self.handle(command) {
                Ok(raised) => raised,
                Err(e) => {
                    self.queue.clear();
                    return Err(e);
                }
            };
            for command in raised.into_iter().rev() {
                self.queue.push_front(command);
            }
        }
        Ok(())
    }

    fn handle(&mut self, command: InstanceCommand) -> Result<Vec<InstanceCommand>, CoreError> {
        match command {
            InstanceCommand::ActivateDefault => Ok(self.activate_default()),
            InstanceCommand::RaiseEvent { name, payload } => self.raise_event(&name, payload),
            InstanceCommand::ActivateElement {
                element_id,
                message,
            } => self.activate_element(&element_id, message),
            InstanceCommand::ActivateNext { element_id } => self.activate_next(&element_id),
            InstanceCommand::DeactivateElement { element_id } => {
                self.deactivate_element(&element_id);
                Ok(Vec::new())
            }
            InstanceCommand::ActivateBoundary { element_id, error } => {
                Ok(self.activate_boundary(&element_id, error))
            }
            InstanceCommand::ConditionalNext { element_id } => self.conditional_next(&element_id),
            InstanceCommand::ContextAdd { element_id, input } => {
                self.context_add(&element_id, input)?;
                Ok(Vec::new())
            }
            InstanceCommand::JobScheduled { mut job } => {
                job.status = JobStatus::Waiting;
                self.record(DomainEvent::JobScheduled { job });
                Ok(vec![InstanceCommand::CheckIdle])
            }
            InstanceCommand::JobCompleted { job_id } => {
                self.record(DomainEvent::JobResolved {
                    job_id,
                    status: JobStatus::Done,
                });
                Ok(vec![InstanceCommand::CheckIdle])
            }
            InstanceCommand::JobFailed { job_id } => {
                self.record(DomainEvent::JobResolved {
                    job_id,
                    status: JobStatus::Error,
                });
                Ok(vec![InstanceCommand::CheckIdle])
            }
            InstanceCommand::EmitThrowing {
                element_id,
                name,
                payload,
            } => {
                tracing::info!("Instance {} raised {} from {}", self.id, name, element_id);
                let event = ThrowingEvent {
                    name,
                    element_id,
                    payload,
                    version: self.pending_version(),
                };
                self.record(DomainEvent::ThrowingRaised { event });
                Ok(Vec::new())
            }
            InstanceCommand::CheckIdle => {
                if self.status == InstanceStatus::Running
                    && self.is_idle()
                    && !self.activation_pending()
                {
                    return Ok(vec![InstanceCommand::Stop {
                        reason: "idle".to_string(),
                    }]);
                }
                Ok(Vec::new())
            }
            InstanceCommand::CheckCompleted => {
                self.check_completed();
                Ok(Vec::new())
            }
            InstanceCommand::Commit { job_id, result } => Ok(self.resolve_job(
                &job_id,
                ElementCommand::CommitJob {
                    job_id: job_id.clone(),
                    result,
                },
            )),
            InstanceCommand::Failed { job_id, error } => Ok(self.resolve_job(
                &job_id,
                ElementCommand::FailJob {
                    job_id: job_id.clone(),
                    error,
                },
            )),
            InstanceCommand::Stop { reason } => {
                if matches!(
                    self.status,
                    InstanceStatus::Created | InstanceStatus::Running
                ) {
                    tracing::info!("Instance {} stopped ({})", self.id, reason);
                    self.push_log(format!("stopped: {}", reason));
                    self.record(DomainEvent::InstanceStopped { reason });
                }
                Ok(Vec::new())
            }
            InstanceCommand::Continue => {
                if self.status != InstanceStatus::Stopped {
                    return Ok(Vec::new());
                }
                self.resume();
                if self.childs.is_empty() {
                    return Ok(vec![InstanceCommand::ActivateDefault]);
                }
                Ok(Vec::new())
            }
        }
    }

    fn activate_default(&mut self) -> Vec<InstanceCommand> {
        let starts: Vec<String> = self
            .rt
            .graph
            .default_starts()
            .map(|e| e.id.clone())
            .collect();
        if starts.is_empty() {
            tracing::debug!("Instance {} has no default start event", self.id);
        }
        starts
            .into_iter()
            .map(|element_id| InstanceCommand::ActivateElement {
                element_id,
                message: ElementCommand::Activate { previous: None },
            })
            .collect()
    }

    fn raise_event(
        &mut self,
        name: &str,
        payload: Value,
    ) -> Result<Vec<InstanceCommand>, CoreError> {
        let graph = self.rt.graph.clone();
        let raise = |element_id: &str| InstanceCommand::ActivateElement {
            element_id: element_id.to_string(),
            message: ElementCommand::Raise {
                payload: payload.clone(),
            },
        };

        // Live catching events take precedence.
        let mut out: Vec<InstanceCommand> = Vec::new();
        for (id, model) in &self.childs {
            if model.state() != ElementState::Waiting {
                continue;
            }
            if let Some(ElementRef::Event(e)) = graph.element(id) {
                if e.name.as_deref() == Some(name) {
                    out.push(raise(id));
                }
            }
        }

        if out.is_empty() {
            let boundaries: Vec<(String, String, bool)> = graph
                .raw
                .events
                .iter()
                .filter(|e| e.name.as_deref() == Some(name))
                .filter_map(|e| {
                    let attached = e.attached_to_ref.as_ref()?;
                    self.childs
                        .contains_key(attached)
                        .then(|| (e.id.clone(), attached.clone(), e.interrupting))
                })
                .collect();
            for (boundary, attached, interrupting) in boundaries {
                out.extend(self.boundary_commands(&boundary, &attached, interrupting, payload.clone()));
            }
            out.extend(graph.starts_named(name).map(|e| raise(&e.id)));
        }

        if out.is_empty() {
            tracing::debug!("Instance {}: nothing waits for event {}", self.id, name);
            self.push_log(format!("event {} matched no element", name));
        }
        Ok(out)
    }

    fn activate_element(
        &mut self,
        element_id: &str,
        message: ElementCommand,
    ) -> Result<Vec<InstanceCommand>, CoreError> {
        let graph = self.rt.graph.clone();
        let element = graph.require(element_id)?;

        if !self.childs.contains_key(element_id) {
            let machine = self.rt.registry.get(machine_for(element))?;
            let scoped = self.scoped_context(element);
            let meta = ModelMeta {
                process_id: graph.process_id.clone(),
                version_id: graph.version_id.clone(),
                element_id: Some(element_id.to_string()),
            };
            let model = ElementModel::spawn(machine, &graph, element, meta, scoped);
            tracing::debug!(
                "Instance {} spawned {} ({:?})",
                self.id,
                element_id,
                model.element_type()
            );
            self.childs.insert(element_id.to_string(), model);
        }

        Ok(self.dispatch_to(element_id, &message))
    }

    fn activate_next(&mut self, element_id: &str) -> Result<Vec<InstanceCommand>, CoreError> {
        let graph = self.rt.graph.clone();
        let element = graph.require(element_id)?;

        // An activity with a default flow picks one outgoing sequence.
        if let ElementRef::Task(task) = element {
            if task.default.is_some() && task.outgoing.len() > 1 {
                return Ok(vec![InstanceCommand::ConditionalNext {
                    element_id: element_id.to_string(),
                }]);
            }
        }

        let mut out = vec![InstanceCommand::DeactivateElement {
            element_id: element_id.to_string(),
        }];
        let destinations = element.destinations();
        if destinations.is_empty() {
            out.push(InstanceCommand::CheckCompleted);
            return Ok(out);
        }
        for destination in destinations {
            graph.require(destination)?;
            out.push(InstanceCommand::ActivateElement {
                element_id: destination.to_string(),
                message: ElementCommand::Activate {
                    previous: Some(element_id.to_string()),
                },
            });
        }
        Ok(out)
    }

    fn deactivate_element(&mut self, element_id: &str) {
        if self.childs.contains_key(element_id) {
            self.record(DomainEvent::ElementDeactivated {
                element_id: element_id.to_string(),
            });
        }
    }

    fn activate_boundary(&mut self, element_id: &str, error: Value) -> Vec<InstanceCommand> {
        let graph = self.rt.graph.clone();
        let boundary = graph
            .boundaries_of(element_id)
            .next()
            .map(|b| (b.id.clone(), b.interrupting));

        let mut out = match boundary {
            Some((boundary, true)) => {
                return self.boundary_commands(&boundary, element_id, true, error);
            }
            Some((boundary, false)) => self.boundary_commands(&boundary, element_id, false, error),
            None => {
                tracing::warn!(
                    "Instance {}: {} failed with no boundary event attached",
                    self.id,
                    element_id
                );
                self.push_log(format!("{} failed: {}", element_id, error));
                Vec::new()
            }
        };
        // Nothing interrupts the failed element, so it can never complete.
        out.push(InstanceCommand::Stop {
            reason: format!("{} failed", element_id),
        });
        out
    }

    fn boundary_commands(
        &self,
        boundary: &str,
        attached: &str,
        interrupting: bool,
        payload: Value,
    ) -> Vec<InstanceCommand> {
        let mut out = vec![InstanceCommand::ActivateElement {
            element_id: boundary.to_string(),
            message: ElementCommand::Raise { payload },
        }];
        if interrupting {
            out.push(InstanceCommand::DeactivateElement {
                element_id: attached.to_string(),
            });
            out.push(InstanceCommand::CheckCompleted);
            out.push(InstanceCommand::CheckIdle);
        }
        out
    }

    fn conditional_next(&mut self, element_id: &str) -> Result<Vec<InstanceCommand>, CoreError> {
        let graph = self.rt.graph.clone();
        let element = graph.require(element_id)?;
        let default = element.default_sequence();
        let outgoing: Vec<&Sequence> = element
            .destinations()
            .into_iter()
            .filter_map(|id| graph.sequence(id))
            .collect();

        let chosen = outgoing
            .iter()
            .filter(|s| Some(s.id.as_str()) != default && s.is_conditional())
            .find(|s| self.condition_holds(s))
            .map(|s| s.id.clone())
            .or_else(|| default.map(str::to_string))
            .or_else(|| {
                outgoing
                    .iter()
                    .find(|s| Some(s.id.as_str()) != default && !s.is_conditional())
                    .map(|s| s.id.clone())
            });

        let mut out = vec![InstanceCommand::DeactivateElement {
            element_id: element_id.to_string(),
        }];
        match chosen {
            Some(sequence) => {
                tracing::debug!("Instance {}: {} took {}", self.id, element_id, sequence);
                out.push(InstanceCommand::ActivateElement {
                    element_id: sequence,
                    message: ElementCommand::Activate {
                        previous: Some(element_id.to_string()),
                    },
                });
            }
            None => {
                tracing::warn!(
                    "Instance {}: no outgoing sequence of {} can be taken",
                    self.id,
                    element_id
                );
                self.push_log(format!("{} has no outgoing sequence to take", element_id));
                out.push(InstanceCommand::CheckCompleted);
            }
        }
        Ok(out)
    }

    fn condition_holds(&self, sequence: &Sequence) -> bool {
        let Some(expression) = &sequence.expression else {
            return false;
        };
        match self.rt.evaluator.evaluate(expression, &self.data) {
            Ok(value) => is_truthy(&value),
            Err(e) => {
                tracing::warn!("Condition on {} failed to evaluate: {}", sequence.id, e);
                false
            }
        }
    }

    fn context_add(&mut self, element_id: &str, input: Option<Value>) -> Result<(), CoreError> {
        let graph = self.rt.graph.clone();
        let element = graph.require(element_id)?;

        let mut scope = self.data.clone();
        if let (Value::Object(scope), Some(Value::Object(input))) = (&mut scope, &input) {
            for (k, v) in input {
                scope.insert(k.clone(), v.clone());
            }
        }

        let additions: Vec<(String, Value)> = match element.output() {
            Some(mapping) => match self.rt.evaluator.evaluate(&mapping.expression, &scope) {
                Ok(value) => match (&mapping.target, value) {
                    (Some(target), value) => vec![(target.clone(), value)],
                    (None, Value::Object(map)) => map.into_iter().collect(),
                    (None, other) => {
                        tracing::warn!(
                            "Output of {} is not an object and has no target: {}",
                            element_id,
                            other
                        );
                        Vec::new()
                    }
                },
                Err(e) => {
                    tracing::warn!("Output mapping of {} failed: {}", element_id, e);
                    self.push_log(format!("output mapping of {} failed: {}", element_id, e));
                    Vec::new()
                }
            },
            None => match input {
                Some(Value::Object(map)) => map.into_iter().collect(),
                _ => Vec::new(),
            },
        };

        for (key, value) in additions {
            tracing::debug!("Instance {} context {} = {}", self.id, key, value);
            self.push_log(format!("context {} = {}", key, value));
            self.record(DomainEvent::ContextAdded { key, value });
        }
        Ok(())
    }

    fn check_completed(&mut self) {
        if self.status == InstanceStatus::Completed || !self.childs.is_empty() {
            return;
        }
        if self.activation_pending() {
            return;
        }
        tracing::info!("Instance {} completed", self.id);
        self.push_log("completed".to_string());
        self.record(DomainEvent::InstanceCompleted);
    }

    fn activation_pending(&self) -> bool {
        self.queue
            .iter()
            .any(|c| matches!(c, InstanceCommand::ActivateElement { .. }))
    }

    /// True if the job is pending and its element is still live.
    fn job_resolvable(&self, job_id: &str) -> bool {
        self.jobs
            .get(job_id)
            .is_some_and(|job| self.childs.contains_key(&job.element_id))
    }

    fn resolve_job(&mut self, job_id: &str, message: ElementCommand) -> Vec<InstanceCommand> {
        let Some(element_id) = self.jobs.get(job_id).map(|j| j.element_id.clone()) else {
            tracing::debug!("Instance {}: job {} is not pending", self.id, job_id);
            return Vec::new();
        };
        if !self.childs.contains_key(&element_id) {
            tracing::debug!(
                "Instance {}: job {} belongs to inactive {}",
                self.id,
                job_id,
                element_id
            );
            return Vec::new();
        }
        self.dispatch_to(&element_id, &message)
    }

    fn scoped_context(&self, element: ElementRef<'_>) -> Value {
        let Some(mapping) = element.input().or_else(|| element.output()) else {
            return self.data.clone();
        };
        match self.rt.evaluator.evaluate(&mapping.expression, &self.data) {
            Ok(value) => match &mapping.target {
                Some(target) => json!({ target.as_str(): value }),
                None => value,
            },
            Err(e) => {
                tracing::warn!("Scoped context of {} failed: {}", element.id(), e);
                Value::Null
            }
        }
    }

    fn dispatch_to(&mut self, element_id: &str, message: &ElementCommand) -> Vec<InstanceCommand> {
        let version = self.pending_version();
        let rt = self.rt.clone();
        let Some(model) = self.childs.get_mut(element_id) else {
            return Vec::new();
        };

        let mut env = Env {
            graph: &rt.graph,
            evaluator: rt.evaluator.as_ref(),
            clock: &rt.clock,
            data: &self.data,
            version,
            outbox: Vec::new(),
        };
        let outcome = model.dispatch(message, &mut env);
        let outbox = env.outbox;

        if let DispatchOutcome::Failed(reason) = outcome {
            self.push_log(format!("{} rejected {:?}: {}", element_id, message.kind(), reason));
        }
        outbox
    }

    fn record(&mut self, event: DomainEvent) {
        let meta = ModelMeta {
            process_id: self.rt.graph.process_id.clone(),
            version_id: self.rt.graph.version_id.clone(),
            element_id: None,
        };
        let persisted =
            PersistedEvent::new(self.rt.clock.next(), INSTANCE_MACHINE, &self.id, meta, event);
        self.apply_instance_event(&persisted.event);
        self.local_events.push(persisted);
    }

    fn apply_instance_event(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::InstanceCreated { .. } => {
                self.created = true;
                self.status = InstanceStatus::Created;
            }
            DomainEvent::InstanceStarted | DomainEvent::InstanceContinued => {
                self.status = InstanceStatus::Running;
            }
            DomainEvent::InstanceStopped { .. } => self.status = InstanceStatus::Stopped,
            DomainEvent::InstanceCompleted => self.status = InstanceStatus::Completed,
            DomainEvent::ContextAdded { key, value } => {
                if let Value::Object(data) = &mut self.data {
                    data.insert(key.clone(), value.clone());
                }
            }
            DomainEvent::JobScheduled { job } => {
                self.jobs.insert(job.job_id.clone(), job.clone());
            }
            DomainEvent::JobResolved { job_id, .. } => {
                self.jobs.remove(job_id);
            }
            DomainEvent::ThrowingRaised { event } => self.throwing.push(event.clone()),
            DomainEvent::ElementDeactivated { element_id } => {
                if let Some(mut model) = self.childs.remove(element_id) {
                    self.retired_events.extend(model.take_local_events());
                }
                self.jobs.retain(|_, job| &job.element_id != element_id);
            }
            other => {
                tracing::debug!("Instance {} ignores {}", self.id, other.name());
            }
        }
    }

    fn push_log(&mut self, message: String) {
        self.log.push(LogEntry {
            at: Utc::now().timestamp_millis(),
            message,
        });
    }
}

impl Publisher for Instance {
    fn take_published(&mut self) -> Vec<PersistedEvent> {
        let cursor = self.published_up_to;
        let events: Vec<PersistedEvent> = self
            .pending_events()
            .into_iter()
            .filter(|e| e.timeuuid > cursor)
            .collect();
        if let Some(last) = events.last() {
            self.published_up_to = last.timeuuid;
        }
        events
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("childs", &self.childs.keys().collect::<Vec<_>>())
            .field("jobs", &self.jobs.len())
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ContextExpr;
    use crate::graph::fixtures;

    pub fn runtime(graph: Value) -> Runtime {
        Runtime {
            graph: Arc::new(ProcessDefinition::from_json(&graph).unwrap()),
            registry: Arc::new(MachineRegistry::standard()),
            evaluator: Arc::new(ContextExpr::new()),
            clock: Arc::new(TimeUuidGenerator::new()),
        }
    }

    fn started(graph: Value) -> Instance {
        let mut instance = Instance::new("i-1", runtime(graph));
        instance.execute(&Command::CreateInstance).unwrap();
        instance
    }

    fn only_job(instance: &Instance) -> Job {
        let jobs = instance.get_jobs(0);
        assert_eq!(jobs.len(), 1);
        jobs[0].clone()
    }

    #[test]
    fn test_service_flow() {
        let mut instance = started(fixtures::service_flow());
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert!(instance.childs().is_empty());

        instance
            .execute(&Command::RaiseEvent {
                name: "order.placed".to_string(),
                payload: json!({"order": {"id": 7}}),
            })
            .unwrap();
        assert_eq!(instance.data()["order"], json!({"id": 7}));
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert!(instance.get_throwing(0).is_empty());

        let job = only_job(&instance);
        assert_eq!(job.element_id, "price");
        assert_eq!(job.data, json!({"order": {"id": 7}}));
        assert_eq!(job.status, JobStatus::Waiting);

        instance
            .execute(&Command::CommitJob {
                job_id: job.job_id,
                result: json!({"price": 10}),
            })
            .unwrap();
        assert!(instance.get_jobs(0).is_empty());
        assert_eq!(instance.data()["price"], json!(10));
        assert_eq!(instance.status(), InstanceStatus::Completed);

        let throwing = instance.get_throwing(0);
        assert_eq!(throwing.len(), 1);
        assert_eq!(throwing[0].name, "order.priced");
        assert_eq!(throwing[0].payload, json!({"price": 10}));

        let err = instance.execute(&Command::StopInstance).unwrap_err();
        assert!(matches!(err, CoreError::InstanceCompleted { .. }));
    }

    #[test]
    fn test_commands_require_creation() {
        let mut instance = Instance::new("i-1", runtime(fixtures::service_flow()));
        let err = instance
            .execute(&Command::RaiseEvent {
                name: "order.placed".to_string(),
                payload: Value::Null,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InstanceNotCreated { .. }));
    }

    #[test]
    fn test_unknown_job_is_noop() {
        let mut instance = started(fixtures::service_flow());
        let before = instance.pending_events().len();
        instance
            .execute(&Command::CommitJob {
                job_id: "missing".to_string(),
                result: Value::Null,
            })
            .unwrap();
        assert_eq!(instance.pending_events().len(), before);
    }

    #[test]
    fn test_unknown_job_leaves_stopped_instance_alone() {
        let mut instance = started(fixtures::service_flow());
        instance
            .execute(&Command::RaiseEvent {
                name: "order.placed".to_string(),
                payload: json!({"order": {"id": 1}}),
            })
            .unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        let before = instance.pending_events().len();

        instance
            .execute(&Command::CommitJob {
                job_id: "missing".to_string(),
                result: Value::Null,
            })
            .unwrap();
        instance
            .execute(&Command::FailJob {
                job_id: "missing".to_string(),
                error: Value::Null,
            })
            .unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert_eq!(instance.pending_events().len(), before);

        // The real job still resumes the instance.
        let job = only_job(&instance);
        instance
            .execute(&Command::CommitJob {
                job_id: job.job_id,
                result: json!({"price": 3}),
            })
            .unwrap();
        assert_eq!(instance.status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_failed_run_must_be_reloaded() {
        let mut rt = runtime(fixtures::service_flow());
        let mut registry = MachineRegistry::new();
        for machine in crate::machines::all() {
            if machine.name() != crate::machines::task::NAME {
                registry.register(machine);
            }
        }
        rt.registry = Arc::new(registry);

        let mut instance = Instance::new("i-1", rt);
        instance.execute(&Command::CreateInstance).unwrap();
        let history = instance.pending_events();

        let err = instance
            .execute(&Command::RaiseEvent {
                name: "order.placed".to_string(),
                payload: json!({"order": {"id": 1}}),
            })
            .unwrap_err();
        assert!(err.is_structural());
        assert!(instance.queue.is_empty());

        // Reloading from what was stored before the failed run is clean.
        let reloaded = Instance::restore(
            "i-1",
            runtime(fixtures::service_flow()),
            Some(0),
            None,
            history,
        )
        .unwrap();
        assert!(reloaded.childs().is_empty());
        assert_eq!(reloaded.status(), InstanceStatus::Running);
    }

    #[test]
    fn test_unhandled_failure_stops_instance() {
        let mut instance = started(fixtures::service_flow());
        instance
            .execute(&Command::RaiseEvent {
                name: "order.placed".to_string(),
                payload: json!({"order": {"id": 1}}),
            })
            .unwrap();
        let job = only_job(&instance);

        instance
            .execute(&Command::FailJob {
                job_id: job.job_id,
                error: json!({"code": 500}),
            })
            .unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert_eq!(instance.childs()["price"].state(), ElementState::Failed);
        assert!(instance.get_jobs(0).is_empty());
        assert!(instance
            .log()
            .iter()
            .any(|entry| entry.message == "stopped: price failed"));
    }

    fn exclusive_graph(default: bool) -> Value {
        let mut gateway = json!({"id": "gw", "type": "exclusive", "incoming": ["in"],
                                 "outgoing": ["a", "b", "c", "d"]});
        if default {
            gateway["default"] = json!("d");
        }
        json!({
            "processId": "route",
            "events": [{"id": "start", "position": "start", "outgoing": ["in"]}],
            "gateways": [gateway],
            "tasks": [
                {"id": "ta", "type": "serviceTask", "incoming": ["a"]},
                {"id": "tb", "type": "serviceTask", "incoming": ["b"]},
                {"id": "tc", "type": "serviceTask", "incoming": ["c"]},
                {"id": "td", "type": "serviceTask", "incoming": ["d"]}
            ],
            "sequences": [
                {"id": "in", "fromId": "start", "toId": "gw"},
                {"id": "a", "type": "conditional", "fromId": "gw", "toId": "ta", "expression": "false"},
                {"id": "b", "type": "conditional", "fromId": "gw", "toId": "tb", "expression": "true"},
                {"id": "c", "type": "conditional", "fromId": "gw", "toId": "tc", "expression": "true"},
                {"id": "d", "fromId": "gw", "toId": "td"}
            ]
        })
    }

    #[test]
    fn test_exclusive_first_match_wins() {
        let instance = started(exclusive_graph(false));
        assert_eq!(only_job(&instance).element_id, "tb");
        assert!(instance.childs().contains_key("tb"));
        assert!(!instance.childs().contains_key("gw"));
    }

    #[test]
    fn test_exclusive_default_and_fallback() {
        let mut graph = exclusive_graph(true);
        graph["sequences"][2]["expression"] = json!("false");
        graph["sequences"][3]["expression"] = json!("false");
        let instance = started(graph);
        assert_eq!(only_job(&instance).element_id, "td");

        // No match and no default: the first unconditional sequence is taken.
        let mut graph = exclusive_graph(false);
        graph["sequences"][2]["expression"] = json!("false");
        graph["sequences"][3]["expression"] = json!("false");
        let instance = started(graph);
        assert_eq!(only_job(&instance).element_id, "td");
    }

    #[test]
    fn test_idle_detection() {
        let mut instance = started(exclusive_graph(false));
        // started() ran until tb waited on its job, which stopped the instance.
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert_eq!(instance.childs().len(), 1);
        assert!(instance.is_idle());

        let graph = instance.graph().clone();
        let machine = instance.rt.registry.get("task").unwrap();
        let element = graph.element("ta").unwrap();
        let extra = ElementModel::spawn(machine, &graph, element, ModelMeta::default(), json!({}));
        instance.childs.insert("ta".to_string(), extra);
        assert!(!instance.is_idle());
    }

    fn parallel_graph() -> Value {
        json!({
            "processId": "fork",
            "events": [
                {"id": "start", "position": "start", "outgoing": ["s0"]},
                {"id": "end", "position": "end", "incoming": ["j"]}
            ],
            "gateways": [
                {"id": "fork", "type": "parallel", "incoming": ["s0"], "outgoing": ["a1", "b1"]},
                {"id": "join", "type": "parallel", "incoming": ["a2", "b2"], "outgoing": ["j"]}
            ],
            "tasks": [
                {"id": "a", "type": "serviceTask", "incoming": ["a1"], "outgoing": ["a2"]},
                {"id": "b", "type": "serviceTask", "incoming": ["b1"], "outgoing": ["b2"]}
            ],
            "sequences": [
                {"id": "s0", "fromId": "start", "toId": "fork"},
                {"id": "a1", "fromId": "fork", "toId": "a"},
                {"id": "b1", "fromId": "fork", "toId": "b"},
                {"id": "a2", "fromId": "a", "toId": "join"},
                {"id": "b2", "fromId": "b", "toId": "join"},
                {"id": "j", "fromId": "join", "toId": "end"}
            ]
        })
    }

    #[test]
    fn test_parallel_fork_and_join() {
        let mut instance = started(parallel_graph());
        let jobs = instance.get_jobs(0);
        assert_eq!(jobs.len(), 2);
        assert!(instance.is_idle());

        let job_b = jobs.iter().find(|j| j.element_id == "b").unwrap().clone();
        let job_a = jobs.iter().find(|j| j.element_id == "a").unwrap().clone();

        instance
            .execute(&Command::CommitJob {
                job_id: job_b.job_id,
                result: json!({"b": 2}),
            })
            .unwrap();
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(
            instance.childs()["join"].state(),
            ElementState::Activated
        );

        instance
            .execute(&Command::CommitJob {
                job_id: job_a.job_id,
                result: json!({"a": 1}),
            })
            .unwrap();
        assert_eq!(instance.status(), InstanceStatus::Completed);
        assert_eq!(instance.data(), &json!({"a": 1, "b": 2}));
    }

    fn boundary_graph(interrupting: bool) -> Value {
        json!({
            "processId": "b",
            "events": [
                {"id": "start", "position": "start", "outgoing": ["s1"]},
                {"id": "onError", "position": "boundary", "type": "error",
                 "attachedToRef": "call", "interrupting": interrupting, "outgoing": ["s3"],
                 "output": {"expression": "code", "target": "failure"}},
                {"id": "ok", "position": "end", "incoming": ["s2"]},
                {"id": "failed", "position": "end", "incoming": ["s3"]}
            ],
            "tasks": [{"id": "call", "type": "serviceTask", "incoming": ["s1"], "outgoing": ["s2"]}],
            "sequences": [
                {"id": "s1", "fromId": "start", "toId": "call"},
                {"id": "s2", "fromId": "call", "toId": "ok"},
                {"id": "s3", "fromId": "onError", "toId": "failed"}
            ]
        })
    }

    #[test]
    fn test_boundary_interrupts() {
        let mut instance = started(boundary_graph(true));
        let job = only_job(&instance);

        instance
            .execute(&Command::FailJob {
                job_id: job.job_id,
                error: json!({"code": 503}),
            })
            .unwrap();
        assert_eq!(instance.data()["failure"], json!(503));
        assert!(instance.childs().is_empty());
        assert_eq!(instance.status(), InstanceStatus::Completed);
    }

    #[test]
    fn test_non_interrupting_boundary_keeps_activity() {
        let mut instance = started(boundary_graph(false));
        let job = only_job(&instance);

        instance
            .execute(&Command::FailJob {
                job_id: job.job_id,
                error: json!({"code": 503}),
            })
            .unwrap();
        assert_eq!(instance.data()["failure"], json!(503));
        assert_eq!(instance.childs()["call"].state(), ElementState::Failed);
        assert_eq!(instance.status(), InstanceStatus::Stopped);
    }

    #[test]
    fn test_stop_and_continue() {
        let mut instance = started(fixtures::service_flow());
        instance.execute(&Command::StopInstance).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        instance.execute(&Command::ContinueInstance).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Running);
    }

    #[test]
    fn test_timeout() {
        let mut instance = started(fixtures::service_flow());
        let timeouts = Timeouts {
            created: None,
            running: Some(Duration::from_secs(60)),
        };
        assert!(!instance.check_timeout(Utc::now(), &timeouts));
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(instance.check_timeout(later, &timeouts));
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert!(!instance.check_timeout(later, &timeouts));
    }

    #[test]
    fn test_restore_is_idempotent() {
        let graph = parallel_graph();
        let mut original = started(graph.clone());
        let history = original.pending_events();
        assert!(history.len() > 1);

        let rt = runtime(graph);
        let first = Instance::restore("i-1", rt.clone(), Some(0), None, history.clone()).unwrap();
        let second = Instance::restore("i-1", rt, Some(0), None, history).unwrap();

        assert_eq!(first.snapshot(), second.snapshot());
        assert_eq!(first.snapshot(), original.snapshot());
        assert!(first.pending_events().is_empty());
        assert!(second.pending_events().is_empty());

        // Snapshot plus empty tail gives the same state.
        original.mark_persisted(0);
        let snap = original.snapshot();
        let rt = runtime(parallel_graph());
        let third = Instance::restore("i-1", rt, Some(0), Some(&snap), Vec::new()).unwrap();
        assert_eq!(third.snapshot(), snap);
    }

    #[test]
    fn test_restore_missing_machine_is_fatal() {
        let mut original = started(fixtures::service_flow());
        original
            .execute(&Command::RaiseEvent {
                name: "order.placed".to_string(),
                payload: json!({}),
            })
            .unwrap();
        let mut history = original.pending_events();
        for event in history.iter_mut().filter(|e| !e.is_instance_event()) {
            event.machine = "subProcess".to_string();
        }

        let err = Instance::restore("i-1", runtime(fixtures::service_flow()), None, None, history)
            .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_published_events_are_new_only() {
        let mut instance = started(fixtures::service_flow());
        let first = instance.take_published();
        assert!(!first.is_empty());
        assert!(instance.take_published().is_empty());

        instance.execute(&Command::StopInstance).unwrap();
        let next = instance.take_published();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].event.name(), "instance_stopped");
    }
}
