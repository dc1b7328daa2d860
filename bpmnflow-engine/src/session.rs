//! Instance sessions.
//!
//! A [`ProcessSession`] is one loaded instance. Commands and queries go
//! through the instance bus; nothing reaches the store until
//! [`ProcessSession::persist`] is called.

use crate::error::EngineError;
use bpmnflow_core::{
    Bus, Command, Instance, Job, PendingGate, PersistedEvent, Query, ThrowingEvent, Timeouts,
};
use bpmnflow_storage::{Checkpoint, Repository};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

const COMMANDS: [&str; 6] = [
    "CreateInstance",
    "RaiseEvent",
    "CommitJob",
    "FailJob",
    "StopInstance",
    "ContinueInstance",
];

const QUERIES: [&str; 7] = [
    "Status", "Data", "Jobs", "Throwing", "Log", "Element", "Children",
];

/// Builds the bus every session dispatches through.
pub(crate) fn instance_bus() -> Bus<Instance> {
    let mut bus = Bus::new();
    for name in COMMANDS {
        bus.on_command(name, |instance: &mut Instance, command: &Command| {
            instance.execute(command)
        });
    }
    for name in QUERIES {
        bus.on_query(name, |instance: &Instance, query: &Query| instance.query(query));
    }

    bus.subscribe("instance_completed", |instance: &Instance, _| {
        tracing::info!(
            "Instance {} of {} completed",
            instance.id(),
            instance.graph().process_id
        );
        Vec::new()
    });
    bus.subscribe("throwing_raised", |instance: &Instance, event: &PersistedEvent| {
        tracing::debug!("Instance {} published {}", instance.id(), event.timeuuid);
        Vec::new()
    });
    bus
}

/// A loaded instance plus its persistence bookkeeping.
pub struct ProcessSession {
    instance: Instance,
    checkpoint: Checkpoint,
    repository: Repository,
    bus: Arc<Bus<Instance>>,
    gate: PendingGate,
    timeouts: Timeouts,
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("checkpoint", &self.checkpoint)
            .field("gate", &self.gate)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl ProcessSession {
    pub(crate) fn new(
        instance: Instance,
        checkpoint: Checkpoint,
        repository: Repository,
        bus: Arc<Bus<Instance>>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            instance,
            checkpoint,
            repository,
            bus,
            gate: PendingGate::new(),
            timeouts,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn instance_id(&self) -> &str {
        self.instance.id()
    }

    /// Stored version the session is based on.
    pub fn version(&self) -> Option<u64> {
        self.instance.version()
    }

    /// Runs a command against the in-memory instance.
    ///
    /// After an error the instance may hold partial changes. Drop the
    /// session and load it again before retrying.
    pub fn execute(&mut self, command: Command) -> Result<(), EngineError> {
        tracing::debug!("Session {} executing {}", self.instance.id(), command.name());
        self.bus
            .execute_gated(&self.gate, &mut self.instance, command)?;
        Ok(())
    }

    /// Replays a stored event; it is never recorded as new.
    pub fn apply(&mut self, event: PersistedEvent) -> Result<(), EngineError> {
        self.instance.apply(event.into_replayed())?;
        Ok(())
    }

    pub fn query(&self, query: &Query) -> Result<Value, EngineError> {
        Ok(self.bus.query_gated(&self.gate, &self.instance, query)?)
    }

    /// Stores recorded events and advances the version.
    ///
    /// Returns `Ok(false)` if another writer persisted first. Reload the
    /// instance and retry.
    pub fn persist(&mut self) -> Result<bool, EngineError> {
        Ok(self
            .repository
            .persist(&mut self.instance, &mut self.checkpoint)?)
    }

    pub fn get_jobs(&self, version: u64) -> Vec<Job> {
        self.instance.get_jobs(version)
    }

    pub fn get_throwing(&self, version: u64) -> Vec<ThrowingEvent> {
        self.instance.get_throwing(version)
    }

    /// Stops the instance if it made no progress within its timeout.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> bool {
        self.instance.check_timeout(now, &self.timeouts)
    }

    /// Gate counting this session's bus calls in flight, for waiting from
    /// other tasks.
    pub fn gate(&self) -> PendingGate {
        self.gate.clone()
    }

    /// Resolves once no bus call of this session is in flight.
    pub async fn wait_idle(&self) {
        self.gate.idle().await
    }
}
