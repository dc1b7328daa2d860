//! Event-sourced repository.
//!
//! Wraps a [`DurableStore`] with the instance-level operations: rebuilding an
//! [`Instance`] from snapshot plus tail, and persisting its recorded events
//! followed by a snapshot save that advances the version by one.

use crate::error::StorageError;
use crate::snapshot::SnapshotPolicy;
use crate::store::{DurableStore, ReadResult};
use bpmnflow_core::{Instance, PersistedEvent, Runtime, Snapshot, TimeUuid};
use std::sync::Arc;

/// Snapshot bookkeeping carried between persists of one loaded instance.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Events stored since the last fresh snapshot.
    pub events_since_snapshot: u64,
    pub snapshot: Option<Snapshot>,
    pub boundary: Option<TimeUuid>,
}

impl Checkpoint {
    fn from_read(read: &ReadResult) -> Self {
        Self {
            events_since_snapshot: read.events.len() as u64,
            snapshot: read.snapshot.clone(),
            boundary: read.timeuuid,
        }
    }
}

/// Repository over a durable store.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DurableStore>,
    policy: SnapshotPolicy,
}

impl Repository {
    pub fn new(store: Arc<dyn DurableStore>, policy: SnapshotPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn read(&self, instance_id: &str) -> Result<ReadResult, StorageError> {
        self.store.read(instance_id)
    }

    pub fn append(
        &self,
        instance_id: &str,
        expected: Option<u64>,
        events: &mut [PersistedEvent],
    ) -> Result<bool, StorageError> {
        self.store.append(instance_id, expected, events)
    }

    pub fn save_snapshot(
        &self,
        instance_id: &str,
        version: u64,
        snapshot: Option<&Snapshot>,
        boundary: Option<TimeUuid>,
    ) -> Result<bool, StorageError> {
        self.store
            .save_snapshot(instance_id, version, snapshot, boundary)
    }

    pub fn rollback(&self, instance_id: &str) -> Result<(), StorageError> {
        self.store.rollback(instance_id)
    }

    /// Loads an instance, replaying the events after its latest snapshot.
    ///
    /// A stored model whose machine or element is unknown to `rt` aborts the
    /// load with a structural error.
    pub fn restore(
        &self,
        instance_id: &str,
        rt: Runtime,
    ) -> Result<(Instance, Checkpoint), StorageError> {
        let read = self.store.read(instance_id)?;
        let checkpoint = Checkpoint::from_read(&read);
        tracing::debug!(
            "Restoring {} at version {:?} ({} tail events, snapshot: {})",
            instance_id,
            read.version,
            read.events.len(),
            read.snapshot.is_some()
        );

        let instance = Instance::restore(
            instance_id,
            rt,
            read.version,
            read.snapshot.as_ref(),
            read.events,
        )?;
        Ok((instance, checkpoint))
    }

    /// Stores everything the instance recorded since its last persist.
    ///
    /// Returns `Ok(false)` on a version conflict; the instance is left
    /// untouched and the caller should reload and retry. If the snapshot save
    /// fails the appended events are rolled back, so the same instance can
    /// persist again.
    pub fn persist(
        &self,
        instance: &mut Instance,
        checkpoint: &mut Checkpoint,
    ) -> Result<bool, StorageError> {
        let instance_id = instance.id().to_string();
        let expected = instance.version();
        let version = instance.pending_version();
        let mut events = instance.pending_events();

        if !self.store.append(&instance_id, expected, &mut events)? {
            tracing::warn!(
                "Version conflict persisting {} (expected {:?})",
                instance_id,
                expected
            );
            return Ok(false);
        }

        let events_since = checkpoint.events_since_snapshot + events.len() as u64;
        let due = self.policy.is_due(events_since);
        let (snapshot, boundary) = if due {
            let boundary = events.last().map(|e| e.timeuuid).or(checkpoint.boundary);
            (Some(instance.snapshot()), boundary)
        } else {
            (checkpoint.snapshot.clone(), checkpoint.boundary)
        };

        match self
            .store
            .save_snapshot(&instance_id, version, snapshot.as_ref(), boundary)
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    "Snapshot of {} at version {} rejected after append",
                    instance_id,
                    version
                );
                self.store.rollback(&instance_id)?;
                return Ok(false);
            }
            Err(e) => {
                tracing::error!(
                    "Snapshot of {} at version {} failed: {}",
                    instance_id,
                    version,
                    e
                );
                if let Err(rollback) = self.store.rollback(&instance_id) {
                    tracing::warn!("Rollback of {} failed: {}", instance_id, rollback);
                }
                return Err(e);
            }
        }

        instance.mark_persisted(version);
        *checkpoint = Checkpoint {
            events_since_snapshot: if due { 0 } else { events_since },
            snapshot,
            boundary,
        };
        tracing::debug!(
            "Persisted {} at version {} ({} events)",
            instance_id,
            version,
            events.len()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileStore;
    use crate::store::MemoryStore;
    use bpmnflow_core::event::TimeUuidGenerator;
    use bpmnflow_core::{Command, ContextExpr, InstanceStatus, MachineRegistry, ProcessDefinition};
    use serde_json::{json, Value};

    fn order_graph() -> Value {
        json!({
            "processId": "order",
            "versionId": "v1",
            "events": [
                {"id": "start", "position": "start", "type": "message", "name": "order.placed",
                 "outgoing": ["s1"], "output": {"expression": "order", "target": "order"}},
                {"id": "end", "position": "end", "type": "message", "direction": "throwing",
                 "name": "order.priced", "incoming": ["s2"],
                 "output": {"expression": "{ price: price }"}}
            ],
            "tasks": [
                {"id": "price", "type": "serviceTask", "action": "pricing.calculate",
                 "incoming": ["s1"], "outgoing": ["s2"],
                 "input": {"expression": "{ order: order }"},
                 "output": {"expression": "price", "target": "price"}}
            ],
            "sequences": [
                {"id": "s1", "fromId": "start", "toId": "price"},
                {"id": "s2", "fromId": "price", "toId": "end"}
            ]
        })
    }

    fn runtime() -> Runtime {
        Runtime {
            graph: Arc::new(ProcessDefinition::from_json(&order_graph()).unwrap()),
            registry: Arc::new(MachineRegistry::standard()),
            evaluator: Arc::new(ContextExpr::new()),
            clock: Arc::new(TimeUuidGenerator::new()),
        }
    }

    fn placed() -> Command {
        Command::RaiseEvent {
            name: "order.placed".to_string(),
            payload: json!({"order": {"id": 1}}),
        }
    }

    #[test]
    fn test_persist_and_restore() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store.clone(), SnapshotPolicy::EveryPersist);

        let (mut instance, mut checkpoint) = repo.restore("i-1", runtime()).unwrap();
        assert_eq!(instance.version(), None);
        instance.execute(&Command::CreateInstance).unwrap();
        instance.execute(&placed()).unwrap();

        assert!(repo.persist(&mut instance, &mut checkpoint).unwrap());
        assert_eq!(instance.version(), Some(0));
        assert!(store.event_count("i-1") > 1);
        assert!(instance.pending_events().is_empty());

        let (loaded, _) = repo.restore("i-1", runtime()).unwrap();
        assert_eq!(loaded.version(), Some(0));
        assert_eq!(loaded.snapshot(), instance.snapshot());
        assert_eq!(loaded.status(), InstanceStatus::Stopped);
        assert!(repo.read("i-1").unwrap().events.is_empty());
    }

    #[test]
    fn test_stale_instance_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store.clone(), SnapshotPolicy::EveryPersist);

        let (mut first, mut cp1) = repo.restore("i-1", runtime()).unwrap();
        let (mut second, mut cp2) = repo.restore("i-1", runtime()).unwrap();
        first.execute(&Command::CreateInstance).unwrap();
        second.execute(&Command::CreateInstance).unwrap();

        assert!(repo.persist(&mut first, &mut cp1).unwrap());
        let stored = store.event_count("i-1");

        assert!(!repo.persist(&mut second, &mut cp2).unwrap());
        assert_eq!(store.event_count("i-1"), stored);
        assert_eq!(second.version(), None);
        assert!(!second.pending_events().is_empty());
    }

    #[test]
    fn test_threshold_policy_reuses_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store.clone(), SnapshotPolicy::EveryNEvents(1_000));

        let (mut instance, mut checkpoint) = repo.restore("i-1", runtime()).unwrap();
        instance.execute(&Command::CreateInstance).unwrap();
        assert!(repo.persist(&mut instance, &mut checkpoint).unwrap());
        instance.execute(&placed()).unwrap();
        assert!(repo.persist(&mut instance, &mut checkpoint).unwrap());
        assert_eq!(instance.version(), Some(1));

        let read = repo.read("i-1").unwrap();
        assert!(read.snapshot.is_none());
        assert_eq!(read.events.len(), store.event_count("i-1"));
        assert_eq!(checkpoint.events_since_snapshot as usize, read.events.len());

        let (loaded, _) = repo.restore("i-1", runtime()).unwrap();
        assert_eq!(loaded.snapshot(), instance.snapshot());
        assert_eq!(loaded.get_jobs(0).len(), 1);
    }

    #[test]
    fn test_failed_snapshot_save_rolls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let repo = Repository::new(store, SnapshotPolicy::EveryPersist);

        let (mut instance, mut checkpoint) = repo.restore("i-1", runtime()).unwrap();
        instance.execute(&Command::CreateInstance).unwrap();
        assert!(repo.persist(&mut instance, &mut checkpoint).unwrap());
        instance.execute(&placed()).unwrap();

        // The snapshot's temporary file cannot be created over a directory.
        let blocker = dir.path().join("i-1").join("snapshot.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(repo.persist(&mut instance, &mut checkpoint).is_err());
        assert_eq!(instance.version(), Some(0));
        assert!(!instance.pending_events().is_empty());

        let read = repo.read("i-1").unwrap();
        assert_eq!(read.version, Some(0));
        assert!(read.events.is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        assert!(repo.persist(&mut instance, &mut checkpoint).unwrap());
        assert_eq!(instance.version(), Some(1));

        let (loaded, _) = repo.restore("i-1", runtime()).unwrap();
        assert_eq!(loaded.version(), Some(1));
        assert_eq!(loaded.snapshot(), instance.snapshot());
        assert_eq!(loaded.get_jobs(0).len(), 1);
    }

    #[test]
    fn test_restore_unknown_machine_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store.clone(), SnapshotPolicy::EveryNEvents(1_000));

        let (mut instance, mut checkpoint) = repo.restore("i-1", runtime()).unwrap();
        instance.execute(&Command::CreateInstance).unwrap();
        instance.execute(&placed()).unwrap();
        assert!(repo.persist(&mut instance, &mut checkpoint).unwrap());

        let mut rt = runtime();
        rt.registry = Arc::new(MachineRegistry::new());
        let err = repo.restore("i-1", rt).unwrap_err();
        assert!(err.is_fatal());
    }
}
