//! Durable store contract and the in-memory store.
//!
//! A store keeps, per instance, an ordered event log, at most one snapshot and
//! a version. Versions move in two steps:
//!
//! 1. `append(expected)` succeeds only if the stored version equals
//!    `expected` and no other append has claimed it since. It stamps the
//!    events with fresh, strictly increasing keys and claims the version.
//!    The events stay uncommitted and `read` does not return them.
//! 2. `save_snapshot(new)` succeeds only if the stored version is `new - 1`
//!    (or `new == 0` for a fresh instance) and the version is claimed. It
//!    commits the appended events, stores the snapshot and advances the
//!    version to `new`.
//!
//! `rollback` discards uncommitted events and releases the claim, so a failed
//! snapshot save never blocks later writers.
//!
//! Conflicts are reported as `Ok(false)` and leave the store unchanged.

use crate::error::StorageError;
use bpmnflow_core::{PersistedEvent, Snapshot, TimeUuid, TimeUuidGenerator};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// What `read` returns for one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    /// Stored version; `None` if the instance was never persisted.
    pub version: Option<u64>,
    pub snapshot: Option<Snapshot>,
    /// Key of the last event included in `snapshot`.
    pub timeuuid: Option<TimeUuid>,
    /// Events strictly after `timeuuid`, or the full history without a
    /// usable snapshot.
    pub events: Vec<PersistedEvent>,
}

/// Backing store for instance history.
pub trait DurableStore: Send + Sync {
    fn read(&self, instance_id: &str) -> Result<ReadResult, StorageError>;

    /// Appends events if the stored version still equals `expected`.
    ///
    /// On success every event in `events` carries its stored key.
    fn append(
        &self,
        instance_id: &str,
        expected: Option<u64>,
        events: &mut [PersistedEvent],
    ) -> Result<bool, StorageError>;

    /// Stores a snapshot and advances the version to `version`.
    ///
    /// `snapshot` may be `None` when the instance has no snapshot yet.
    fn save_snapshot(
        &self,
        instance_id: &str,
        version: u64,
        snapshot: Option<&Snapshot>,
        boundary: Option<TimeUuid>,
    ) -> Result<bool, StorageError>;

    /// Drops events appended since the last snapshot save and releases the
    /// version claim. A no-op when nothing is claimed.
    fn rollback(&self, instance_id: &str) -> Result<(), StorageError>;
}

/// Version bookkeeping shared by the stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    pub version: Option<u64>,
    /// Set by a successful append, cleared by the matching snapshot save or
    /// a rollback.
    pub claimed: bool,
}

impl VersionState {
    pub fn can_append(&self, expected: Option<u64>) -> bool {
        !self.claimed && self.version == expected
    }

    pub fn can_save(&self, version: u64) -> bool {
        self.claimed && self.version.map_or(0, |v| v + 1) == version
    }
}

/// Stamps events with fresh keys after `last`, in their current order.
pub(crate) fn stamp(
    clock: &TimeUuidGenerator,
    last: Option<TimeUuid>,
    events: &mut [PersistedEvent],
) -> Option<TimeUuid> {
    if let Some(last) = last {
        clock.observe(last);
    }
    for event in events.iter_mut() {
        event.timeuuid = clock.next();
    }
    events.last().map(|e| e.timeuuid).or(last)
}

#[derive(Debug, Default)]
struct MemoryEntry {
    state: VersionState,
    events: Vec<PersistedEvent>,
    uncommitted: Vec<PersistedEvent>,
    snapshot: Option<Snapshot>,
    boundary: Option<TimeUuid>,
}

/// In-memory store. State lives as long as the store value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: DashMap<String, MemoryEntry>,
    clock: TimeUuidGenerator,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events stored for an instance.
    pub fn event_count(&self, instance_id: &str) -> usize {
        self.instances
            .get(instance_id)
            .map(|e| e.events.len())
            .unwrap_or(0)
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }
}

impl DurableStore for MemoryStore {
    fn read(&self, instance_id: &str) -> Result<ReadResult, StorageError> {
        let Some(entry) = self.instances.get(instance_id) else {
            return Ok(ReadResult::default());
        };

        let events = match entry.boundary {
            Some(boundary) if entry.snapshot.is_some() => entry
                .events
                .iter()
                .filter(|e| e.timeuuid > boundary)
                .cloned()
                .collect(),
            _ => entry.events.clone(),
        };
        Ok(ReadResult {
            version: entry.state.version,
            snapshot: entry.snapshot.clone(),
            timeuuid: entry.snapshot.as_ref().and(entry.boundary),
            events,
        })
    }

    fn append(
        &self,
        instance_id: &str,
        expected: Option<u64>,
        events: &mut [PersistedEvent],
    ) -> Result<bool, StorageError> {
        let mut entry = self.instances.entry(instance_id.to_string()).or_default();
        if !entry.state.can_append(expected) {
            tracing::debug!(
                "Append to {} rejected: expected {:?}, stored {:?}",
                instance_id,
                expected,
                entry.state
            );
            return Ok(false);
        }

        let last = entry.events.last().map(|e| e.timeuuid);
        stamp(&self.clock, last, events);
        entry.uncommitted = events.to_vec();
        entry.state.claimed = true;
        Ok(true)
    }

    fn save_snapshot(
        &self,
        instance_id: &str,
        version: u64,
        snapshot: Option<&Snapshot>,
        boundary: Option<TimeUuid>,
    ) -> Result<bool, StorageError> {
        let Some(mut entry) = self.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        if !entry.state.can_save(version) {
            tracing::debug!(
                "Snapshot of {} at version {} rejected: stored {:?}",
                instance_id,
                version,
                entry.state
            );
            return Ok(false);
        }

        let committed = std::mem::take(&mut entry.uncommitted);
        entry.events.extend(committed);
        entry.snapshot = snapshot.cloned();
        entry.boundary = boundary;
        entry.state = VersionState {
            version: Some(version),
            claimed: false,
        };
        Ok(true)
    }

    fn rollback(&self, instance_id: &str) -> Result<(), StorageError> {
        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            if entry.state.claimed {
                tracing::debug!(
                    "Rolled back {} uncommitted events of {}",
                    entry.uncommitted.len(),
                    instance_id
                );
            }
            entry.uncommitted.clear();
            entry.state.claimed = false;
        }
        Ok(())
    }
}
