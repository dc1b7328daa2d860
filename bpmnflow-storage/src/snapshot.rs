//! Snapshot policy and metadata.

use bpmnflow_core::TimeUuid;
use serde::{Deserialize, Serialize};

/// When a persist writes a fresh snapshot.
///
/// A persist that does not write a fresh snapshot re-saves the previous one
/// under the new version, so the stored version advances either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// Snapshot on every persist.
    EveryPersist,
    /// Snapshot once N events were stored since the last snapshot.
    EveryNEvents(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::EveryPersist
    }
}

impl SnapshotPolicy {
    /// Builds a policy from an event threshold; 0 snapshots on every persist.
    pub fn from_threshold(events: u64) -> Self {
        if events == 0 {
            Self::EveryPersist
        } else {
            Self::EveryNEvents(events)
        }
    }

    /// Returns true if a fresh snapshot is due after `events_since` events.
    pub fn is_due(&self, events_since: u64) -> bool {
        match self {
            SnapshotPolicy::EveryPersist => true,
            SnapshotPolicy::EveryNEvents(n) => events_since >= *n,
        }
    }
}

/// Metadata stored alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Key of the last event the snapshot includes.
    pub boundary: Option<TimeUuid>,
    pub created_at: i64,
    pub size_bytes: u64,
    pub checksum: String,
}

impl SnapshotMeta {
    pub fn for_bytes(data: &[u8], boundary: Option<TimeUuid>) -> Self {
        Self {
            boundary,
            created_at: chrono::Utc::now().timestamp_millis(),
            size_bytes: data.len() as u64,
            checksum: checksum(data),
        }
    }

    /// Returns true if `data` matches the recorded size and checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size_bytes && checksum(data) == self.checksum
    }
}

fn checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32c::crc32c(data))
}
