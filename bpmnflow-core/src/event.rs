//! Persisted domain events and their ordering keys.
//!
//! Every state change of an instance, whether made by an element model or by
//! the orchestrator itself, is a [`DomainEvent`] wrapped in a
//! [`PersistedEvent`] that carries the bookkeeping needed to route it back to
//! the right model on replay:
//!
//! ```json
//! {
//!   "$_timeuuid": "0000018b2c3e4f10-00000002",
//!   "$_timestamp": 1700000000000,
//!   "$_name": "job_created",
//!   "$_machine": "task",
//!   "$_modelId": "price",
//!   "$_meta": {"process_id": "order", "version_id": "v1", "element_id": "price"},
//!   "job": { ... }
//! }
//! ```

use crate::job::{Job, JobStatus, ThrowingEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Machine name recorded on orchestrator events.
pub const INSTANCE_MACHINE: &str = "instance";

/// Time-ordered unique key.
///
/// Ordered by wall-clock milliseconds, then by a sequence number that breaks
/// ties within one millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeUuid {
    pub millis: u64,
    pub seq: u32,
}

impl TimeUuid {
    pub const MIN: TimeUuid = TimeUuid { millis: 0, seq: 0 };
}

impl fmt::Display for TimeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:08x}", self.millis, self.seq)
    }
}

impl FromStr for TimeUuid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid timeuuid '{}'", s))?;
        Ok(TimeUuid {
            millis: u64::from_str_radix(millis, 16).map_err(|e| e.to_string())?,
            seq: u32::from_str_radix(seq, 16).map_err(|e| e.to_string())?,
        })
    }
}

impl Serialize for TimeUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generates strictly increasing [`TimeUuid`]s.
#[derive(Debug, Default)]
pub struct TimeUuidGenerator {
    last: Mutex<TimeUuid>,
}

impl TimeUuidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a key greater than every key previously returned or observed.
    pub fn next(&self) -> TimeUuid {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock();
        let next = if now > last.millis {
            TimeUuid { millis: now, seq: 0 }
        } else if last.seq == u32::MAX {
            TimeUuid {
                millis: last.millis + 1,
                seq: 0,
            }
        } else {
            TimeUuid {
                millis: last.millis,
                seq: last.seq + 1,
            }
        };
        *last = next;
        next
    }

    /// Moves the generator past a key produced elsewhere.
    pub fn observe(&self, key: TimeUuid) {
        let mut last = self.last.lock();
        if key > *last {
            *last = key;
        }
    }
}

/// Identity of the graph element a model runs for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelMeta {
    pub process_id: String,
    pub version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

/// Domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$_name", rename_all = "snake_case")]
pub enum DomainEvent {
    // Element events.
    ElementActivated {
        #[serde(default)]
        previous: Option<String>,
        context: Value,
    },
    IncomingRecorded {
        previous: String,
    },
    JobCreated {
        job: Job,
    },
    JobCommitted {
        job_id: String,
        result: Value,
    },
    JobFailed {
        job_id: String,
        error: Value,
    },
    ElementWaiting,
    EventRaised {
        payload: Value,
    },
    EventThrown {
        name: String,
        payload: Value,
    },
    ElementCompleted {
        output: Value,
    },
    ElementFailed {
        error: Value,
    },

    // Instance events.
    InstanceCreated {
        process_id: String,
        version_id: String,
    },
    InstanceStarted,
    InstanceStopped {
        reason: String,
    },
    InstanceContinued,
    InstanceCompleted,
    ContextAdded {
        key: String,
        value: Value,
    },
    JobScheduled {
        job: Job,
    },
    JobResolved {
        job_id: String,
        status: JobStatus,
    },
    ThrowingRaised {
        event: ThrowingEvent,
    },
    ElementDeactivated {
        element_id: String,
    },
}

/// Dispatch key of a [`DomainEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ElementActivated,
    IncomingRecorded,
    JobCreated,
    JobCommitted,
    JobFailed,
    ElementWaiting,
    EventRaised,
    EventThrown,
    ElementCompleted,
    ElementFailed,
    InstanceCreated,
    InstanceStarted,
    InstanceStopped,
    InstanceContinued,
    InstanceCompleted,
    ContextAdded,
    JobScheduled,
    JobResolved,
    ThrowingRaised,
    ElementDeactivated,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::ElementActivated { .. } => EventKind::ElementActivated,
            DomainEvent::IncomingRecorded { .. } => EventKind::IncomingRecorded,
            DomainEvent::JobCreated { .. } => EventKind::JobCreated,
            DomainEvent::JobCommitted { .. } => EventKind::JobCommitted,
            DomainEvent::JobFailed { .. } => EventKind::JobFailed,
            DomainEvent::ElementWaiting => EventKind::ElementWaiting,
            DomainEvent::EventRaised { .. } => EventKind::EventRaised,
            DomainEvent::EventThrown { .. } => EventKind::EventThrown,
            DomainEvent::ElementCompleted { .. } => EventKind::ElementCompleted,
            DomainEvent::ElementFailed { .. } => EventKind::ElementFailed,
            DomainEvent::InstanceCreated { .. } => EventKind::InstanceCreated,
            DomainEvent::InstanceStarted => EventKind::InstanceStarted,
            DomainEvent::InstanceStopped { .. } => EventKind::InstanceStopped,
            DomainEvent::InstanceContinued => EventKind::InstanceContinued,
            DomainEvent::InstanceCompleted => EventKind::InstanceCompleted,
            DomainEvent::ContextAdded { .. } => EventKind::ContextAdded,
            DomainEvent::JobScheduled { .. } => EventKind::JobScheduled,
            DomainEvent::JobResolved { .. } => EventKind::JobResolved,
            DomainEvent::ThrowingRaised { .. } => EventKind::ThrowingRaised,
            DomainEvent::ElementDeactivated { .. } => EventKind::ElementDeactivated,
        }
    }

    /// Returns the persisted `$_name` of this event.
    pub fn name(&self) -> &'static str {
        match self.kind() {
            EventKind::ElementActivated => "element_activated",
            EventKind::IncomingRecorded => "incoming_recorded",
            EventKind::JobCreated => "job_created",
            EventKind::JobCommitted => "job_committed",
            EventKind::JobFailed => "job_failed",
            EventKind::ElementWaiting => "element_waiting",
            EventKind::EventRaised => "event_raised",
            EventKind::EventThrown => "event_thrown",
            EventKind::ElementCompleted => "element_completed",
            EventKind::ElementFailed => "element_failed",
            EventKind::InstanceCreated => "instance_created",
            EventKind::InstanceStarted => "instance_started",
            EventKind::InstanceStopped => "instance_stopped",
            EventKind::InstanceContinued => "instance_continued",
            EventKind::InstanceCompleted => "instance_completed",
            EventKind::ContextAdded => "context_added",
            EventKind::JobScheduled => "job_scheduled",
            EventKind::JobResolved => "job_resolved",
            EventKind::ThrowingRaised => "throwing_raised",
            EventKind::ElementDeactivated => "element_deactivated",
        }
    }
}

/// A domain event plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    #[serde(rename = "$_timeuuid")]
    pub timeuuid: TimeUuid,
    /// Milliseconds since the epoch.
    #[serde(rename = "$_timestamp")]
    pub timestamp: i64,
    #[serde(rename = "$_machine")]
    pub machine: String,
    #[serde(rename = "$_modelId")]
    pub model_id: String,
    #[serde(rename = "$_meta")]
    pub meta: ModelMeta,
    /// Set on events fed back from history; never persisted.
    #[serde(skip)]
    pub replayed: bool,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl PersistedEvent {
    pub fn new(
        timeuuid: TimeUuid,
        machine: &str,
        model_id: &str,
        meta: ModelMeta,
        event: DomainEvent,
    ) -> Self {
        Self {
            timeuuid,
            timestamp: chrono::Utc::now().timestamp_millis(),
            machine: machine.to_string(),
            model_id: model_id.to_string(),
            meta,
            replayed: false,
            event,
        }
    }

    /// Returns a copy flagged as replayed.
    pub fn into_replayed(mut self) -> Self {
        self.replayed = true;
        self
    }

    pub fn is_instance_event(&self) -> bool {
        self.machine == INSTANCE_MACHINE
    }
}
