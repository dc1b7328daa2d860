//! # bpmnflow-core
//!
//! Process engine core for bpmnflow.
//!
//! This crate provides:
//! - Process graph parsing and validation
//! - Element state machines and their dispatch tables
//! - Context expression evaluation
//! - Instance orchestration over recorded domain events
//! - The command/query/event bus

pub mod bus;
pub mod command;
pub mod error;
pub mod event;
pub mod expr;
pub mod graph;
pub mod instance;
pub mod job;
pub mod machine;
pub mod machines;
pub mod model;

pub use bus::{Bus, PendingGate, Publisher};
pub use command::{Command, InstanceCommand, Query};
pub use error::CoreError;
pub use event::{DomainEvent, ModelMeta, PersistedEvent, TimeUuid, TimeUuidGenerator};
pub use expr::{ContextExpr, Evaluator, Expr};
pub use graph::{ElementRef, ProcessDefinition, ProcessGraphRaw};
pub use instance::{Instance, InstanceSnapshot, InstanceStatus, Runtime, Snapshot, Timeouts};
pub use job::{Job, JobStatus, ThrowingEvent};
pub use machine::{ElementState, ElementType, Machine, MachineRegistry};
pub use model::{ElementModel, ModelSnapshot};
