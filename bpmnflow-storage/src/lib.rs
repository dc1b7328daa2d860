//! # bpmnflow-storage
//!
//! Storage layer for bpmnflow.
//!
//! This crate provides:
//! - The `DurableStore` contract with optimistic version checks
//! - An in-memory store and a file-backed store
//! - Framed, checksummed event log records
//! - Snapshot policy and the event-sourced repository

pub mod error;
pub mod file;
pub mod record;
pub mod repository;
pub mod snapshot;
pub mod store;

pub use error::StorageError;
pub use file::FileStore;
pub use record::{EventRecord, RECORD_HEADER_SIZE};
pub use repository::{Checkpoint, Repository};
pub use snapshot::{SnapshotMeta, SnapshotPolicy};
pub use store::{DurableStore, MemoryStore, ReadResult};
