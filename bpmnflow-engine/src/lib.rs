//! # bpmnflow-engine
//!
//! Caller-facing API for bpmnflow.
//!
//! This crate provides:
//! - Process definition deployment
//! - Instance sessions: execute, query, persist, jobs and throwing events
//! - Configuration loading

pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use config::{Config, ConfigError, StoreBackend};
pub use engine::ProcessEngine;
pub use error::EngineError;
pub use session::ProcessSession;
