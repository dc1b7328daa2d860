//! Process engine.
//!
//! Holds deployed process definitions, the machine registry, the expression
//! evaluator and the repository, and opens [`ProcessSession`]s on instances.

use crate::config::{Config, StoreBackend};
use crate::error::EngineError;
use crate::session::{instance_bus, ProcessSession};
use bpmnflow_core::{
    Bus, ContextExpr, Evaluator, Instance, MachineRegistry, ProcessDefinition, Runtime, Timeouts,
    TimeUuidGenerator,
};
use bpmnflow_storage::{DurableStore, FileStore, MemoryStore, Repository, SnapshotPolicy};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Entry point for driving process instances.
pub struct ProcessEngine {
    /// Latest definition per process id.
    definitions: DashMap<String, Arc<ProcessDefinition>>,
    registry: Arc<MachineRegistry>,
    evaluator: Arc<dyn Evaluator>,
    repository: Repository,
    bus: Arc<Bus<Instance>>,
    timeouts: Timeouts,
}

impl ProcessEngine {
    /// Creates an engine over a store with the standard machines.
    pub fn new(store: Arc<dyn DurableStore>, policy: SnapshotPolicy) -> Self {
        Self {
            definitions: DashMap::new(),
            registry: Arc::new(MachineRegistry::standard()),
            evaluator: Arc::new(ContextExpr::new()),
            repository: Repository::new(store, policy),
            bus: Arc::new(instance_bus()),
            timeouts: Timeouts::default(),
        }
    }

    /// Creates an engine with an in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), SnapshotPolicy::EveryPersist)
    }

    /// Creates an engine from configuration.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let store: Arc<dyn DurableStore> = match config.storage.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File => Arc::new(FileStore::open(config.storage.instances_dir())?),
        };
        tracing::info!(
            "Engine using {:?} store, snapshot policy {:?}",
            config.storage.backend,
            config.snapshot.policy()
        );
        Ok(Self::new(store, config.snapshot.policy()).with_timeouts(config.instance.timeouts()))
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_registry(mut self, registry: MachineRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Parses, validates and registers a process graph.
    ///
    /// A later deploy of the same process id replaces the earlier one for new
    /// loads.
    pub fn deploy(&self, graph: &Value) -> Result<Arc<ProcessDefinition>, EngineError> {
        let definition = Arc::new(ProcessDefinition::from_json(graph)?);
        tracing::info!(
            "Deployed process {} version {} ({} elements)",
            definition.process_id,
            definition.version_id,
            definition.element_count()
        );
        self.definitions
            .insert(definition.process_id.clone(), definition.clone());
        Ok(definition)
    }

    pub fn definition(&self, process_id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .get(process_id)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::DefinitionNotFound {
                process_id: process_id.to_string(),
            })
    }

    pub fn process_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Loads an instance of a deployed process.
    ///
    /// An instance with no stored history loads empty; run
    /// `Command::CreateInstance` to start it.
    pub fn load(&self, instance_id: &str, process_id: &str) -> Result<ProcessSession, EngineError> {
        let rt = Runtime {
            graph: self.definition(process_id)?,
            registry: self.registry.clone(),
            evaluator: self.evaluator.clone(),
            clock: Arc::new(TimeUuidGenerator::new()),
        };
        let (instance, checkpoint) = self.repository.restore(instance_id, rt)?;
        Ok(ProcessSession::new(
            instance,
            checkpoint,
            self.repository.clone(),
            self.bus.clone(),
            self.timeouts,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deploy_and_lookup() {
        let engine = ProcessEngine::in_memory();
        let def = engine
            .deploy(&json!({
                "processId": "noop",
                "events": [{"id": "start", "position": "start", "outgoing": ["s"]},
                           {"id": "end", "position": "end", "incoming": ["s"]}],
                "sequences": [{"id": "s", "fromId": "start", "toId": "end"}]
            }))
            .unwrap();
        assert_eq!(def.process_id, "noop");
        assert_eq!(engine.process_ids(), vec!["noop".to_string()]);

        let err = engine.load("i-1", "missing").unwrap_err();
        assert_eq!(err.error_code(), "DEFINITION_NOT_FOUND");
    }

    #[test]
    fn test_deploy_rejects_invalid_graph() {
        let engine = ProcessEngine::in_memory();
        let err = engine
            .deploy(&json!({
                "processId": "broken",
                "sequences": [{"id": "s", "fromId": "nowhere", "toId": "end"}]
            }))
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_GRAPH");
    }
}
