//! Command, query and event dispatch.
//!
//! Commands and queries route by name to exactly one handler; an unknown
//! name fails that call with [`CoreError::MissingHandler`]. Events fan out to
//! every subscriber registered for their `$_name`; events nobody subscribed
//! to are dropped. Subscribers may answer with follow-up commands, which run
//! on the same call before it returns.
//!
//! A [`PendingGate`] counts calls in flight so callers that fire commands from
//! other tasks can wait until the bus is quiet before reading state. A bus
//! shared by many states takes a per-state gate through
//! [`Bus::execute_gated`] and [`Bus::query_gated`].

use crate::command::{Command, Query};
use crate::error::CoreError;
use crate::event::PersistedEvent;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

/// State that publishes the events it records.
pub trait Publisher {
    /// Returns events recorded since the last call.
    fn take_published(&mut self) -> Vec<PersistedEvent>;
}

pub type CommandFn<S> = Box<dyn Fn(&mut S, &Command) -> Result<(), CoreError> + Send + Sync>;
pub type QueryFn<S> = Box<dyn Fn(&S, &Query) -> Result<Value, CoreError> + Send + Sync>;
pub type EventFn<S> = Box<dyn Fn(&S, &PersistedEvent) -> Vec<Command> + Send + Sync>;

/// Counter of in-flight bus calls.
#[derive(Debug, Clone)]
pub struct PendingGate {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for PendingGate {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }
}

impl PendingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one operation in flight until the guard drops.
    pub fn enter(&self) -> PendingGuard {
        self.tx.send_modify(|n| *n += 1);
        PendingGuard {
            tx: self.tx.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        *self.tx.borrow()
    }

    /// Resolves once no operation is in flight.
    pub async fn idle(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Decrements the gate on drop.
#[derive(Debug)]
pub struct PendingGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Dispatch bus over some state `S`.
pub struct Bus<S> {
    commands: HashMap<&'static str, CommandFn<S>>,
    queries: HashMap<&'static str, QueryFn<S>>,
    events: HashMap<&'static str, Vec<EventFn<S>>>,
    gate: PendingGate,
}

impl<S> Default for Bus<S> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            queries: HashMap::new(),
            events: HashMap::new(),
            gate: PendingGate::new(),
        }
    }
}

impl<S: Publisher> Bus<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for a command name, replacing any previous one.
    pub fn on_command<F>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(&mut S, &Command) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.commands.insert(name, Box::new(handler));
    }

    pub fn on_query<F>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(&S, &Query) -> Result<Value, CoreError> + Send + Sync + 'static,
    {
        self.queries.insert(name, Box::new(handler));
    }

    /// Adds a subscriber for an event name.
    pub fn subscribe<F>(&mut self, event_name: &'static str, handler: F)
    where
        F: Fn(&S, &PersistedEvent) -> Vec<Command> + Send + Sync + 'static,
    {
        self.events
            .entry(event_name)
            .or_default()
            .push(Box::new(handler));
    }

    /// Runs a command and every follow-up command its events trigger.
    pub fn execute(&self, state: &mut S, command: Command) -> Result<(), CoreError> {
        self.execute_gated(&self.gate, state, command)
    }

    /// Like [`Bus::execute`], counted on `gate` instead of the bus gate.
    pub fn execute_gated(
        &self,
        gate: &PendingGate,
        state: &mut S,
        command: Command,
    ) -> Result<(), CoreError> {
        let _guard = gate.enter();
        let mut queue = VecDeque::from([command]);

        while let Some(command) = queue.pop_front() {
            let handler =
                self.commands
                    .get(command.name())
                    .ok_or_else(|| CoreError::MissingHandler {
                        name: command.name().to_string(),
                    })?;
            handler(state, &command)?;

            for event in state.take_published() {
                queue.extend(self.publish(state, &event));
            }
        }
        Ok(())
    }

    /// Delivers an event to its subscribers and collects their commands.
    pub fn publish(&self, state: &S, event: &PersistedEvent) -> Vec<Command> {
        match self.events.get(event.event.name()) {
            Some(handlers) => handlers.iter().flat_map(|h| h(state, event)).collect(),
            None => Vec::new(),
        }
    }

    pub fn query(&self, state: &S, query: &Query) -> Result<Value, CoreError> {
        self.query_gated(&self.gate, state, query)
    }

    pub fn query_gated(
        &self,
        gate: &PendingGate,
        state: &S,
        query: &Query,
    ) -> Result<Value, CoreError> {
        let _guard = gate.enter();
        let handler = self
            .queries
            .get(query.name())
            .ok_or_else(|| CoreError::MissingHandler {
                name: query.name().to_string(),
            })?;
        handler(state, query)
    }

    pub fn gate(&self) -> &PendingGate {
        &self.gate
    }

    /// Resolves once no call on this bus is in flight.
    pub async fn idle(&self) {
        self.gate.idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, ModelMeta, TimeUuid, INSTANCE_MACHINE};
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        value: i64,
        published: Vec<PersistedEvent>,
    }

    impl Publisher for Counter {
        fn take_published(&mut self) -> Vec<PersistedEvent> {
            std::mem::take(&mut self.published)
        }
    }

    fn stopped_event() -> PersistedEvent {
        PersistedEvent::new(
            TimeUuid::MIN,
            INSTANCE_MACHINE,
            "i",
            ModelMeta::default(),
            DomainEvent::InstanceStopped {
                reason: "idle".to_string(),
            },
        )
    }

    #[test]
    fn test_missing_command_handler() {
        let bus: Bus<Counter> = Bus::new();
        let mut state = Counter::default();
        let err = bus.execute(&mut state, Command::StopInstance).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_HANDLER");
        assert_eq!(bus.gate().pending(), 0);
    }

    #[test]
    fn test_missing_query_handler() {
        let bus: Bus<Counter> = Bus::new();
        assert!(bus.query(&Counter::default(), &Query::Status).is_err());
    }

    #[test]
    fn test_events_fan_out_and_follow_up() {
        let mut bus: Bus<Counter> = Bus::new();
        bus.on_command("StopInstance", |s: &mut Counter, _| {
            s.value += 1;
            s.published.push(stopped_event());
            Ok(())
        });
        bus.on_command("ContinueInstance", |s: &mut Counter, _| {
            s.value += 10;
            Ok(())
        });
        bus.subscribe("instance_stopped", |_, _| vec![Command::ContinueInstance]);
        bus.subscribe("instance_stopped", |_, _| vec![Command::ContinueInstance]);
        bus.on_query("Status", |s: &Counter, _| Ok(json!(s.value)));

        let mut state = Counter::default();
        bus.execute(&mut state, Command::StopInstance).unwrap();
        assert_eq!(bus.query(&state, &Query::Status).unwrap(), json!(21));
    }

    #[test]
    fn test_unsubscribed_event_dropped() {
        let bus: Bus<Counter> = Bus::new();
        assert!(bus.publish(&Counter::default(), &stopped_event()).is_empty());
    }

    #[tokio::test]
    async fn test_gate_idle() {
        let gate = PendingGate::new();
        gate.idle().await;

        let guard = gate.enter();
        assert_eq!(gate.pending(), 1);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(gate.pending(), 0);
    }
}
