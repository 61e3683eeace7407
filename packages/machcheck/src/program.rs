//! Program definitions: machine types, their state/handler tables, monitors.
//!
//! # Overview
//!
//! A [`Program`] is built once and shared read-only by every scheduler and
//! worker. Handler tables are explicit maps keyed by `(state, event)` and
//! checked when a [`MachineType`] is built, so a mistyped transition target
//! or a state that both handles and defers the same event is rejected before
//! any schedule runs.
//!
//! # Example
//!
//! ```
//! use machcheck::{MachineType, Program, Value};
//!
//! let server = MachineType::builder("Server")
//!     .start("Serving")
//!     .state("Serving", |s| {
//!         s.on("Ping", |ctx, payload| {
//!             let client = payload.and_then(Value::as_machine).cloned();
//!             if let Some(client) = client {
//!                 ctx.send(&client, "Pong", None)?;
//!             }
//!             ctx.halt();
//!             Ok(())
//!         })
//!     })
//!     .build()
//!     .unwrap();
//!
//! let client = MachineType::builder("Client")
//!     .start("Init")
//!     .state("Init", |s| {
//!         s.entry(|ctx, _| {
//!             let server = ctx.create("Server", None)?;
//!             ctx.send(&server, "Ping", Some(Value::Machine(ctx.id().clone())))
//!         })
//!     })
//!     .build()
//!     .unwrap();
//!
//! let program = Program::builder("ping_pong")
//!     .machine(client)
//!     .machine(server)
//!     .start("Client")
//!     .build()
//!     .unwrap();
//! assert_eq!(program.start_type(), "Client");
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::continuation::{ClearFn, Continuation, ResumeFn};
use crate::core::{Event, Message};
use crate::error::{Result, SpecificationError};
use crate::machine::MachineContext;
use crate::value::Value;

/// Machine-local variables, keyed by declared name.
pub type Vars = BTreeMap<String, Value>;

/// An action run on entry, exit, transition or event delivery.
pub type Action = Arc<dyn Fn(&mut MachineContext<'_>, Option<&Value>) -> Result<()> + Send + Sync>;

// =============================================================================
// Handlers and States
// =============================================================================

/// How a state reacts to an event.
#[derive(Clone)]
pub enum Handler {
    /// Run an action and stay.
    Do(Action),
    /// Transition to `target`, running `action` between exit and entry.
    Goto { target: String, action: Option<Action> },
    /// Leave the message queued until the machine is in another state.
    Defer,
    /// Drop the message.
    Ignore,
}

impl Handler {
    fn kind(&self) -> &'static str {
        match self {
            Handler::Do(_) => "do",
            Handler::Goto { .. } => "goto",
            Handler::Defer => "defer",
            Handler::Ignore => "ignore",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Goto { target, .. } => write!(f, "goto {}", target),
            other => f.write_str(other.kind()),
        }
    }
}

/// Liveness temperature of a state. Only meaningful for monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Temperature {
    /// Waiting for progress. Ending a run here is a liveness bug.
    Hot,
    /// Progress was made.
    Cold,
    #[default]
    Neutral,
}

/// One state of a machine type.
#[derive(Clone)]
pub struct StateDef {
    name: String,
    entry: Option<Action>,
    exit: Option<Action>,
    handlers: BTreeMap<Event, Handler>,
    temperature: Temperature,
}

impl StateDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> Option<&Action> {
        self.entry.as_ref()
    }

    pub fn exit(&self) -> Option<&Action> {
        self.exit.as_ref()
    }

    /// The handler registered for `event` in this state, if any.
    pub fn handler(&self, event: &Event) -> Option<&Handler> {
        self.handlers.get(event)
    }

    pub fn temperature(&self) -> Temperature {
        self.temperature
    }

    pub fn is_hot(&self) -> bool {
        self.temperature == Temperature::Hot
    }

    /// Events this state defers.
    pub fn deferred_events(&self) -> impl Iterator<Item = &Event> {
        self.handlers
            .iter()
            .filter(|(_, h)| matches!(h, Handler::Defer))
            .map(|(e, _)| e)
    }
}

impl fmt::Debug for StateDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDef")
            .field("name", &self.name)
            .field("handlers", &self.handlers)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Builder for one state, used inside [`MachineTypeBuilder::state`].
pub struct StateBuilder {
    name: String,
    entry: Option<Action>,
    exit: Option<Action>,
    handlers: Vec<(Event, Handler)>,
    temperature: Temperature,
}

impl StateBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            entry: None,
            exit: None,
            handlers: Vec::new(),
            temperature: Temperature::Neutral,
        }
    }

    /// Action run when the state is entered. Receives the entry payload.
    pub fn entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut MachineContext<'_>, Option<&Value>) -> Result<()> + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(f));
        self
    }

    /// Action run when the state is left.
    pub fn exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut MachineContext<'_>, Option<&Value>) -> Result<()> + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(f));
        self
    }

    /// Handle `event` with an action.
    pub fn on<F>(mut self, event: impl Into<Event>, f: F) -> Self
    where
        F: Fn(&mut MachineContext<'_>, Option<&Value>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((event.into(), Handler::Do(Arc::new(f))));
        self
    }

    /// Transition to `target` on `event`. The payload becomes the entry payload.
    pub fn goto_on(mut self, event: impl Into<Event>, target: impl Into<String>) -> Self {
        self.handlers.push((
            event.into(),
            Handler::Goto {
                target: target.into(),
                action: None,
            },
        ));
        self
    }

    /// Transition to `target` on `event`, running `f` between exit and entry.
    pub fn goto_with<F>(mut self, event: impl Into<Event>, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut MachineContext<'_>, Option<&Value>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((
            event.into(),
            Handler::Goto {
                target: target.into(),
                action: Some(Arc::new(f)),
            },
        ));
        self
    }

    /// Defer `event` while in this state.
    pub fn defer(mut self, event: impl Into<Event>) -> Self {
        self.handlers.push((event.into(), Handler::Defer));
        self
    }

    /// Drop `event` while in this state.
    pub fn ignore(mut self, event: impl Into<Event>) -> Self {
        self.handlers.push((event.into(), Handler::Ignore));
        self
    }

    /// Mark the state hot (monitors only).
    pub fn hot(mut self) -> Self {
        self.temperature = Temperature::Hot;
        self
    }

    /// Mark the state cold (monitors only).
    pub fn cold(mut self) -> Self {
        self.temperature = Temperature::Cold;
        self
    }
}

// =============================================================================
// Machine Types
// =============================================================================

/// A validated machine type: states, handlers, continuations and variables.
pub struct MachineType {
    name: String,
    start: String,
    states: BTreeMap<String, StateDef>,
    continuations: BTreeMap<String, Continuation>,
    vars: Vars,
}

impl MachineType {
    /// Start building a machine type.
    pub fn builder(name: impl Into<String>) -> MachineTypeBuilder {
        MachineTypeBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the start state.
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &StateDef> {
        self.states.values()
    }

    pub fn continuation(&self, name: &str) -> Option<&Continuation> {
        self.continuations.get(name)
    }

    pub fn continuations(&self) -> impl Iterator<Item = &Continuation> {
        self.continuations.values()
    }

    /// Declared variables with their initial values.
    pub fn initial_vars(&self) -> &Vars {
        &self.vars
    }

    pub fn declares_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}

impl fmt::Debug for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineType")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("continuations", &self.continuations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`MachineType`].
pub struct MachineTypeBuilder {
    name: String,
    start: Option<String>,
    states: Vec<StateBuilder>,
    continuations: Vec<Continuation>,
    vars: Vars,
}

impl MachineTypeBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            start: None,
            states: Vec::new(),
            continuations: Vec::new(),
            vars: Vars::new(),
        }
    }

    /// Declare a variable with its initial value.
    pub fn var(mut self, name: impl Into<String>, initial: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), initial.into());
        self
    }

    /// Name the start state.
    pub fn start(mut self, state: impl Into<String>) -> Self {
        self.start = Some(state.into());
        self
    }

    /// Declare a state.
    pub fn state(mut self, name: impl Into<String>, f: impl FnOnce(StateBuilder) -> StateBuilder) -> Self {
        self.states.push(f(StateBuilder::new(name.into())));
        self
    }

    /// Declare a blocking receive resumable by `events`.
    pub fn continuation<I, E, R>(mut self, name: impl Into<String>, events: I, resume: R) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Event>,
        R: Fn(&mut MachineContext<'_>, &Message) -> Result<()> + Send + Sync + 'static,
    {
        let resume: ResumeFn = Arc::new(resume);
        self.continuations.push(Continuation::new(
            name.into(),
            events.into_iter().map(Into::into).collect(),
            resume,
            None,
        ));
        self
    }

    /// Like [`continuation`](Self::continuation) with a clear handler.
    pub fn continuation_with_clear<I, E, R, C>(
        mut self,
        name: impl Into<String>,
        events: I,
        resume: R,
        clear: C,
    ) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Event>,
        R: Fn(&mut MachineContext<'_>, &Message) -> Result<()> + Send + Sync + 'static,
        C: Fn(&mut Vars) + Send + Sync + 'static,
    {
        let resume: ResumeFn = Arc::new(resume);
        let clear: ClearFn = Arc::new(clear);
        self.continuations.push(Continuation::new(
            name.into(),
            events.into_iter().map(Into::into).collect(),
            resume,
            Some(clear),
        ));
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<MachineType, SpecificationError> {
        let machine_type = self.name;

        let start = self.start.ok_or_else(|| SpecificationError::MissingStartState {
            machine_type: machine_type.clone(),
        })?;

        let mut states = BTreeMap::new();
        for sb in self.states {
            let mut handlers = BTreeMap::new();
            for (event, handler) in sb.handlers {
                if event.is_reserved() && matches!(handler, Handler::Defer | Handler::Ignore) {
                    return Err(SpecificationError::ReservedEventDeferred {
                        machine_type,
                        state: sb.name,
                        event,
                    });
                }
                if handlers.contains_key(&event) {
                    return Err(SpecificationError::DuplicateHandler {
                        machine_type,
                        state: sb.name,
                        event,
                    });
                }
                handlers.insert(event, handler);
            }
            if states.contains_key(&sb.name) {
                return Err(SpecificationError::DuplicateState {
                    machine_type,
                    state: sb.name,
                });
            }
            states.insert(
                sb.name.clone(),
                StateDef {
                    name: sb.name,
                    entry: sb.entry,
                    exit: sb.exit,
                    handlers,
                    temperature: sb.temperature,
                },
            );
        }

        if !states.contains_key(&start) {
            return Err(SpecificationError::UnknownState {
                machine_type,
                state: start,
            });
        }

        for state in states.values() {
            for handler in state.handlers.values() {
                if let Handler::Goto { target, .. } = handler {
                    if !states.contains_key(target) {
                        return Err(SpecificationError::UnknownState {
                            machine_type,
                            state: target.clone(),
                        });
                    }
                }
            }
        }

        let mut continuations = BTreeMap::new();
        for c in self.continuations {
            if c.events().is_empty() {
                return Err(SpecificationError::EmptyContinuation {
                    machine_type,
                    name: c.name().to_string(),
                });
            }
            if continuations.contains_key(c.name()) {
                return Err(SpecificationError::DuplicateContinuation {
                    machine_type,
                    name: c.name().to_string(),
                });
            }
            continuations.insert(c.name().to_string(), c);
        }

        Ok(MachineType {
            name: machine_type,
            start,
            states,
            continuations,
            vars: self.vars,
        })
    }
}

// =============================================================================
// Program
// =============================================================================

/// A complete program under test.
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    machine_types: BTreeMap<String, Arc<MachineType>>,
    monitors: Vec<Arc<MachineType>>,
    subscriptions: BTreeMap<Event, Vec<usize>>,
    start: String,
    sync_events: BTreeSet<Event>,
    do_not_interleave: BTreeMap<Event, BTreeSet<Event>>,
}

impl Program {
    pub fn builder(name: impl Into<String>) -> ProgramBuilder {
        ProgramBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the machine type started first.
    pub fn start_type(&self) -> &str {
        &self.start
    }

    pub fn machine_type(&self, name: &str) -> Result<&Arc<MachineType>, SpecificationError> {
        self.machine_types
            .get(name)
            .ok_or_else(|| SpecificationError::UnknownMachineType { name: name.to_string() })
    }

    pub fn machine_types(&self) -> impl Iterator<Item = &Arc<MachineType>> {
        self.machine_types.values()
    }

    /// Monitor types in declaration order.
    pub fn monitors(&self) -> &[Arc<MachineType>] {
        &self.monitors
    }

    /// Indices (into [`monitors`](Self::monitors)) of monitors observing `event`.
    pub fn subscribers(&self, event: &Event) -> &[usize] {
        self.subscriptions.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The event with its declared synchronous flag applied.
    pub fn canonical_event(&self, event: Event) -> Event {
        match self.sync_events.get(&event) {
            Some(declared) => declared.clone(),
            None => event,
        }
    }

    /// Whether `candidate` may be interleaved with an already chosen `other`.
    pub fn may_interleave(&self, candidate: &Event, other: &Event) -> bool {
        self.do_not_interleave
            .get(candidate)
            .map(|set| !set.contains(other))
            .unwrap_or(true)
    }

    pub fn has_interleave_map(&self) -> bool {
        !self.do_not_interleave.is_empty()
    }
}

/// Builder for [`Program`].
pub struct ProgramBuilder {
    name: String,
    machine_types: Vec<MachineType>,
    monitors: Vec<(MachineType, Vec<Event>)>,
    start: Option<String>,
    sync_events: BTreeSet<Event>,
    do_not_interleave: BTreeMap<Event, BTreeSet<Event>>,
}

impl ProgramBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            machine_types: Vec::new(),
            monitors: Vec::new(),
            start: None,
            sync_events: BTreeSet::new(),
            do_not_interleave: BTreeMap::new(),
        }
    }

    pub fn machine(mut self, machine_type: MachineType) -> Self {
        self.machine_types.push(machine_type);
        self
    }

    /// Add a monitor observing `events`.
    pub fn monitor<I, E>(mut self, monitor: MachineType, events: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Event>,
    {
        self.monitors
            .push((monitor, events.into_iter().map(Into::into).collect()));
        self
    }

    pub fn start(mut self, machine_type: impl Into<String>) -> Self {
        self.start = Some(machine_type.into());
        self
    }

    /// Declare `event` synchronous for every sender.
    pub fn synchronous(mut self, event: impl AsRef<str>) -> Self {
        self.sync_events.insert(Event::synchronous(event));
        self
    }

    /// Never schedule a message carrying `event` next to one carrying any of `others`.
    pub fn do_not_interleave<I, E>(mut self, event: impl Into<Event>, others: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Event>,
    {
        self.do_not_interleave
            .entry(event.into())
            .or_default()
            .extend(others.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<Program, SpecificationError> {
        let start = self.start.ok_or(SpecificationError::MissingStartMachine)?;

        let mut machine_types = BTreeMap::new();
        for ty in self.machine_types {
            if machine_types.contains_key(ty.name()) {
                return Err(SpecificationError::DuplicateMachineType {
                    name: ty.name().to_string(),
                });
            }
            machine_types.insert(ty.name().to_string(), Arc::new(ty));
        }
        if !machine_types.contains_key(&start) {
            return Err(SpecificationError::UnknownMachineType { name: start });
        }

        let mut monitors = Vec::new();
        let mut subscriptions: BTreeMap<Event, Vec<usize>> = BTreeMap::new();
        for (index, (monitor, events)) in self.monitors.into_iter().enumerate() {
            if machine_types.contains_key(monitor.name())
                || monitors.iter().any(|m: &Arc<MachineType>| m.name() == monitor.name())
            {
                return Err(SpecificationError::DuplicateMachineType {
                    name: monitor.name().to_string(),
                });
            }
            for event in events {
                subscriptions.entry(event).or_default().push(index);
            }
            monitors.push(Arc::new(monitor));
        }

        Ok(Program {
            name: self.name,
            machine_types,
            monitors,
            subscriptions,
            start,
            sync_events: self.sync_events,
            do_not_interleave: self.do_not_interleave,
        })
    }
}
