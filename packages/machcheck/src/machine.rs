//! Machine runtime: one live instance of a [`MachineType`].
//!
//! # Overview
//!
//! A [`Machine`] owns its state stack, its variables and its message buffer.
//! It never owns a reference to a peer or to the scheduler. Everything a
//! handler wants from the outside world goes through the [`Environment`]
//! passed in for the duration of one dispatch, and everything it wants to do
//! to its own control state is recorded on the [`MachineContext`] and applied
//! once the handler returns, in a fixed order:
//!
//! ```text
//! halt ─► push / pop ─► goto ─► raise
//! ```
//!
//! # Delivery rules
//!
//! - blocked on a continuation: `halt` halts, a resumable event resumes,
//!   anything else stays queued
//! - otherwise the state stack is searched from the top for a handler
//! - no handler for `halt` halts the machine
//! - no handler for anything else is [`SpecificationError::UnhandledEvent`]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::continuation::{PendingTransition, ResumeFn, UnblockPhase};
use crate::core::{Event, MachineId, Message};
use crate::error::{CheckerError, Result, SpecificationError};
use crate::program::{Action, Handler, MachineType, StateDef, Vars};
use crate::queue::MessageQueue;
use crate::value::Value;

// =============================================================================
// Environment
// =============================================================================

/// What a handler can ask of the world outside its own machine.
///
/// The scheduler implements this for ordinary machines. Monitors get an
/// environment that rejects every request.
pub trait Environment {
    /// Send `message` on behalf of `origin`.
    fn send(&mut self, origin: &MachineId, message: Message) -> Result<()>;

    /// Create a machine of `machine_type` on behalf of `origin`.
    fn create_machine(
        &mut self,
        origin: &MachineId,
        machine_type: &str,
        payload: Option<Value>,
    ) -> Result<MachineId>;

    /// Resolve a nondeterministic choice among `candidates` (never empty).
    fn choose(&mut self, origin: &MachineId, candidates: Vec<Value>) -> Result<Value>;

    /// Announce `event` to the monitors subscribed to it.
    fn announce(&mut self, origin: &MachineId, event: Event, payload: Option<Value>) -> Result<()>;
}

/// Environment for monitors: observation only.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonitorEnvironment;

impl MonitorEnvironment {
    fn reject<T>(origin: &MachineId, action: &'static str) -> Result<T> {
        Err(SpecificationError::IllegalMonitorAction {
            monitor: origin.clone(),
            action,
        }
        .into())
    }
}

impl Environment for MonitorEnvironment {
    fn send(&mut self, origin: &MachineId, _message: Message) -> Result<()> {
        Self::reject(origin, "send")
    }

    fn create_machine(&mut self, origin: &MachineId, _: &str, _: Option<Value>) -> Result<MachineId> {
        Self::reject(origin, "create machines")
    }

    fn choose(&mut self, origin: &MachineId, _: Vec<Value>) -> Result<Value> {
        Self::reject(origin, "make nondeterministic choices")
    }

    fn announce(&mut self, origin: &MachineId, _: Event, _: Option<Value>) -> Result<()> {
        Self::reject(origin, "announce")
    }
}

// =============================================================================
// Machine Context
// =============================================================================

#[derive(Default)]
struct Intents {
    halt: bool,
    block: Option<String>,
    goto: Option<(String, Option<Value>)>,
    push: Option<(String, Option<Value>)>,
    pop: bool,
    raise: Option<(Event, Option<Value>)>,
}

impl Intents {
    fn changes_state(&self) -> bool {
        self.goto.is_some() || self.push.is_some() || self.pop || self.raise.is_some()
    }
}

/// The handle a handler gets to its own machine and to the environment.
pub struct MachineContext<'a> {
    id: &'a MachineId,
    machine_type: &'a MachineType,
    state: &'a str,
    vars: &'a mut Vars,
    env: &'a mut dyn Environment,
    intents: Intents,
}

impl<'a> MachineContext<'a> {
    /// This machine's id.
    pub fn id(&self) -> &MachineId {
        self.id
    }

    /// The state the handler runs in.
    pub fn state(&self) -> &str {
        self.state
    }

    /// Read a declared variable.
    pub fn get(&self, field: &str) -> Result<&Value> {
        self.vars.get(field).ok_or_else(|| self.illegal_field(field))
    }

    /// Read a declared integer variable.
    pub fn get_int(&self, field: &str) -> Result<i64> {
        let value = self.get(field)?;
        value.as_int().ok_or_else(|| {
            CheckerError::assertion(
                Some(self.id.clone()),
                format!("field `{}` holds {} where an int was expected", field, value),
            )
        })
    }

    /// Write a declared variable.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        if !self.machine_type.declares_var(field) {
            return Err(self.illegal_field(field));
        }
        self.vars.insert(field.to_string(), value.into());
        Ok(())
    }

    fn illegal_field(&self, field: &str) -> CheckerError {
        SpecificationError::IllegalFieldAccess {
            machine: self.id.clone(),
            field: field.to_string(),
        }
        .into()
    }

    /// Send `event` to `target`.
    pub fn send(&mut self, target: &MachineId, event: impl Into<Event>, payload: Option<Value>) -> Result<()> {
        let message = Message::new(event, target.clone(), Some(self.id.clone()), payload);
        self.env.send(self.id, message)
    }

    /// Create a machine and return its id. It starts when its creation is scheduled.
    pub fn create(&mut self, machine_type: &str, payload: Option<Value>) -> Result<MachineId> {
        self.env.create_machine(self.id, machine_type, payload)
    }

    /// Announce `event` to subscribed monitors.
    pub fn announce(&mut self, event: impl Into<Event>, payload: Option<Value>) -> Result<()> {
        self.env.announce(self.id, event.into(), payload)
    }

    /// Pick one of `candidates`. The pick is recorded as a data choice.
    pub fn choose(&mut self, candidates: Vec<Value>) -> Result<Value> {
        if candidates.is_empty() {
            return Err(SpecificationError::EmptyChoice {
                machine: self.id.clone(),
            }
            .into());
        }
        self.env.choose(self.id, candidates)
    }

    /// Nondeterministic boolean.
    pub fn choose_bool(&mut self) -> Result<bool> {
        let v = self.choose(vec![Value::Bool(false), Value::Bool(true)])?;
        v.as_bool()
            .ok_or_else(|| CheckerError::internal(format!("boolean choice resolved to {}", v)))
    }

    /// Nondeterministic integer in `0..bound`.
    pub fn choose_int(&mut self, bound: i64) -> Result<i64> {
        let v = self.choose((0..bound).map(Value::Int).collect())?;
        v.as_int()
            .ok_or_else(|| CheckerError::internal(format!("integer choice resolved to {}", v)))
    }

    /// Fail the schedule with an assertion bug unless `condition` holds.
    pub fn assert(&self, condition: bool, message: impl Into<String>) -> Result<()> {
        if condition {
            Ok(())
        } else {
            Err(CheckerError::assertion(Some(self.id.clone()), message))
        }
    }

    /// Transition to `state` once the handler returns.
    pub fn goto(&mut self, state: impl Into<String>, payload: Option<Value>) -> Result<()> {
        let state = self.known_state(state.into())?;
        self.intents.goto = Some((state, payload));
        Ok(())
    }

    /// Push `state` on top of the current one once the handler returns.
    pub fn push(&mut self, state: impl Into<String>, payload: Option<Value>) -> Result<()> {
        let state = self.known_state(state.into())?;
        self.intents.push = Some((state, payload));
        Ok(())
    }

    /// Pop the current state once the handler returns.
    pub fn pop(&mut self) {
        self.intents.pop = true;
    }

    /// Handle `event` immediately after this handler, ahead of the queue.
    pub fn raise(&mut self, event: impl Into<Event>, payload: Option<Value>) {
        self.intents.raise = Some((event.into(), payload));
    }

    /// Halt once the handler returns.
    pub fn halt(&mut self) {
        self.intents.halt = true;
    }

    /// Block on the continuation named `continuation` once the handler returns.
    pub fn receive(&mut self, continuation: &str) -> Result<()> {
        if self.machine_type.continuation(continuation).is_none() {
            return Err(SpecificationError::UnknownContinuation {
                machine_type: self.machine_type.name().to_string(),
                name: continuation.to_string(),
            }
            .into());
        }
        self.intents.block = Some(continuation.to_string());
        Ok(())
    }

    fn known_state(&self, state: String) -> Result<String> {
        if self.machine_type.state(&state).is_none() {
            return Err(SpecificationError::UnknownState {
                machine_type: self.machine_type.name().to_string(),
                state,
            }
            .into());
        }
        Ok(state)
    }
}

// =============================================================================
// Machine
// =============================================================================

/// A live machine instance.
pub struct Machine {
    id: MachineId,
    ty: Arc<MachineType>,
    state_stack: SmallVec<[String; 4]>,
    vars: Vars,
    buffer: MessageQueue,
    started: bool,
    halted: bool,
    continuation: Option<String>,
    pending: PendingTransition,
}

impl Machine {
    /// A fresh, unstarted machine sitting in its type's start state.
    pub fn new(id: MachineId, ty: Arc<MachineType>) -> Self {
        let mut state_stack = SmallVec::new();
        state_stack.push(ty.start().to_string());
        let vars = ty.initial_vars().clone();
        Self {
            id,
            ty,
            state_stack,
            vars,
            buffer: MessageQueue::new(),
            started: false,
            halted: false,
            continuation: None,
            pending: PendingTransition::default(),
        }
    }

    pub fn id(&self) -> &MachineId {
        &self.id
    }

    pub fn machine_type(&self) -> &Arc<MachineType> {
        &self.ty
    }

    /// Name of the state on top of the stack.
    pub fn current_state(&self) -> &str {
        self.state_stack.last().map(String::as_str).unwrap_or_default()
    }

    fn current_state_def(&self) -> Option<&StateDef> {
        self.ty.state(self.current_state())
    }

    pub fn state_stack(&self) -> &[String] {
        &self.state_stack
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn buffer(&self) -> &MessageQueue {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut MessageQueue {
        &mut self.buffer
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_blocked(&self) -> bool {
        self.continuation.is_some()
    }

    /// Name of the continuation this machine is blocked on.
    pub fn blocked_on(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    pub fn pending_transition(&self) -> &PendingTransition {
        &self.pending
    }

    /// Whether the current state is hot.
    pub fn is_hot(&self) -> bool {
        self.current_state_def().map(StateDef::is_hot).unwrap_or(false)
    }

    /// Whether a message carrying `event` addressed to this machine must stay queued.
    pub fn is_deferred(&self, event: &Event) -> bool {
        if self.halted {
            return false;
        }
        if !self.started {
            return !event.is_create_machine();
        }
        if let Some(name) = &self.continuation {
            return self
                .ty
                .continuation(name)
                .map(|c| c.is_deferred(event))
                .unwrap_or(true);
        }
        Self::lookup(&self.ty, &self.state_stack, event)
            .map(|h| matches!(h, Handler::Defer))
            .unwrap_or(false)
    }

    /// Halt: drop any continuation and parked transition.
    pub fn halt(&mut self) {
        self.halted = true;
        self.continuation = None;
        self.pending = PendingTransition::default();
    }

    /// Hash everything that distinguishes this machine's global state.
    pub fn fingerprint<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.state_stack.hash(state);
        self.vars.hash(state);
        for message in self.buffer.iter() {
            message.hash(state);
        }
        self.started.hash(state);
        self.halted.hash(state);
        self.continuation.hash(state);
        self.pending.hash(state);
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    /// Deliver one message.
    pub fn process(&mut self, env: &mut dyn Environment, message: Message) -> Result<()> {
        if self.halted {
            return Ok(());
        }
        if message.is_create_machine() {
            if self.started {
                return Err(CheckerError::internal(format!("{} created twice", self.id)));
            }
            return self.start(env, message.payload);
        }
        if let Some(name) = self.continuation.clone() {
            return self.resume(env, &name, message);
        }
        self.handle(env, message.event, message.payload)
    }

    /// Enter the start state.
    pub fn start(&mut self, env: &mut dyn Environment, payload: Option<Value>) -> Result<()> {
        self.started = true;
        let start = self.ty.start().to_string();
        self.enter(env, start, payload)
    }

    fn resume(&mut self, env: &mut dyn Environment, name: &str, message: Message) -> Result<()> {
        if message.event.is_halt() {
            self.halt();
            return Ok(());
        }
        let ty = Arc::clone(&self.ty);
        let continuation = ty.continuation(name).ok_or_else(|| SpecificationError::UnknownContinuation {
            machine_type: ty.name().to_string(),
            name: name.to_string(),
        })?;
        if !continuation.resumes_on(&message.event) {
            return Err(CheckerError::internal(format!(
                "{} blocked on {} was delivered {}",
                self.id, name, message.event
            )));
        }
        self.continuation = None;
        let intents = self.run_resume(env, continuation.resume_fn(), &message)?;
        self.apply(env, intents)?;
        self.run_after(env)
    }

    /// Exit, entry, then clear, each only while still unblocked.
    fn run_after(&mut self, env: &mut dyn Environment) -> Result<()> {
        for phase in UnblockPhase::ORDER {
            if self.halted || self.is_blocked() {
                return Ok(());
            }
            match phase {
                UnblockPhase::Exit => {
                    if let Some(state) = self.pending.exit.take() {
                        let intents = self.run_exit_of(env, &state)?;
                        self.apply_exit(intents)?;
                    }
                }
                UnblockPhase::Entry => {
                    if let Some((target, payload)) = self.pending.entry.take() {
                        self.enter(env, target, payload)?;
                    }
                }
                UnblockPhase::Clear => {
                    let ty = Arc::clone(&self.ty);
                    for continuation in ty.continuations() {
                        continuation.clear(&mut self.vars);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle(&mut self, env: &mut dyn Environment, event: Event, payload: Option<Value>) -> Result<()> {
        let ty = Arc::clone(&self.ty);
        match Self::lookup(&ty, &self.state_stack, &event) {
            Some(Handler::Do(action)) => {
                let intents = self.run_action(env, action, payload.as_ref())?;
                self.apply(env, intents)
            }
            Some(Handler::Goto { target, action }) => {
                self.transition(env, target.clone(), action.as_ref(), payload)
            }
            Some(Handler::Ignore) => Ok(()),
            Some(Handler::Defer) => Err(CheckerError::internal(format!(
                "{} was delivered {} which it defers in {}",
                self.id,
                event,
                self.current_state()
            ))),
            None if event.is_halt() => {
                self.halt();
                Ok(())
            }
            None => Err(SpecificationError::UnhandledEvent {
                machine: self.id.clone(),
                state: self.current_state().to_string(),
                event,
            }
            .into()),
        }
    }

    fn lookup<'t>(ty: &'t MachineType, stack: &[String], event: &Event) -> Option<&'t Handler> {
        stack
            .iter()
            .rev()
            .find_map(|state| ty.state(state).and_then(|s| s.handler(event)))
    }

    fn settled(&self) -> bool {
        self.halted || self.is_blocked()
    }

    fn apply(&mut self, env: &mut dyn Environment, intents: Intents) -> Result<()> {
        if intents.halt {
            self.halt();
            return Ok(());
        }

        if let Some(name) = intents.block {
            if intents.raise.is_some() {
                return Err(self.illegal("cannot raise an event while blocking"));
            }
            if intents.push.is_some() || intents.pop {
                return Err(self.illegal("cannot push or pop while blocking"));
            }
            self.continuation = Some(name);
            if let Some((target, payload)) = intents.goto {
                self.pending = PendingTransition::goto(self.current_state(), target, payload);
            }
            return Ok(());
        }

        if intents.pop {
            self.pop_state(env)?;
            if self.settled() {
                return Ok(());
            }
        }
        if let Some((target, payload)) = intents.push {
            self.push_state(env, target, payload)?;
            if self.settled() {
                return Ok(());
            }
        }
        if let Some((target, payload)) = intents.goto {
            // A transition requested after resuming supersedes a parked one.
            self.pending = PendingTransition::default();
            self.transition(env, target, None, payload)?;
            if self.settled() {
                return Ok(());
            }
        }
        if let Some((event, payload)) = intents.raise {
            self.handle(env, event, payload)?;
        }
        Ok(())
    }

    /// Intents from exit actions and transition actions may only halt or block.
    fn apply_exit(&mut self, intents: Intents) -> Result<()> {
        if intents.changes_state() {
            return Err(self.illegal("exit and transition actions may not change state"));
        }
        if intents.halt {
            self.halt();
        } else if let Some(name) = intents.block {
            self.continuation = Some(name);
        }
        Ok(())
    }

    fn transition(
        &mut self,
        env: &mut dyn Environment,
        target: String,
        action: Option<&Action>,
        payload: Option<Value>,
    ) -> Result<()> {
        let current = self.current_state().to_string();
        let intents = self.run_exit_of(env, &current)?;
        self.apply_exit(intents)?;
        if self.halted {
            return Ok(());
        }
        if let Some(action) = action {
            let intents = self.run_action(env, action, payload.as_ref())?;
            if intents.block.is_some() {
                return Err(self.illegal("transition actions may not block"));
            }
            self.apply_exit(intents)?;
            if self.halted {
                return Ok(());
            }
        }
        if self.is_blocked() {
            self.pending = PendingTransition::entry_only(target, payload);
            return Ok(());
        }
        self.enter(env, target, payload)
    }

    fn enter(&mut self, env: &mut dyn Environment, target: String, payload: Option<Value>) -> Result<()> {
        match self.state_stack.last_mut() {
            Some(top) => *top = target,
            None => self.state_stack.push(target),
        }
        self.run_entry(env, payload)
    }

    fn push_state(&mut self, env: &mut dyn Environment, target: String, payload: Option<Value>) -> Result<()> {
        self.state_stack.push(target);
        self.run_entry(env, payload)
    }

    fn pop_state(&mut self, env: &mut dyn Environment) -> Result<()> {
        if self.state_stack.len() <= 1 {
            return Err(SpecificationError::PopEmptyStack {
                machine: self.id.clone(),
            }
            .into());
        }
        let current = self.current_state().to_string();
        let intents = self.run_exit_of(env, &current)?;
        self.state_stack.pop();
        self.apply_exit(intents)
    }

    fn run_entry(&mut self, env: &mut dyn Environment, payload: Option<Value>) -> Result<()> {
        let ty = Arc::clone(&self.ty);
        let state = self.current_state().to_string();
        let def = ty.state(&state).ok_or_else(|| SpecificationError::UnknownState {
            machine_type: ty.name().to_string(),
            state: state.clone(),
        })?;
        if let Some(entry) = def.entry() {
            let intents = self.run_action(env, entry, payload.as_ref())?;
            self.apply(env, intents)?;
        }
        Ok(())
    }

    fn run_exit_of(&mut self, env: &mut dyn Environment, state: &str) -> Result<Intents> {
        let ty = Arc::clone(&self.ty);
        match ty.state(state).and_then(StateDef::exit) {
            Some(exit) => self.run_action(env, exit, None),
            None => Ok(Intents::default()),
        }
    }

    fn run_action(&mut self, env: &mut dyn Environment, action: &Action, payload: Option<&Value>) -> Result<Intents> {
        let ty = Arc::clone(&self.ty);
        let state = self.current_state().to_string();
        let mut ctx = MachineContext {
            id: &self.id,
            machine_type: &ty,
            state: &state,
            vars: &mut self.vars,
            env,
            intents: Intents::default(),
        };
        action(&mut ctx, payload)?;
        Ok(ctx.intents)
    }

    fn run_resume(&mut self, env: &mut dyn Environment, resume: &ResumeFn, message: &Message) -> Result<Intents> {
        let ty = Arc::clone(&self.ty);
        let state = self.current_state().to_string();
        let mut ctx = MachineContext {
            id: &self.id,
            machine_type: &ty,
            state: &state,
            vars: &mut self.vars,
            env,
            intents: Intents::default(),
        };
        resume(&mut ctx, message)?;
        Ok(ctx.intents)
    }

    fn illegal(&self, reason: &'static str) -> CheckerError {
        SpecificationError::IllegalTransition {
            machine: self.id.clone(),
            reason,
        }
        .into()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("state_stack", &self.state_stack)
            .field("buffered", &self.buffer.len())
            .field("started", &self.started)
            .field("halted", &self.halted)
            .field("blocked_on", &self.continuation)
            .finish()
    }
}
