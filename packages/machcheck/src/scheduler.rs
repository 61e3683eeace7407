//! The single-schedule step loop.
//!
//! # Overview
//!
//! A [`Scheduler`] executes exactly one schedule. It owns every machine of
//! that run in an arena indexed by creation order, asks a [`ChoicePolicy`]
//! for each decision, and records what it did in the borrowed
//! [`Schedule`].
//!
//! ```text
//! Idle ─► Stepping ─┬─► Terminated
//!                   ├─► Deadlocked
//!                   ├─► StepBoundExceeded
//!                   └─► BugFound
//! ```
//!
//! # One step
//!
//! 1. Compute candidates: a machine whose next deliverable message creates a
//!    machine runs alone; else one with a synchronous message runs alone;
//!    else every machine with a deliverable message is a candidate
//!    (optionally filtered by the program's do-not-interleave map).
//! 2. No candidates: the run terminated. Live machines still holding
//!    messages mean deadlock; hot monitors mean a liveness violation.
//! 3. Ask the policy which candidate runs and record the choice.
//! 4. Dequeue that machine's next deliverable message and dispatch it to its
//!    target. Messages to halted machines are dropped. Monitors subscribed
//!    to the event observe it afterwards.
//! 5. Count the step, then check cycles, the step bound and the budget.
//!
//! With [`BufferSemantics::SenderQueue`] a machine's buffer holds what it
//! sent and the chosen candidate is a sender. With
//! [`BufferSemantics::ReceiverQueue`] it holds what it will receive.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{BufferSemantics, CheckerConfig};
use crate::core::{Event, MachineId, Message};
use crate::error::{BugFound, CheckerError, Result, SpecificationError};
use crate::machine::{Environment, Machine, MonitorEnvironment};
use crate::orchestration::{LearningTable, Orchestrator};
use crate::program::Program;
use crate::resource::{BudgetCheck, ResourceMonitor, Unlimited};
use crate::schedule::Schedule;
use crate::trace::{NoopSink, TraceSink, TracingSink};
use crate::value::Value;

// =============================================================================
// Check Context
// =============================================================================

/// Process-scoped collaborators of one search: budget, trace sink and the
/// learning table shared by its workers.
#[derive(Clone)]
pub struct CheckContext {
    pub budget: Arc<dyn BudgetCheck>,
    pub sink: Arc<dyn TraceSink>,
    pub learning: LearningTable,
}

impl CheckContext {
    /// Budget from `config`, logging through `tracing`, fresh learning table.
    pub fn new(config: &CheckerConfig) -> Self {
        Self {
            budget: Arc::new(ResourceMonitor::new(config.time_limit_secs, config.mem_limit_mb)),
            sink: Arc::new(TracingSink),
            learning: LearningTable::new(),
        }
    }

    /// No budget, no tracing.
    pub fn unlimited() -> Self {
        Self {
            budget: Arc::new(Unlimited),
            sink: Arc::new(NoopSink),
            learning: LearningTable::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetCheck>) -> Self {
        self.budget = budget;
        self
    }
}

impl fmt::Debug for CheckContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckContext")
            .field("learning_entries", &self.learning.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Choice Policy
// =============================================================================

/// Resolves schedule and data choices for a [`Scheduler`].
pub trait ChoicePolicy {
    /// Pick the machine to run at `depth`. `None` ends the schedule.
    fn schedule_choice(
        &mut self,
        schedule: &mut Schedule,
        depth: usize,
        candidates: Vec<MachineId>,
        state: u64,
    ) -> Result<Option<MachineId>>;

    /// Pick a value at `depth`. `candidates` is never empty.
    fn data_choice(&mut self, schedule: &mut Schedule, depth: usize, candidates: Vec<Value>, state: u64) -> Result<Value>;

    /// Called before the `position`-th machine of the run is registered.
    fn machine_created(&mut self, _schedule: &Schedule, _position: usize, _id: &MachineId) -> Result<()> {
        Ok(())
    }

    /// Called for every dequeued message, before dispatch.
    fn message_delivered(&mut self, _message: &Message) {}

    /// Whether choices need the global state key.
    fn wants_state_key(&self) -> bool {
        false
    }
}

/// Exploration: repeat what the schedule says, otherwise take the first
/// reordered candidate and leave the rest as backtracks.
pub struct ExplorationPolicy<'o> {
    orchestrator: &'o mut Orchestrator,
}

impl<'o> ExplorationPolicy<'o> {
    pub fn new(orchestrator: &'o mut Orchestrator) -> Self {
        Self { orchestrator }
    }
}

impl ChoicePolicy for ExplorationPolicy<'_> {
    fn schedule_choice(
        &mut self,
        schedule: &mut Schedule,
        depth: usize,
        mut candidates: Vec<MachineId>,
        state: u64,
    ) -> Result<Option<MachineId>> {
        if let Some(repeat) = schedule.repeat_schedule_choice(depth).cloned() {
            if !candidates.contains(&repeat) {
                return Err(CheckerError::internal(format!(
                    "nondeterministic program: repeated schedule choice {} at depth {} not among {:?}",
                    repeat, depth, candidates
                )));
            }
            self.orchestrator.record(state, &repeat);
            return Ok(Some(repeat));
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        self.orchestrator.reorder(state, &mut candidates);
        let first = candidates.remove(0);
        self.orchestrator.record(state, &first);
        schedule.set_repeat_schedule_choice(first.clone(), depth);
        schedule.add_backtrack_schedule_choices(candidates, depth);
        Ok(Some(first))
    }

    fn data_choice(&mut self, schedule: &mut Schedule, depth: usize, mut candidates: Vec<Value>, state: u64) -> Result<Value> {
        if let Some(repeat) = schedule.repeat_data_choice(depth).cloned() {
            if !candidates.contains(&repeat) {
                return Err(CheckerError::internal(format!(
                    "nondeterministic program: repeated data choice {} at depth {} not among {:?}",
                    repeat, depth, candidates
                )));
            }
            self.orchestrator.record(state, &repeat);
            return Ok(repeat);
        }
        self.orchestrator.reorder(state, &mut candidates);
        let first = candidates.remove(0);
        self.orchestrator.record(state, &first);
        schedule.set_repeat_data_choice(first.clone(), depth);
        schedule.add_backtrack_data_choices(candidates, depth);
        Ok(first)
    }

    fn wants_state_key(&self) -> bool {
        self.orchestrator.wants_state_key()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Lifecycle of one schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Stepping,
    Terminated,
    Deadlocked,
    StepBoundExceeded,
    BugFound,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Stepping => "stepping",
            SchedulerState::Terminated => "terminated",
            SchedulerState::Deadlocked => "deadlocked",
            SchedulerState::StepBoundExceeded => "step_bound_exceeded",
            SchedulerState::BugFound => "bug_found",
        };
        f.write_str(s)
    }
}

enum Staged {
    Send(Message),
    Announce(Event, Option<Value>),
}

/// Executes one schedule.
pub struct Scheduler<'a> {
    program: &'a Program,
    config: &'a CheckerConfig,
    schedule: &'a mut Schedule,
    policy: &'a mut dyn ChoicePolicy,
    sink: &'a dyn TraceSink,
    budget: &'a dyn BudgetCheck,
    machines: Vec<Option<Machine>>,
    index: HashMap<MachineId, usize>,
    type_counts: HashMap<String, usize>,
    monitors: Vec<Machine>,
    staged: Vec<Staged>,
    visited: HashSet<u64>,
    state: SchedulerState,
    step: usize,
    choice_depth: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        program: &'a Program,
        config: &'a CheckerConfig,
        context: &'a CheckContext,
        schedule: &'a mut Schedule,
        policy: &'a mut dyn ChoicePolicy,
    ) -> Self {
        Self {
            program,
            config,
            schedule,
            policy,
            sink: context.sink.as_ref(),
            budget: context.budget.as_ref(),
            machines: Vec::new(),
            index: HashMap::new(),
            type_counts: HashMap::new(),
            monitors: Vec::new(),
            staged: Vec::new(),
            visited: HashSet::new(),
            state: SchedulerState::Idle,
            step: 0,
            choice_depth: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Messages dispatched so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Choices resolved so far.
    pub fn choice_depth(&self) -> usize {
        self.choice_depth
    }

    /// Machines in creation order.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().flatten()
    }

    pub fn machine(&self, id: &MachineId) -> Option<&Machine> {
        self.index.get(id).and_then(|&i| self.machines.get(i)).and_then(Option::as_ref)
    }

    pub fn monitors(&self) -> &[Machine] {
        &self.monitors
    }

    /// Run the schedule to its end.
    ///
    /// Bugs come back as `Err(CheckerError::Bug(_))` with the state set to
    /// `Deadlocked`, `StepBoundExceeded` or `BugFound`.
    pub fn run(&mut self) -> Result<SchedulerState> {
        self.schedule.reset_run();
        let result = self.drive();
        self.schedule.set_scheduler_depth(self.step);
        self.schedule.set_scheduler_choice_depth(self.choice_depth);
        self.staged.clear();
        match result {
            Ok(end) => {
                self.state = end;
                Ok(end)
            }
            Err(err) => {
                self.state = match &err {
                    CheckerError::Bug(BugFound::Deadlock { .. }) => SchedulerState::Deadlocked,
                    CheckerError::Bug(BugFound::StepBoundExceeded { .. }) => SchedulerState::StepBoundExceeded,
                    CheckerError::Bug(_) => SchedulerState::BugFound,
                    _ => self.state,
                };
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<SchedulerState> {
        self.start()?;
        self.state = SchedulerState::Stepping;
        loop {
            if let Some(end) = self.step()? {
                return Ok(end);
            }
        }
    }

    /// Start monitors, then the program's start machine. Not counted as steps.
    fn start(&mut self) -> Result<()> {
        let program = self.program;
        for ty in program.monitors() {
            let mut monitor = Machine::new(MachineId::new(ty.name(), 0), Arc::clone(ty));
            monitor.start(&mut MonitorEnvironment, None)?;
            Self::check_monitor(&monitor)?;
            self.monitors.push(monitor);
        }

        let id = self.allocate(program.start_type())?;
        let slot = self.slot_of(&id)?;
        self.process_in_slot(slot, Message::new(Event::create_machine(), id.clone(), None, None))?;
        self.flush_staged()?;
        debug!(program = program.name(), start = %id, "schedule started");

        if self.config.detect_cycles {
            let key = self.state_key();
            self.visited.insert(key);
        }
        Ok(())
    }

    /// Execute one step. `Some(state)` when the schedule has ended.
    pub fn step(&mut self) -> Result<Option<SchedulerState>> {
        let candidates = self.candidates();
        let had_candidates = !candidates.is_empty();
        let key = if self.policy.wants_state_key() { self.state_key() } else { 0 };

        let chosen = self
            .policy
            .schedule_choice(self.schedule, self.choice_depth, candidates, key)?;
        let Some(chosen) = chosen else {
            if had_candidates {
                debug!(step = self.step, "schedule exhausted before the program terminated");
                return Ok(Some(SchedulerState::Terminated));
            }
            return self.terminate().map(Some);
        };
        self.sink.on_schedule_choice(self.choice_depth, &chosen);
        self.choice_depth += 1;

        let slot = self.slot_of(&chosen)?;
        let message = self.dequeue_from(slot)?;
        let delivered = self.deliver(message);
        self.step += 1;
        delivered?;

        if self.config.detect_cycles {
            let key = self.state_key();
            if !self.visited.insert(key) {
                warn!(step = self.step, "global state revisited");
                return Err(BugFound::Cycle { step: self.step }.into());
            }
        }

        if self.step >= self.config.max_step_bound {
            if self.config.fail_on_max_step_bound {
                warn!(bound = self.config.max_step_bound, "step bound exceeded");
                return Err(BugFound::StepBoundExceeded {
                    bound: self.config.max_step_bound,
                }
                .into());
            }
            debug!(bound = self.config.max_step_bound, "step bound reached");
            return Ok(Some(SchedulerState::StepBoundExceeded));
        }

        self.budget.check()?;
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Candidates
    // -------------------------------------------------------------------------

    fn is_deferred(&self, message: &Message) -> bool {
        self.machine(&message.target)
            .map(|target| target.is_deferred(&message.event))
            .unwrap_or(false)
    }

    /// Candidate machines for the next step, in creation order.
    pub fn candidates(&self) -> Vec<MachineId> {
        let deferred = |m: &Message| self.is_deferred(m);
        let active: Vec<&Machine> = self
            .machines()
            .filter(|m| !m.is_halted() && !m.buffer().is_empty())
            .collect();

        if let Some(m) = active.iter().find(|m| m.buffer().has_create_machine_pending(deferred)) {
            return vec![m.id().clone()];
        }
        if let Some(m) = active.iter().find(|m| m.buffer().has_sync_event_pending(deferred)) {
            return vec![m.id().clone()];
        }

        let reduce = self.config.interleave_reduction && self.program.has_interleave_map();
        let mut taken_events: Vec<&Event> = Vec::new();
        let mut candidates = Vec::new();
        for m in active {
            let Some(next) = m.buffer().find_next(deferred) else {
                continue;
            };
            if reduce
                && taken_events
                    .iter()
                    .any(|other| !self.program.may_interleave(&next.event, other))
            {
                continue;
            }
            taken_events.push(&next.event);
            candidates.push(m.id().clone());
        }
        candidates
    }

    fn terminate(&mut self) -> Result<SchedulerState> {
        let stuck: Vec<MachineId> = self
            .machines()
            .filter(|m| !m.is_halted() && !m.buffer().is_empty())
            .map(|m| m.id().clone())
            .collect();
        if !stuck.is_empty() {
            warn!(step = self.step, machines = ?stuck, "deadlock");
            return Err(BugFound::Deadlock { machines: stuck }.into());
        }

        if self.config.check_liveness {
            if let Some(monitor) = self.monitors.iter().find(|m| m.is_hot()) {
                warn!(monitor = %monitor.id(), state = monitor.current_state(), "liveness violation");
                return Err(BugFound::Liveness {
                    monitor: monitor.id().clone(),
                    state: monitor.current_state().to_string(),
                }
                .into());
            }
        }

        debug!(steps = self.step, "schedule terminated");
        Ok(SchedulerState::Terminated)
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn slot_of(&self, id: &MachineId) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| CheckerError::internal(format!("unknown machine {}", id)))
    }

    fn machine_mut(&mut self, slot: usize) -> Result<&mut Machine> {
        self.machines
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| CheckerError::internal(format!("machine slot {} is empty", slot)))
    }

    fn dequeue_from(&mut self, slot: usize) -> Result<Message> {
        let mut buffer = std::mem::take(self.machine_mut(slot)?.buffer_mut());
        let peeked = buffer.peek_next(|m| self.is_deferred(m)).is_some();
        let message = if peeked {
            buffer.dequeue_next()
        } else {
            Err(CheckerError::internal("chosen machine has no deliverable message"))
        };
        *self.machine_mut(slot)?.buffer_mut() = buffer;
        message
    }

    fn deliver(&mut self, message: Message) -> Result<()> {
        let slot = self.slot_of(&message.target)?;
        self.policy.message_delivered(&message);
        self.sink.on_dispatch(self.step + 1, &message);

        if self.machine_mut(slot)?.is_halted() {
            trace!(%message, "dropped message to halted machine");
            return Ok(());
        }
        trace!(step = self.step + 1, %message, "dispatch");

        let event = message.event.clone();
        let payload = message.payload.clone();
        self.process_in_slot(slot, message)?;
        self.flush_staged()?;
        self.notify_monitors(&event, payload.as_ref())
    }

    /// Take the machine out of its slot so it can use `self` as environment.
    fn process_in_slot(&mut self, slot: usize, message: Message) -> Result<()> {
        let mut machine = self
            .machines
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| CheckerError::internal(format!("machine slot {} is empty", slot)))?;
        let result = machine.process(self, message);
        self.machines[slot] = Some(machine);
        result
    }

    fn flush_staged(&mut self) -> Result<()> {
        for staged in std::mem::take(&mut self.staged) {
            match staged {
                Staged::Send(message) => self.route(message)?,
                Staged::Announce(event, payload) => self.notify_monitors(&event, payload.as_ref())?,
            }
        }
        Ok(())
    }

    fn route(&mut self, message: Message) -> Result<()> {
        let owner = match self.config.buffer_semantics {
            BufferSemantics::SenderQueue => message.sender.as_ref().unwrap_or(&message.target),
            BufferSemantics::ReceiverQueue => &message.target,
        };
        let slot = self.slot_of(owner)?;
        self.machine_mut(slot)?.buffer_mut().enqueue(message);
        Ok(())
    }

    fn notify_monitors(&mut self, event: &Event, payload: Option<&Value>) -> Result<()> {
        let program = self.program;
        for &i in program.subscribers(event) {
            let Some(monitor) = self.monitors.get_mut(i) else {
                continue;
            };
            let message = Message::new(event.clone(), monitor.id().clone(), None, payload.cloned());
            monitor.process(&mut MonitorEnvironment, message)?;
            Self::check_monitor(monitor)?;
        }
        Ok(())
    }

    fn check_monitor(monitor: &Machine) -> Result<()> {
        if monitor.is_blocked() {
            return Err(SpecificationError::IllegalMonitorAction {
                monitor: monitor.id().clone(),
                action: "block",
            }
            .into());
        }
        Ok(())
    }

    fn allocate(&mut self, machine_type: &str) -> Result<MachineId> {
        let ty = Arc::clone(self.program.machine_type(machine_type)?);
        let count = self.type_counts.entry(machine_type.to_string()).or_insert(0);
        let id = MachineId::new(machine_type, *count);
        *count += 1;

        let position = self.machines.len();
        self.policy.machine_created(&*self.schedule, position, &id)?;
        self.schedule.make_machine(id.clone())?;
        self.machines.push(Some(Machine::new(id.clone(), ty)));
        self.index.insert(id.clone(), position);
        self.sink.on_create_machine(self.step, &id);
        trace!(machine = %id, step = self.step, "machine allocated");
        Ok(id)
    }

    /// Hash of every machine and monitor.
    pub fn state_key(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for machine in self.machines() {
            machine.fingerprint(&mut h);
        }
        for monitor in &self.monitors {
            monitor.fingerprint(&mut h);
        }
        h.finish()
    }
}

impl Environment for Scheduler<'_> {
    fn send(&mut self, origin: &MachineId, mut message: Message) -> Result<()> {
        if !self.index.contains_key(&message.target) {
            return Err(CheckerError::internal(format!(
                "{} sent {} to unknown machine {}",
                origin, message.event, message.target
            )));
        }
        message.event = self.program.canonical_event(message.event);
        self.staged.push(Staged::Send(message));
        Ok(())
    }

    fn create_machine(&mut self, origin: &MachineId, machine_type: &str, payload: Option<Value>) -> Result<MachineId> {
        let id = self.allocate(machine_type)?;
        self.staged.push(Staged::Send(Message::new(
            Event::create_machine(),
            id.clone(),
            Some(origin.clone()),
            payload,
        )));
        Ok(id)
    }

    fn choose(&mut self, origin: &MachineId, candidates: Vec<Value>) -> Result<Value> {
        let key = if self.policy.wants_state_key() { self.state_key() } else { 0 };
        let depth = self.choice_depth;
        let value = self.policy.data_choice(self.schedule, depth, candidates, key)?;
        self.sink.on_data_choice(depth, &value);
        self.choice_depth += 1;
        trace!(machine = %origin, depth, %value, "data choice");
        Ok(value)
    }

    fn announce(&mut self, _origin: &MachineId, event: Event, payload: Option<Value>) -> Result<()> {
        self.staged.push(Staged::Announce(event, payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::OrchestratorKind;
    use crate::program::MachineType;
    use crate::trace::RecordingSink;

    fn run_once(program: &Program, config: &CheckerConfig) -> (Result<SchedulerState>, Schedule) {
        let context = CheckContext::unlimited();
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let result = Scheduler::new(program, config, &context, &mut schedule, &mut policy).run();
        (result, schedule)
    }

    /// Start machine creates `n` workers and each sends `Done` back.
    fn fan_in(n: i64) -> Program {
        let main = MachineType::builder("Main")
            .var("done", 0)
            .start("Run")
            .state("Run", move |s| {
                s.entry(move |ctx, _| {
                    for _ in 0..n {
                        let w = ctx.create("Worker", Some(Value::Machine(ctx.id().clone())))?;
                        ctx.send(&w, "Go", None)?;
                    }
                    Ok(())
                })
                .on("Done", |ctx, _| {
                    let d = ctx.get_int("done")?;
                    ctx.set("done", d + 1)
                })
            })
            .build()
            .unwrap();
        let worker = MachineType::builder("Worker")
            .var("main", Value::Null)
            .start("Init")
            .state("Init", |s| {
                s.entry(|ctx, p| ctx.set("main", p.cloned().unwrap_or_default()))
                    .on("Go", |ctx, _| {
                        let main = ctx.get("main")?.as_machine().cloned();
                        if let Some(main) = main {
                            ctx.send(&main, "Done", None)?;
                        }
                        Ok(())
                    })
            })
            .build()
            .unwrap();
        Program::builder("fan_in")
            .machine(main)
            .machine(worker)
            .start("Main")
            .build()
            .unwrap()
    }

    #[test]
    fn test_creation_has_absolute_priority() {
        let program = fan_in(2);
        let config = CheckerConfig::default();
        let context = CheckContext::unlimited();
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let mut scheduler = Scheduler::new(&program, &config, &context, &mut schedule, &mut policy);

        scheduler.start().unwrap();
        assert_eq!(scheduler.candidates(), vec![MachineId::new("Main", 0)]);
        scheduler.step().unwrap();
        scheduler.step().unwrap();
        // Worker(0) now holds Done, but Main's next message creates Worker(1).
        let w0 = MachineId::new("Worker", 0);
        assert_eq!(scheduler.machine(&w0).unwrap().buffer().len(), 1);
        assert_eq!(scheduler.candidates(), vec![MachineId::new("Main", 0)]);
        scheduler.step().unwrap();
        assert!(scheduler.machine(&MachineId::new("Worker", 1)).unwrap().is_started());
        assert_eq!(scheduler.candidates().len(), 2);
    }

    #[test]
    fn test_fan_in_terminates_cleanly() {
        let program = fan_in(3);
        let (result, schedule) = run_once(&program, &CheckerConfig::default());
        assert_eq!(result.unwrap(), SchedulerState::Terminated);
        // 3 creations, 3 Go, 3 Done.
        assert_eq!(schedule.scheduler_depth(), 9);
        assert_eq!(schedule.registry().creation_order().len(), 4);
        assert!(schedule.num_backtracks_in_schedule() > 0);
    }

    #[test]
    fn test_step_bound_without_failure_ends_schedule() {
        let program = fan_in(3);
        let config = CheckerConfig::default().with_max_step_bound(4);
        let (result, schedule) = run_once(&program, &config);
        assert_eq!(result.unwrap(), SchedulerState::StepBoundExceeded);
        assert_eq!(schedule.scheduler_depth(), 4);

        let config = config.with_fail_on_max_step_bound(true);
        let (result, _) = run_once(&program, &config);
        assert!(matches!(
            result,
            Err(CheckerError::Bug(BugFound::StepBoundExceeded { bound: 4 }))
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let looper = MachineType::builder("Loop")
            .start("S")
            .state("S", |s| {
                s.entry(|ctx, _| {
                    let me = ctx.id().clone();
                    ctx.send(&me, "Tick", None)
                })
                .on("Tick", |ctx, _| {
                    let me = ctx.id().clone();
                    ctx.send(&me, "Tick", None)
                })
            })
            .build()
            .unwrap();
        let program = Program::builder("loop").machine(looper).start("Loop").build().unwrap();

        let (result, _) = run_once(&program, &CheckerConfig::default().with_detect_cycles(true));
        assert!(matches!(result, Err(CheckerError::Bug(BugFound::Cycle { step: 1 }))));

        let (result, _) = run_once(&program, &CheckerConfig::default().with_max_step_bound(50));
        assert_eq!(result.unwrap(), SchedulerState::StepBoundExceeded);
    }

    #[test]
    fn test_synchronous_events_run_first() {
        let a = MachineType::builder("A")
            .start("S")
            .state("S", |s| {
                s.entry(|ctx, _| {
                    let b = ctx.create("B", None)?;
                    ctx.create("C", Some(Value::Machine(b.clone())))?;
                    ctx.send(&b, "Slow", None)
                })
            })
            .build()
            .unwrap();
        let b = MachineType::builder("B")
            .start("S")
            .state("S", |s| s.ignore("Slow").ignore("Reply"))
            .build()
            .unwrap();
        let c = MachineType::builder("C")
            .start("S")
            .state("S", |s| {
                s.entry(|ctx, p| match p.and_then(Value::as_machine).cloned() {
                    Some(b) => ctx.send(&b, "Reply", None),
                    None => Ok(()),
                })
            })
            .build()
            .unwrap();
        let program = Program::builder("sync")
            .machine(a)
            .machine(b)
            .machine(c)
            .start("A")
            .synchronous("Reply")
            .build()
            .unwrap();

        let sink = Arc::new(RecordingSink::new());
        let context = CheckContext::unlimited().with_sink(sink.clone());
        let config = CheckerConfig::default();
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let end = Scheduler::new(&program, &config, &context, &mut schedule, &mut policy)
            .run()
            .unwrap();
        assert_eq!(end, SchedulerState::Terminated);

        let events: Vec<String> = sink
            .dispatches()
            .into_iter()
            .map(|(_, e)| e.name().to_string())
            .collect();
        // Both creations, then C's synchronous Reply before A's Slow.
        assert_eq!(events, vec!["_create_machine", "_create_machine", "Reply", "Slow"]);
    }

    #[test]
    fn test_do_not_interleave_filters_candidates() {
        let hub = MachineType::builder("Hub")
            .start("S")
            .state("S", |s| {
                s.entry(|ctx, _| {
                    ctx.create("Spoke", Some(Value::from("Commit")))?;
                    ctx.create("Spoke", Some(Value::from("Abort")))?;
                    Ok(())
                })
                .ignore("Commit")
                .ignore("Abort")
            })
            .build()
            .unwrap();
        let spoke = MachineType::builder("Spoke")
            .start("S")
            .state("S", |s| {
                s.entry(|ctx, p| {
                    let hub = MachineId::new("Hub", 0);
                    let event = p.and_then(Value::as_str).unwrap_or("Commit").to_string();
                    ctx.send(&hub, event, None)
                })
            })
            .build()
            .unwrap();
        let program = Program::builder("hub")
            .machine(hub)
            .machine(spoke)
            .start("Hub")
            .do_not_interleave("Abort", ["Commit"])
            .build()
            .unwrap();

        let config = CheckerConfig::default().with_interleave_reduction(true);
        let context = CheckContext::unlimited();
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let mut scheduler = Scheduler::new(&program, &config, &context, &mut schedule, &mut policy);
        scheduler.start().unwrap();
        scheduler.step().unwrap();
        scheduler.step().unwrap();
        // Spoke(0) holds Commit, Spoke(1) holds Abort which may not be interleaved with Commit.
        assert_eq!(scheduler.candidates(), vec![MachineId::new("Spoke", 0)]);

        let config = CheckerConfig::default();
        let mut schedule = Schedule::new();
        let mut orchestrator = Orchestrator::new(OrchestratorKind::Program, 0, LearningTable::new());
        let mut policy = ExplorationPolicy::new(&mut orchestrator);
        let mut scheduler = Scheduler::new(&program, &config, &context, &mut schedule, &mut policy);
        scheduler.start().unwrap();
        scheduler.step().unwrap();
        scheduler.step().unwrap();
        assert_eq!(scheduler.candidates().len(), 2);
    }
}
