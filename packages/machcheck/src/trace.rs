//! Trace sinks: observe a run without influencing it.
//!
//! The scheduler reports every machine creation, every resolved choice and
//! every dispatched message to a [`TraceSink`]. Sinks never decide and never
//! mutate checker state. They run synchronously, in step order.
//!
//! ```text
//! step
//!  → choose machine        on_schedule_choice
//!  → dispatch message      on_dispatch
//!      → handler chooses   on_data_choice
//!      → handler creates   on_create_machine
//! end of schedule          on_finished_iteration
//! ```
//!
//! [`TracingSink`] forwards to `tracing`. [`RecordingSink`] keeps everything
//! in memory, which is what determinism and replay tests compare.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::core::{Event, MachineId, Message};
use crate::error::BugFound;
use crate::value::Value;

/// Observer of one or more runs.
///
/// Shared between workers, so implementations must be `Send + Sync`.
pub trait TraceSink: Send + Sync {
    fn on_create_machine(&self, _step: usize, _id: &MachineId) {}

    fn on_schedule_choice(&self, _depth: usize, _choice: &MachineId) {}

    fn on_data_choice(&self, _depth: usize, _choice: &Value) {}

    fn on_dispatch(&self, _step: usize, _message: &Message) {}

    fn on_finished_iteration(&self, _iteration: usize, _steps: usize, _bug: Option<&BugFound>) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TraceSink for NoopSink {}

/// Sink that logs through `tracing` at trace/debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn on_create_machine(&self, step: usize, id: &MachineId) {
        trace!(step, machine = %id, "machine created");
    }

    fn on_schedule_choice(&self, depth: usize, choice: &MachineId) {
        trace!(depth, machine = %choice, "schedule choice");
    }

    fn on_data_choice(&self, depth: usize, choice: &Value) {
        trace!(depth, value = %choice, "data choice");
    }

    fn on_dispatch(&self, step: usize, message: &Message) {
        trace!(step, %message, "dispatch");
    }

    fn on_finished_iteration(&self, iteration: usize, steps: usize, bug: Option<&BugFound>) {
        match bug {
            Some(bug) => debug!(iteration, steps, %bug, "schedule finished with bug"),
            None => debug!(iteration, steps, "schedule finished"),
        }
    }
}

/// One recorded trace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    Created(MachineId),
    ScheduleChoice(usize, MachineId),
    DataChoice(usize, Value),
    Dispatched { target: MachineId, event: Event },
    Finished { iteration: usize, steps: usize, bug: bool },
}

/// Maximum number of entries a [`RecordingSink`] retains.
const MAX_TRACE_ENTRIES: usize = 100_000;

/// Sink that records entries in memory, oldest dropped first past a cap.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<VecDeque<TraceEntry>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: TraceEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() >= MAX_TRACE_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Everything recorded so far.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// The `(target, event)` sequence of dispatched messages.
    pub fn dispatches(&self) -> Vec<(MachineId, Event)> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter_map(|e| match e {
                TraceEntry::Dispatched { target, event } => Some((target.clone(), event.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of finished iterations recorded.
    pub fn iterations(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| matches!(e, TraceEntry::Finished { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl TraceSink for RecordingSink {
    fn on_create_machine(&self, _step: usize, id: &MachineId) {
        self.push(TraceEntry::Created(id.clone()));
    }

    fn on_schedule_choice(&self, depth: usize, choice: &MachineId) {
        self.push(TraceEntry::ScheduleChoice(depth, choice.clone()));
    }

    fn on_data_choice(&self, depth: usize, choice: &Value) {
        self.push(TraceEntry::DataChoice(depth, choice.clone()));
    }

    fn on_dispatch(&self, _step: usize, message: &Message) {
        self.push(TraceEntry::Dispatched {
            target: message.target.clone(),
            event: message.event.clone(),
        });
    }

    fn on_finished_iteration(&self, iteration: usize, steps: usize, bug: Option<&BugFound>) {
        self.push(TraceEntry::Finished {
            iteration,
            steps,
            bug: bug.is_some(),
        });
    }
}
