//! Structured error types for the checker.
//!
//! `CheckerError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Every step of a schedule either succeeds, raises a
//! [`BugFound`] that ends only the current schedule, or raises an error that
//! ends the whole search.
//!
//! # Error classes
//!
//! | Class               | Scope                 | Example                         |
//! |---------------------|-----------------------|---------------------------------|
//! | `Specification`     | fatal                 | unhandled event, bad field      |
//! | `Bug`               | current schedule only | assertion failure, deadlock     |
//! | `Resource`          | aborts the search     | timeout, memout                 |
//! | `ReplayDivergence`  | fatal                 | recorded choice not available   |
//! | `Internal`          | fatal (engine bug)    | dequeue without a prior peek    |
//! | `Persistence`       | caller decides        | schedule file unreadable        |
//!
//! # Example
//!
//! ```
//! use machcheck::{BugFound, CheckerError, ErrorClass};
//!
//! let err = CheckerError::from(BugFound::Assertion {
//!     machine: None,
//!     message: "balance went negative".into(),
//! });
//! assert_eq!(err.class(), ErrorClass::Bug);
//! assert!(err.is_schedule_scoped());
//! assert!(!err.is_fatal());
//! ```

use std::fmt;

use thiserror::Error;

use crate::core::{Event, MachineId};
use crate::value::Value;

/// Result alias used throughout the crate.
pub type Result<T, E = CheckerError> = std::result::Result<T, E>;

// =============================================================================
// Error Class
// =============================================================================

/// Coarse classification deciding how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The program under test is malformed.
    Specification,
    /// A bug in the program under test was found.
    Bug,
    /// A time or memory budget ran out.
    Resource,
    /// A replayed schedule no longer matches the program.
    ReplayDivergence,
    /// The engine itself misbehaved.
    Internal,
    /// Reading or writing an artifact failed.
    Persistence,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Specification => write!(f, "specification_error"),
            ErrorClass::Bug => write!(f, "bug_found"),
            ErrorClass::Resource => write!(f, "resource_exceeded"),
            ErrorClass::ReplayDivergence => write!(f, "replay_divergence"),
            ErrorClass::Internal => write!(f, "internal_error"),
            ErrorClass::Persistence => write!(f, "persistence_error"),
        }
    }
}

// =============================================================================
// Specification Errors
// =============================================================================

/// The program under test (or its definition) is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecificationError {
    /// An event reached a state that neither handles, defers nor ignores it.
    #[error("{machine} received {event} in state {state} with no handler registered")]
    UnhandledEvent {
        machine: MachineId,
        state: String,
        event: Event,
    },

    /// A handler read or wrote a variable the machine type never declared.
    #[error("{machine} accessed undeclared field `{field}`")]
    IllegalFieldAccess { machine: MachineId, field: String },

    /// A transition or start declaration names a state that does not exist.
    #[error("machine type {machine_type} has no state named `{state}`")]
    UnknownState { machine_type: String, state: String },

    /// A creation request names a machine type the program does not define.
    #[error("program defines no machine type named `{name}`")]
    UnknownMachineType { name: String },

    /// A `receive` names a continuation the machine type does not define.
    #[error("machine type {machine_type} has no continuation named `{name}`")]
    UnknownContinuation { machine_type: String, name: String },

    /// A state registers two reactions to the same event.
    #[error("state {machine_type}.{state} registers {event} more than once")]
    DuplicateHandler {
        machine_type: String,
        state: String,
        event: Event,
    },

    /// Two states share a name.
    #[error("machine type {machine_type} declares state `{state}` twice")]
    DuplicateState { machine_type: String, state: String },

    /// Two continuations share a name.
    #[error("machine type {machine_type} declares continuation `{name}` twice")]
    DuplicateContinuation { machine_type: String, name: String },

    /// Two machine types (or monitors) share a name.
    #[error("program declares machine type `{name}` twice")]
    DuplicateMachineType { name: String },

    /// A machine type was built without a start state.
    #[error("machine type {machine_type} has no start state")]
    MissingStartState { machine_type: String },

    /// A state defers or ignores `halt` or `_create_machine`.
    #[error("state {machine_type}.{state} may not defer or ignore reserved event {event}")]
    ReservedEventDeferred {
        machine_type: String,
        state: String,
        event: Event,
    },

    /// A continuation resumes on no event at all.
    #[error("continuation {machine_type}.{name} has an empty resumable event set")]
    EmptyContinuation { machine_type: String, name: String },

    /// The program has no start machine type.
    #[error("program has no start machine type")]
    MissingStartMachine,

    /// A monitor tried to send, create, choose or block.
    #[error("monitor {monitor} may not {action}")]
    IllegalMonitorAction {
        monitor: MachineId,
        action: &'static str,
    },

    /// A data choice was requested over an empty candidate set.
    #[error("{machine} requested a choice over no candidates")]
    EmptyChoice { machine: MachineId },

    /// A handler combined state-changing requests that cannot be honoured
    /// together, such as raising an event and blocking in one invocation.
    #[error("{machine}: illegal transition, {reason}")]
    IllegalTransition {
        machine: MachineId,
        reason: &'static str,
    },

    /// A handler popped the last state off the stack.
    #[error("{machine} popped its only remaining state")]
    PopEmptyStack { machine: MachineId },
}

// =============================================================================
// Bugs
// =============================================================================

/// A bug in the program under test. Ends the current schedule only.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BugFound {
    /// An `assert` failed in a machine or monitor.
    #[error("assertion failed{}: {message}", .machine.as_ref().map(|m| format!(" in {}", m)).unwrap_or_default())]
    Assertion {
        machine: Option<MachineId>,
        message: String,
    },

    /// Execution stopped while live machines still held undeliverable messages.
    #[error("deadlock: {} machine(s) hold undeliverable messages", .machines.len())]
    Deadlock { machines: Vec<MachineId> },

    /// A global state recurred within one schedule.
    #[error("cycle detected: state at step {step} was already visited")]
    Cycle { step: usize },

    /// The step bound was hit and the configuration treats that as a bug.
    #[error("step bound of {bound} exceeded")]
    StepBoundExceeded { bound: usize },

    /// A monitor was left in a hot state when execution stopped.
    #[error("liveness violation: monitor {monitor} ended in hot state {state}")]
    Liveness { monitor: MachineId, state: String },
}

// =============================================================================
// Resource Errors
// =============================================================================

/// A budget ran out. Aborts the whole search.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceExceeded {
    #[error("time limit of {limit_secs}s exceeded")]
    Timeout { limit_secs: f64 },

    #[error("memory limit of {limit_mb} MB exceeded ({used_mb:.1} MB in use)")]
    Memout { limit_mb: f64, used_mb: f64 },
}

// =============================================================================
// Replay Divergence
// =============================================================================

/// A replayed schedule does not match what the program now does.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayDivergence {
    /// The recorded machine is not among the live candidates.
    #[error("depth {depth}: recorded schedule choice {expected:?} not among candidates {candidates:?}")]
    ScheduleChoice {
        depth: usize,
        expected: Option<MachineId>,
        candidates: Vec<MachineId>,
    },

    /// The recorded value is not among the live candidates.
    #[error("depth {depth}: recorded data choice {expected:?} not among candidates {candidates:?}")]
    DataChoice {
        depth: usize,
        expected: Option<Value>,
        candidates: Vec<Value>,
    },

    /// A live machine was created where the recording created another one.
    #[error("creation #{position}: recorded {expected:?}, program created {actual}")]
    MachineCreation {
        position: usize,
        expected: Option<MachineId>,
        actual: MachineId,
    },
}

// =============================================================================
// Checker Error
// =============================================================================

/// Top-level error type for the checker.
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error(transparent)]
    Specification(#[from] SpecificationError),

    #[error(transparent)]
    Bug(#[from] BugFound),

    #[error(transparent)]
    Resource(#[from] ResourceExceeded),

    #[error("replay diverged: {0}")]
    ReplayDivergence(#[from] ReplayDivergence),

    #[error("internal engine error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CheckerError {
    /// Build an internal (engine bug) error.
    pub fn internal(message: impl Into<String>) -> Self {
        CheckerError::Internal(message.into())
    }

    /// Build an assertion failure.
    pub fn assertion(machine: Option<MachineId>, message: impl Into<String>) -> Self {
        CheckerError::Bug(BugFound::Assertion {
            machine,
            message: message.into(),
        })
    }

    /// The class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            CheckerError::Specification(_) => ErrorClass::Specification,
            CheckerError::Bug(_) => ErrorClass::Bug,
            CheckerError::Resource(_) => ErrorClass::Resource,
            CheckerError::ReplayDivergence(_) => ErrorClass::ReplayDivergence,
            CheckerError::Internal(_) => ErrorClass::Internal,
            CheckerError::Io(_) | CheckerError::Json(_) => ErrorClass::Persistence,
        }
    }

    /// True when only the current schedule is affected.
    pub fn is_schedule_scoped(&self) -> bool {
        self.class() == ErrorClass::Bug
    }

    /// True when the search must stop.
    pub fn is_fatal(&self) -> bool {
        !self.is_schedule_scoped()
    }

    /// The bug, if this is a schedule-scoped bug.
    pub fn as_bug(&self) -> Option<&BugFound> {
        match self {
            CheckerError::Bug(bug) => Some(bug),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        let spec: CheckerError = SpecificationError::MissingStartMachine.into();
        assert_eq!(spec.class(), ErrorClass::Specification);
        assert!(spec.is_fatal());

        let bug: CheckerError = BugFound::Deadlock { machines: vec![] }.into();
        assert_eq!(bug.class(), ErrorClass::Bug);
        assert!(bug.is_schedule_scoped());
        assert!(bug.as_bug().is_some());

        let res: CheckerError = ResourceExceeded::Timeout { limit_secs: 1.0 }.into();
        assert_eq!(res.class(), ErrorClass::Resource);
        assert!(res.is_fatal());

        let div: CheckerError = ReplayDivergence::ScheduleChoice {
            depth: 0,
            expected: None,
            candidates: vec![],
        }
        .into();
        assert_eq!(div.class(), ErrorClass::ReplayDivergence);

        assert_eq!(CheckerError::internal("x").class(), ErrorClass::Internal);
    }

    #[test]
    fn test_messages() {
        let err = SpecificationError::UnhandledEvent {
            machine: MachineId::new("Server", 0),
            state: "Idle".into(),
            event: Event::new("Ping"),
        };
        assert_eq!(
            err.to_string(),
            "Server(0) received Ping in state Idle with no handler registered"
        );

        let bug = BugFound::Assertion {
            machine: Some(MachineId::new("Client", 1)),
            message: "boom".into(),
        };
        assert_eq!(bug.to_string(), "assertion failed in Client(1): boom");
    }

    #[test]
    fn test_bug_serde_roundtrip() {
        let bug = BugFound::Liveness {
            monitor: MachineId::new("Progress", 0),
            state: "Waiting".into(),
        };
        let json = serde_json::to_string(&bug).unwrap();
        let back: BugFound = serde_json::from_str(&json).unwrap();
        assert_eq!(bug, back);
    }
}
