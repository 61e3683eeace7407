//! # machcheck
//!
//! A systematic-testing engine for programs written as communicating state
//! machines. It runs the program under a controlled scheduler, explores the
//! interleavings and nondeterministic choices one schedule at a time, and
//! reports assertion failures, deadlocks, cycles and liveness violations
//! together with a schedule that replays the failure exactly.
//!
//! ## Core Concepts
//!
//! - [`Program`]: machine types, monitors, synchronous events and the
//!   do-not-interleave map, built and validated up front
//! - [`Machine`]: a live instance with a state stack, variables, a message
//!   buffer and an optional blocking [`Continuation`]
//! - [`Schedule`]: the choices taken by one run, repeat and backtrack halves
//!   per depth, plus the machine registry
//! - [`Scheduler`]: executes exactly one schedule
//! - [`Explorer`]: moves through the choice tree with a [`SearchStrategy`]
//! - [`Replayer`]: re-executes a schedule and fails on any divergence
//!
//! ## Architecture
//!
//! ```text
//! Explorer ──► SearchStrategy (tasks, LIFO frontier)
//!    │
//!    ▼ one Scheduler per schedule
//! Scheduler ──► ChoicePolicy ──► Schedule (repeat / backtrack per depth)
//!    │              ▲
//!    │              └── Orchestrator (program / random / epsilon-greedy)
//!    ▼ dispatch
//! Machine.process() ──► MachineContext ──► send / create / choose / announce
//!    │
//!    ▼
//! Monitors (observe, assert, hot/cold)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Deterministic replay** - the same program and schedule always produce
//!    the same trace
//! 2. **Deferral never drops** - a deferred message keeps its place until the
//!    receiver can take it
//! 3. **Creation first** - a pending machine creation always runs before
//!    anything else
//! 4. **Exhaustive DFS** - without limits every leaf of the choice tree runs
//!    exactly once, however tasks are split
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use machcheck::{CheckContext, CheckerConfig, Explorer, MachineType, Program};
//!
//! let server = MachineType::builder("Server")
//!     .start("Wait")
//!     .state("Wait", |s| s.on("Ping", |ctx, _| { ctx.halt(); Ok(()) }))
//!     .build()?;
//! let client = MachineType::builder("Client")
//!     .start("Init")
//!     .state("Init", |s| s.entry(|ctx, _| {
//!         let server = ctx.create("Server", None)?;
//!         ctx.send(&server, "Ping", None)
//!     }))
//!     .build()?;
//! let program = Program::builder("ping")
//!     .machine(client)
//!     .machine(server)
//!     .start("Client")
//!     .build()?;
//!
//! let config = CheckerConfig::from_env()?;
//! let context = CheckContext::new(&config);
//! let report = Explorer::new(Arc::new(program), config.clone(), context).run()?;
//! report.write_artifacts(&config.output_folder)?;
//! println!("{}", report);
//! ```

mod choice;
mod config;
mod continuation;
mod core;
mod error;
mod explorer;
mod machine;
mod orchestration;
mod program;
mod queue;
mod replay;
mod report;
mod resource;
mod schedule;
mod scheduler;
mod stats;
mod strategy;
mod trace;
mod value;

// Subscriber setup for binaries and tests
pub mod logging;

// Fixture programs (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export core types
pub use crate::core::{Event, MachineId, Message, CREATE_MACHINE_EVENT, HALT_EVENT};
pub use crate::value::Value;

// Re-export error types
pub use crate::error::{
    BugFound, CheckerError, ErrorClass, ReplayDivergence, ResourceExceeded, Result, SpecificationError,
};

// Re-export program definition types
pub use continuation::{Continuation, PendingTransition, UnblockPhase};
pub use program::{
    Action, Handler, MachineType, MachineTypeBuilder, Program, ProgramBuilder, StateBuilder, StateDef, Temperature,
    Vars,
};

// Re-export machine runtime types
pub use machine::{Environment, Machine, MachineContext, MonitorEnvironment};
pub use queue::MessageQueue;

// Re-export schedule types
pub use choice::{Choice, ChoiceKind};
pub use schedule::{MachineRegistry, Schedule};

// Re-export search types
pub use explorer::Explorer;
pub use orchestration::{LearningTable, Orchestrator, OrchestratorKind};
pub use scheduler::{CheckContext, ChoicePolicy, ExplorationPolicy, Scheduler, SchedulerState};
pub use strategy::{SearchStrategy, SearchTask, StrategyKind};

// Re-export replay types
pub use replay::{replay, ReplayOutcome, Replayer};

// Re-export configuration, budget and observation types
pub use config::{BufferSemantics, CheckerConfig};
pub use resource::{resident_memory_mb, BudgetCheck, ResourceMonitor, Unlimited};
pub use trace::{NoopSink, RecordingSink, TraceEntry, TraceSink, TracingSink};

// Re-export reporting types
pub use report::{BugReport, CheckReport, Verdict};
pub use stats::SearchStatistics;
