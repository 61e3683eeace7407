//! Blocking receives and the ordering of what happens when they resume.
//!
//! A machine that calls [`MachineContext::receive`](crate::MachineContext::receive)
//! blocks on a named [`Continuation`]. While blocked, every message whose
//! event is neither `halt` nor in the continuation's resumable set stays in
//! the queue. When a resumable message arrives, the resume handler runs and
//! the machine then unblocks in three phases:
//!
//! ```text
//! resume ─► [exit pending?] ─► [entry pending?] ─► clear all continuations
//!              │ re-blocked        │ re-blocked
//!              └──── stop ─────────┴──── stop
//! ```
//!
//! Each phase runs only while the machine stays unblocked. A transition
//! requested while blocked is parked as a [`PendingTransition`] and replayed
//! by the first two phases.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::core::{Event, Message};
use crate::error::Result;
use crate::machine::MachineContext;
use crate::program::Vars;
use crate::value::Value;

/// Resume handler, called with the message that unblocked the machine.
pub type ResumeFn = Arc<dyn Fn(&mut MachineContext<'_>, &Message) -> Result<()> + Send + Sync>;

/// Clear handler, resets the continuation's scratch variables.
pub type ClearFn = Arc<dyn Fn(&mut Vars) + Send + Sync>;

/// A named blocking receive declared on a machine type.
#[derive(Clone)]
pub struct Continuation {
    name: String,
    events: BTreeSet<Event>,
    resume: ResumeFn,
    clear: Option<ClearFn>,
}

impl Continuation {
    pub(crate) fn new(
        name: String,
        events: BTreeSet<Event>,
        resume: ResumeFn,
        clear: Option<ClearFn>,
    ) -> Self {
        Self {
            name,
            events,
            resume,
            clear,
        }
    }

    /// The continuation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The events that resume a machine blocked here.
    pub fn events(&self) -> &BTreeSet<Event> {
        &self.events
    }

    /// Whether `event` resumes a machine blocked here.
    pub fn resumes_on(&self, event: &Event) -> bool {
        self.events.contains(event)
    }

    /// Whether a machine blocked here leaves `event` in its queue.
    pub fn is_deferred(&self, event: &Event) -> bool {
        !event.is_halt() && !self.resumes_on(event)
    }

    pub(crate) fn resume_fn(&self) -> &ResumeFn {
        &self.resume
    }

    /// Run the clear handler, if any.
    pub fn clear(&self, vars: &mut Vars) {
        if let Some(clear) = &self.clear {
            clear(vars);
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("name", &self.name)
            .field("events", &self.events)
            .field("has_clear", &self.clear.is_some())
            .finish()
    }
}

/// A state transition parked while the machine was blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PendingTransition {
    /// State whose exit action still has to run.
    pub exit: Option<String>,
    /// State to enter afterwards, with its entry payload.
    pub entry: Option<(String, Option<Value>)>,
}

impl PendingTransition {
    /// Park a full `exit(from) → entry(to)` transition.
    pub fn goto(from: impl Into<String>, to: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            exit: Some(from.into()),
            entry: Some((to.into(), payload)),
        }
    }

    /// Park only the entry half (the exit already ran before blocking).
    pub fn entry_only(to: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            exit: None,
            entry: Some((to.into(), payload)),
        }
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.exit.is_none() && self.entry.is_none()
    }
}

/// One phase of the post-resume unblock sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockPhase {
    /// Run the parked state-exit action.
    Exit,
    /// Enter the parked target state.
    Entry,
    /// Run the clear handler of every continuation.
    Clear,
}

impl UnblockPhase {
    /// The phases in the order they must run.
    pub const ORDER: [UnblockPhase; 3] = [UnblockPhase::Exit, UnblockPhase::Entry, UnblockPhase::Clear];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cont(events: &[&str]) -> Continuation {
        Continuation::new(
            "wait".into(),
            events.iter().map(|e| Event::new(*e)).collect(),
            Arc::new(|_, _| Ok(())),
            None,
        )
    }

    #[test]
    fn test_deferral_while_blocked() {
        let c = cont(&["Ready"]);
        assert!(c.is_deferred(&Event::new("Stop")));
        assert!(!c.is_deferred(&Event::new("Ready")));
        assert!(!c.is_deferred(&Event::halt()));
    }

    #[test]
    fn test_clear_runs_handler() {
        let c = Continuation::new(
            "wait".into(),
            [Event::new("Ready")].into_iter().collect(),
            Arc::new(|_, _| Ok(())),
            Some(Arc::new(|vars: &mut Vars| {
                vars.insert("tmp".into(), Value::Null);
            })),
        );
        let mut vars = Vars::new();
        vars.insert("tmp".into(), Value::Int(4));
        c.clear(&mut vars);
        assert_eq!(vars.get("tmp"), Some(&Value::Null));
    }

    #[test]
    fn test_pending_transition() {
        let p = PendingTransition::goto("A", "B", None);
        assert!(!p.is_empty());
        assert_eq!(p.exit.as_deref(), Some("A"));
        assert!(PendingTransition::default().is_empty());
        assert_eq!(
            UnblockPhase::ORDER,
            [UnblockPhase::Exit, UnblockPhase::Entry, UnblockPhase::Clear]
        );
    }
}
