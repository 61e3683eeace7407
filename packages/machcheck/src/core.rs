//! Core identities for the checker: events, machine ids and messages.
//!
//! # Overview
//!
//! - [`Event`] = a named, immutable identity shared by every machine that
//!   sends, handles, defers or ignores it
//! - [`MachineId`] = `(type, per-type creation index)`, stable across runs
//! - [`Message`] = an event in flight towards a target machine
//!
//! Ids are structural on purpose. The same program explored twice creates
//! machines in the same order, so `Client(1)` in a captured schedule names
//! the same machine when that schedule is replayed in another process.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Reserved name of the machine-creation event.
pub const CREATE_MACHINE_EVENT: &str = "_create_machine";

/// Reserved name of the halt event.
pub const HALT_EVENT: &str = "halt";

/// A named event identity.
///
/// Events compare, hash and order by name only. The `sync` flag is a
/// property of the definition: messages carrying a synchronous event are
/// scheduled ahead of ordinary asynchronous sends.
///
/// # Example
///
/// ```
/// use machcheck::Event;
///
/// let ping = Event::new("Ping");
/// let reply = Event::synchronous("Reply");
///
/// assert_eq!(ping, Event::from("Ping"));
/// assert!(reply.is_sync());
/// assert!(Event::halt().is_halt());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Event {
    name: Arc<str>,
    #[serde(default)]
    sync: bool,
}

impl Event {
    /// Create an ordinary asynchronous event.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            sync: false,
        }
    }

    /// Create an event that is scheduled with synchronous priority.
    pub fn synchronous(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            sync: true,
        }
    }

    /// The reserved machine-creation event.
    pub fn create_machine() -> Self {
        Self::new(CREATE_MACHINE_EVENT)
    }

    /// The reserved halt event.
    pub fn halt() -> Self {
        Self::new(HALT_EVENT)
    }

    /// The event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the reserved halt event.
    pub fn is_halt(&self) -> bool {
        &*self.name == HALT_EVENT
    }

    /// Whether this is the reserved machine-creation event.
    pub fn is_create_machine(&self) -> bool {
        &*self.name == CREATE_MACHINE_EVENT
    }

    /// Whether this event is one of the two reserved identities.
    pub fn is_reserved(&self) -> bool {
        self.is_halt() || self.is_create_machine()
    }

    /// Whether messages carrying this event get synchronous priority.
    pub fn is_sync(&self) -> bool {
        self.sync
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::new(name)
    }
}

impl From<&Event> for Event {
    fn from(event: &Event) -> Self {
        event.clone()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sync {
            write!(f, "Event({}, sync)", self.name)
        } else {
            write!(f, "Event({})", self.name)
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity of a machine instance.
///
/// Equality is structural on `(type, index)` where `index` counts the
/// machines of that type in creation order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId {
    type_name: Arc<str>,
    index: usize,
}

impl MachineId {
    /// Create an id for the `index`-th machine of `type_name`.
    pub fn new(type_name: impl AsRef<str>, index: usize) -> Self {
        Self {
            type_name: Arc::from(type_name.as_ref()),
            index,
        }
    }

    /// The machine type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The per-type creation index.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.index)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.index)
    }
}

/// An event travelling to a target machine.
///
/// Immutable once built. The queue that holds it owns it until it is
/// dequeued, after which the dispatch call owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// The event carried.
    pub event: Event,
    /// The receiving machine.
    pub target: MachineId,
    /// The machine that sent it (`None` for the initial creation message).
    pub sender: Option<MachineId>,
    /// Optional payload.
    pub payload: Option<Value>,
}

impl Message {
    /// Build a message.
    pub fn new(
        event: impl Into<Event>,
        target: MachineId,
        sender: Option<MachineId>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            event: event.into(),
            target,
            sender,
            payload,
        }
    }

    /// Whether this message creates (starts) its target.
    pub fn is_create_machine(&self) -> bool {
        self.event.is_create_machine()
    }

    /// Whether this message carries a synchronous event.
    pub fn is_sync(&self) -> bool {
        self.event.is_sync()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sender {
            Some(sender) => write!(f, "{} -[{}]-> {}", sender, self.event, self.target),
            None => write!(f, "-[{}]-> {}", self.event, self.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_equality_ignores_sync_flag() {
        assert_eq!(Event::new("Reply"), Event::synchronous("Reply"));
        assert_ne!(Event::new("Ping"), Event::new("Pong"));
    }

    #[test]
    fn test_reserved_events() {
        assert!(Event::halt().is_halt());
        assert!(Event::create_machine().is_create_machine());
        assert!(Event::halt().is_reserved());
        assert!(!Event::new("Ping").is_reserved());
    }

    #[test]
    fn test_machine_id_is_structural() {
        let a = MachineId::new("Client", 1);
        let b = MachineId::new(String::from("Client"), 1);
        assert_eq!(a, b);
        assert_ne!(a, MachineId::new("Client", 2));
        assert_ne!(a, MachineId::new("Server", 1));
        assert_eq!(a.to_string(), "Client(1)");
    }

    #[test]
    fn test_machine_id_serde_roundtrip() {
        let id = MachineId::new("Server", 3);
        let json = serde_json::to_string(&id).unwrap();
        let back: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_message_display() {
        let msg = Message::new(
            "Ping",
            MachineId::new("Server", 0),
            Some(MachineId::new("Client", 0)),
            None,
        );
        assert_eq!(msg.to_string(), "Client(0) -[Ping]-> Server(0)");
        assert!(!msg.is_create_machine());
    }
}
